//! Hash commands
//!
//! Hashes start in the packed listpack encoding and promote to the hashed
//! `StringMap` when a field or value outgrows `max_map_field_len`, the
//! packed blob would pass `max_listpack_map_bytes`, or a per-field TTL is
//! requested (the packed form has no TTL slots). Promotion is one-way.

use crate::error::{OpResult, OpStatus};
use crate::shard::OpArgs;
use crate::shard_set::ShardSet;
use crate::transaction::{LockMode, Transaction};
use crate::util::{glob_match, parse_i64, parse_scan_opts, upper};
use bytes::Bytes;
use ember_core::{Config, DbIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use resp::{format_double, RespValue};
use std::sync::Arc;
use storage::compact::{HashPayload, Payload};
use storage::listpack::ListPack;
use storage::{CompactValue, DbContext, ObjType, Pos, StringMap};
use tracing::error;

fn now_sec(cntx: &DbContext) -> u32 {
    (cntx.time_now_ms / 1000) as u32
}

/// (is_listpack, packed bytes) of a hash value, for stats upkeep.
fn lp_info(v: &CompactValue) -> (bool, usize) {
    match v.payload() {
        Some(Payload::Hash(HashPayload::ListPack(lp))) => (true, lp.bytes()),
        _ => (false, 0),
    }
}

fn adjust_lp_stats(op: &mut OpArgs<'_>, old: (bool, usize), new: (bool, usize)) {
    let stats = op.shard.db_slice.stats_mut(op.db_cntx.db_index);
    if old.0 {
        stats.listpack_blob_cnt -= 1;
        stats.listpack_bytes -= old.1 as i64;
    }
    if new.0 {
        stats.listpack_blob_cnt += 1;
        stats.listpack_bytes += new.1 as i64;
    }
}

/// Move a packed hash into the hashed encoding. Duplicate fields in the
/// packed blob are a corruption; they are logged and the first wins.
fn promote_to_map(lp: &ListPack, clock: u32) -> Box<StringMap> {
    let mut sm = Box::new(StringMap::new());
    sm.set_time(clock);
    sm.reserve(lp.len() / 2);
    for (f, v) in lp.pairs() {
        if !sm.add_or_skip(&f.to_vec(), &v.to_vec(), None) {
            error!("duplicate field in packed hash during promotion");
        }
    }
    sm
}

fn hash_needs_promotion(config: &Config, lp: &ListPack, field: &[u8], value: &[u8], ttl: bool) -> bool {
    ttl
        || field.len() > config.max_map_field_len
        || value.len() > config.max_map_field_len
        || lp.bytes() + field.len() + value.len() + 16 > config.max_listpack_map_bytes
}

/// Remove the key when its hash became empty; every path that can observe
/// an emptied hash goes through here.
fn remove_if_empty(op: &mut OpArgs<'_>, key: &[u8], pos: Pos) {
    let cntx = op.db_cntx;
    let empty = match op
        .shard
        .db_slice
        .value(cntx.db_index, pos)
        .and_then(|v| v.payload())
    {
        Some(Payload::Hash(HashPayload::ListPack(lp))) => lp.is_empty(),
        Some(Payload::Hash(HashPayload::Map(sm))) => sm.is_empty(),
        _ => false,
    };
    if empty {
        let old = op
            .shard
            .db_slice
            .value(cntx.db_index, pos)
            .map(lp_info)
            .unwrap_or((false, 0));
        adjust_lp_stats(op, old, (false, 0));
        op.shard.db_slice.delete(&cntx, key);
    }
}

/// Find the hash at `key`, or create an empty one in the right initial
/// encoding. Returns (pos, created).
fn find_or_create(
    op: &mut OpArgs<'_>,
    key: &[u8],
    ttl: bool,
) -> OpResult<(Pos, bool)> {
    let cntx = op.db_cntx;
    match op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::Hash))
        .map_err(OpStatus::from)
    {
        Ok(pos) => Ok((pos, false)),
        Err(OpStatus::KeyNotFound) => {
            let (pos, _) = op.shard.db_slice.add_or_find(&cntx, key);
            let clock = now_sec(&cntx);
            op.shard.db_slice.update_value(&cntx, pos, key, |v| {
                if ttl {
                    let mut sm = Box::new(StringMap::new());
                    sm.set_time(clock);
                    v.init_robj(Payload::Hash(HashPayload::Map(sm)));
                } else {
                    v.init_robj(Payload::Hash(HashPayload::ListPack(ListPack::new())));
                }
            });
            Ok((pos, true))
        }
        Err(e) => Err(e),
    }
}

fn op_hset(
    op: &mut OpArgs<'_>,
    key: &[u8],
    fvs: &[(Bytes, Bytes)],
    skip_if_exists: bool,
    ttl_sec: Option<u32>,
) -> OpResult<usize> {
    let cntx = op.db_cntx;
    let config = op.shard.config.clone();
    let (pos, _) = find_or_create(op, key, ttl_sec.is_some())?;
    let clock = now_sec(&cntx);
    let old = op
        .shard
        .db_slice
        .value(cntx.db_index, pos)
        .map(lp_info)
        .unwrap_or((false, 0));

    let fvs = fvs.to_vec();
    let added = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| {
            let Some(Payload::Hash(h)) = v.payload_mut() else {
                return 0;
            };
            let mut added = 0usize;
            for (f, val) in &fvs {
                let promoted = match &*h {
                    HashPayload::ListPack(lp)
                        if hash_needs_promotion(&config, lp, f, val, ttl_sec.is_some()) =>
                    {
                        Some(promote_to_map(lp, clock))
                    }
                    _ => None,
                };
                if let Some(sm) = promoted {
                    *h = HashPayload::Map(sm);
                }
                match h {
                    HashPayload::ListPack(lp) => {
                        if lp.insert_or_replace(f, val, skip_if_exists) {
                            added += 1;
                        }
                    }
                    HashPayload::Map(sm) => {
                        sm.set_time(clock);
                        let done = if skip_if_exists {
                            sm.add_or_skip(f, val, ttl_sec)
                        } else {
                            sm.add_or_update(f, val, ttl_sec)
                        };
                        if done {
                            added += 1;
                        }
                    }
                }
            }
            added
        })
        .unwrap_or(0);

    let new = op
        .shard
        .db_slice
        .value(cntx.db_index, pos)
        .map(lp_info)
        .unwrap_or((false, 0));
    adjust_lp_stats(op, old, new);
    Ok(added)
}

fn op_hget(op: &mut OpArgs<'_>, key: &[u8], field: &[u8]) -> OpResult<Option<Vec<u8>>> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_read_only(&cntx, key, Some(ObjType::Hash))?;
    let clock = now_sec(&cntx);
    let field = field.to_vec();
    let found = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::Hash(HashPayload::ListPack(lp))) => {
                lp.find_pair(&field).map(|(_, val)| val)
            }
            Some(Payload::Hash(HashPayload::Map(sm))) => {
                sm.set_time(clock);
                sm.find(&field).map(|f| f.value().to_vec())
            }
            _ => None,
        })
        .flatten();
    remove_if_empty(op, key, pos);
    Ok(found)
}

/// Live (field, value) pairs of the hash.
fn op_hgetall(op: &mut OpArgs<'_>, key: &[u8]) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_read_only(&cntx, key, Some(ObjType::Hash))?;
    let clock = now_sec(&cntx);
    let pairs = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::Hash(HashPayload::ListPack(lp))) => lp
                .pairs()
                .map(|(f, val)| (f.to_vec(), val.to_vec()))
                .collect(),
            Some(Payload::Hash(HashPayload::Map(sm))) => {
                sm.set_time(clock);
                sm.iter().map(|(f, val, _)| (f.to_vec(), val.to_vec())).collect()
            }
            _ => Vec::new(),
        })
        .unwrap_or_default();
    remove_if_empty(op, key, pos);
    Ok(pairs)
}

fn op_hdel(op: &mut OpArgs<'_>, key: &[u8], fields: &[Bytes]) -> OpResult<usize> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::Hash))?;
    let clock = now_sec(&cntx);
    let old = op
        .shard
        .db_slice
        .value(cntx.db_index, pos)
        .map(lp_info)
        .unwrap_or((false, 0));
    let fields = fields.to_vec();
    let removed = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::Hash(HashPayload::ListPack(lp))) => {
                fields.iter().filter(|f| lp.delete_pair(f)).count()
            }
            Some(Payload::Hash(HashPayload::Map(sm))) => {
                sm.set_time(clock);
                fields.iter().filter(|f| sm.erase(f)).count()
            }
            _ => 0,
        })
        .unwrap_or(0);
    let new = op
        .shard
        .db_slice
        .value(cntx.db_index, pos)
        .map(lp_info)
        .unwrap_or((false, 0));
    adjust_lp_stats(op, old, new);
    remove_if_empty(op, key, pos);
    Ok(removed)
}

fn op_hlen(op: &mut OpArgs<'_>, key: &[u8]) -> OpResult<usize> {
    Ok(op_hgetall(op, key)?.len())
}

fn op_hincrby(op: &mut OpArgs<'_>, key: &[u8], field: &[u8], delta: i64) -> OpResult<i64> {
    let cur = op_hget(op, key, field).or_else(|e| {
        if e == OpStatus::KeyNotFound {
            Ok(None)
        } else {
            Err(e)
        }
    })?;
    let cur = match cur {
        Some(bytes) => parse_i64(&bytes)?,
        None => 0,
    };
    let next = cur.checked_add(delta).ok_or(OpStatus::OutOfRange)?;
    let fv = [(
        Bytes::copy_from_slice(field),
        Bytes::from(next.to_string()),
    )];
    op_hset(op, key, &fv, false, None)?;
    Ok(next)
}

fn op_hincrbyfloat(op: &mut OpArgs<'_>, key: &[u8], field: &[u8], delta: f64) -> OpResult<f64> {
    let cur = op_hget(op, key, field).or_else(|e| {
        if e == OpStatus::KeyNotFound {
            Ok(None)
        } else {
            Err(e)
        }
    })?;
    let cur = match cur {
        Some(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| OpStatus::InvalidValue("hash value is not a float".into()))?,
        None => 0.0,
    };
    let next = cur + delta;
    if next.is_nan() || next.is_infinite() {
        return Err(OpStatus::InvalidFloat);
    }
    let fv = [(
        Bytes::copy_from_slice(field),
        Bytes::from(format_double(next)),
    )];
    op_hset(op, key, &fv, false, None)?;
    Ok(next)
}

fn op_hrandfield(
    op: &mut OpArgs<'_>,
    key: &[u8],
    count: Option<i64>,
) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_read_only(&cntx, key, Some(ObjType::Hash))?;
    let clock = now_sec(&cntx);
    let mut rng = StdRng::from_entropy();
    let picked = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::Hash(HashPayload::ListPack(lp))) => match count {
                None => lp.random_pair(&mut rng).into_iter().collect(),
                Some(n) if n >= 0 => lp.random_pairs_unique(n as usize, &mut rng),
                Some(n) => lp.random_pairs(n.unsigned_abs() as usize, &mut rng),
            },
            Some(Payload::Hash(HashPayload::Map(sm))) => {
                sm.set_time(clock);
                match count {
                    None => sm.random_pair(&mut rng).into_iter().collect(),
                    Some(n) if n >= 0 => {
                        let want = (n as usize).min(sm.upper_bound_size());
                        sm.random_pairs_unique(want, &mut rng)
                    }
                    Some(n) => sm.random_pairs(n.unsigned_abs() as usize, &mut rng),
                }
            }
            _ => Vec::new(),
        })
        .unwrap_or_default();
    remove_if_empty(op, key, pos);
    Ok(picked)
}

/// HSCAN step. On the packed encoding a single pass returns the whole
/// hash and the COUNT hint is ignored; this matches the original engine
/// and is intentional.
fn op_hscan(
    op: &mut OpArgs<'_>,
    key: &[u8],
    cursor: u64,
    pattern: Option<&Bytes>,
    count: usize,
) -> OpResult<(u64, Vec<(Vec<u8>, Vec<u8>)>)> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_read_only(&cntx, key, Some(ObjType::Hash))?;
    let clock = now_sec(&cntx);
    let pattern = pattern.cloned();
    let result = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::Hash(HashPayload::ListPack(lp))) => {
                let items = lp
                    .pairs()
                    .filter(|(f, _)| {
                        pattern
                            .as_ref()
                            .map(|p| glob_match(p, &f.to_vec()))
                            .unwrap_or(true)
                    })
                    .map(|(f, val)| (f.to_vec(), val.to_vec()))
                    .collect();
                (0, items)
            }
            Some(Payload::Hash(HashPayload::Map(sm))) => {
                sm.set_time(clock);
                let mut items = Vec::new();
                let mut cur = cursor;
                let mut steps = 0usize;
                loop {
                    cur = sm.scan(cur, |f, val| {
                        let keep = pattern
                            .as_ref()
                            .map(|p| glob_match(p, f))
                            .unwrap_or(true);
                        if keep {
                            items.push((f.to_vec(), val.to_vec()));
                        }
                    });
                    steps += 1;
                    if cur == 0 || items.len() >= count || steps >= count * 10 {
                        break;
                    }
                }
                (cur, items)
            }
            _ => (0, Vec::new()),
        })
        .unwrap_or((0, Vec::new()));
    Ok(result)
}

// ==================== command handlers ====================

fn pair_args(args: &[Bytes]) -> OpResult<Vec<(Bytes, Bytes)>> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(OpStatus::SyntaxErr);
    }
    Ok(args
        .chunks(2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect())
}

async fn hset_generic(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    cmd: &'static str,
    key: Bytes,
    fvs: Vec<(Bytes, Bytes)>,
    skip_if_exists: bool,
    ttl_sec: Option<u32>,
    raw_args: Vec<Bytes>,
) -> OpResult<usize> {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    tx.schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
        let r = op_hset(op, &key, &fvs, skip_if_exists, ttl_sec);
        if r.is_ok() {
            op.record_journal(cmd, &raw_args);
        }
        r
    }))
    .await
}

pub async fn hset(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let fvs = match pair_args(&args[1..]) {
        Ok(f) => f,
        Err(e) => return e.to_resp(),
    };
    match hset_generic(ss, db, "HSET", args[0].clone(), fvs, false, None, args.to_vec()).await {
        Ok(added) => RespValue::Integer(added as i64),
        Err(e) => e.to_resp(),
    }
}

pub async fn hmset(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let fvs = match pair_args(&args[1..]) {
        Ok(f) => f,
        Err(e) => return e.to_resp(),
    };
    match hset_generic(ss, db, "HMSET", args[0].clone(), fvs, false, None, args.to_vec()).await {
        Ok(_) => RespValue::ok(),
        Err(e) => e.to_resp(),
    }
}

pub async fn hsetnx(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let fvs = vec![(args[1].clone(), args[2].clone())];
    match hset_generic(ss, db, "HSETNX", args[0].clone(), fvs, true, None, args.to_vec()).await {
        Ok(added) => RespValue::Integer(added as i64),
        Err(e) => e.to_resp(),
    }
}

/// HSETEX key seconds field value [field value ...]
pub async fn hsetex(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 4 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let ttl = match parse_i64(&args[1]) {
        Ok(t) if t > 0 && t <= u32::MAX as i64 => t as u32,
        Ok(_) => return OpStatus::InvalidInt.to_resp(),
        Err(e) => return e.to_resp(),
    };
    let fvs = match pair_args(&args[2..]) {
        Ok(f) => f,
        Err(e) => return e.to_resp(),
    };
    match hset_generic(ss, db, "HSETEX", args[0].clone(), fvs, false, Some(ttl), args.to_vec()).await
    {
        Ok(added) => RespValue::Integer(added as i64),
        Err(e) => e.to_resp(),
    }
}

pub async fn hget(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let (key, field) = (args[0].clone(), args[1].clone());
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| op_hget(op, &key, &field)))
        .await;
    match result {
        Ok(Some(v)) => RespValue::bulk(v),
        Ok(None) | Err(OpStatus::KeyNotFound) => RespValue::nil(),
        Err(e) => e.to_resp(),
    }
}

pub async fn hmget(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let fields: Vec<Bytes> = args[1..].to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let mut out = Vec::with_capacity(fields.len());
            for f in &fields {
                out.push(op_hget(op, &key, f).unwrap_or(None));
            }
            Ok(out)
        }))
        .await;
    match result {
        Ok(vals) => RespValue::array(
            vals.into_iter()
                .map(|v| v.map(RespValue::bulk).unwrap_or_else(RespValue::nil))
                .collect(),
        ),
        Err(e) => e.to_resp(),
    }
}

async fn hash_read_all(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    key: Bytes,
) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    tx.schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| op_hgetall(op, &key)))
        .await
}

pub async fn hgetall(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    match hash_read_all(ss, db, args[0].clone()).await {
        Ok(pairs) => RespValue::array(
            pairs
                .into_iter()
                .flat_map(|(f, v)| [RespValue::bulk(f), RespValue::bulk(v)])
                .collect(),
        ),
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn hkeys(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    match hash_read_all(ss, db, args[0].clone()).await {
        Ok(pairs) => {
            RespValue::array(pairs.into_iter().map(|(f, _)| RespValue::bulk(f)).collect())
        }
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn hvals(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    match hash_read_all(ss, db, args[0].clone()).await {
        Ok(pairs) => {
            RespValue::array(pairs.into_iter().map(|(_, v)| RespValue::bulk(v)).collect())
        }
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn hlen(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| op_hlen(op, &key)))
        .await;
    match result {
        Ok(n) => RespValue::Integer(n as i64),
        Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn hexists(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let (key, field) = (args[0].clone(), args[1].clone());
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| op_hget(op, &key, &field)))
        .await;
    match result {
        Ok(Some(_)) => RespValue::Integer(1),
        Ok(None) | Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn hstrlen(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let (key, field) = (args[0].clone(), args[1].clone());
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| op_hget(op, &key, &field)))
        .await;
    match result {
        Ok(Some(v)) => RespValue::Integer(v.len() as i64),
        Ok(None) | Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn hdel(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let fields: Vec<Bytes> = args[1..].to_vec();
    let raw = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_hdel(op, &key, &fields);
            if matches!(r, Ok(n) if n > 0) {
                op.record_journal("HDEL", &raw);
            }
            r
        }))
        .await;
    match result {
        Ok(n) => RespValue::Integer(n as i64),
        Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn hincrby(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let delta = match parse_i64(&args[2]) {
        Ok(d) => d,
        Err(e) => return e.to_resp(),
    };
    let (key, field) = (args[0].clone(), args[1].clone());
    let raw = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_hincrby(op, &key, &field, delta);
            if r.is_ok() {
                op.record_journal("HINCRBY", &raw);
            }
            r
        }))
        .await;
    match result {
        Ok(v) => RespValue::Integer(v),
        Err(e) => e.to_resp(),
    }
}

pub async fn hincrbyfloat(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let delta = match std::str::from_utf8(&args[2])
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
    {
        Some(d) if !d.is_nan() => d,
        _ => return OpStatus::InvalidValue("value is not a valid float".into()).to_resp(),
    };
    let (key, field) = (args[0].clone(), args[1].clone());
    let raw = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_hincrbyfloat(op, &key, &field, delta);
            if r.is_ok() {
                op.record_journal("HINCRBYFLOAT", &raw);
            }
            r
        }))
        .await;
    match result {
        Ok(v) => RespValue::double(v),
        Err(e) => e.to_resp(),
    }
}

/// HRANDFIELD key [count [WITHVALUES]]
pub async fn hrandfield(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.is_empty() || args.len() > 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let count = match args.get(1) {
        Some(a) => match parse_i64(a) {
            Ok(n) => Some(n),
            Err(_) => {
                return OpStatus::InvalidValue("count value is not an integer".into()).to_resp()
            }
        },
        None => None,
    };
    let with_values = match args.get(2) {
        Some(a) if upper(a) == "WITHVALUES" => true,
        Some(_) => return OpStatus::SyntaxErr.to_resp(),
        None => false,
    };
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            op_hrandfield(op, &key, count)
        }))
        .await;
    match result {
        Ok(pairs) => {
            if count.is_none() {
                return pairs
                    .into_iter()
                    .next()
                    .map(|(f, _)| RespValue::bulk(f))
                    .unwrap_or_else(RespValue::nil);
            }
            let items = pairs
                .into_iter()
                .flat_map(|(f, v)| {
                    if with_values {
                        vec![RespValue::bulk(f), RespValue::bulk(v)]
                    } else {
                        vec![RespValue::bulk(f)]
                    }
                })
                .collect();
            RespValue::array(items)
        }
        Err(OpStatus::KeyNotFound) => {
            if count.is_none() {
                RespValue::nil()
            } else {
                RespValue::array(Vec::new())
            }
        }
        Err(e) => e.to_resp(),
    }
}

/// HSCAN key cursor [MATCH pattern] [COUNT count]
pub async fn hscan(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let cursor = match std::str::from_utf8(&args[1])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    {
        Some(c) => c,
        None => return OpStatus::InvalidInt.to_resp(),
    };
    let (pattern, count) = match parse_scan_opts(&args[2..]) {
        Ok(p) => p,
        Err(e) => return e.to_resp(),
    };
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            op_hscan(op, &key, cursor, pattern.as_ref(), count)
        }))
        .await;
    match result {
        Ok((next, items)) => RespValue::array(vec![
            RespValue::bulk(next.to_string()),
            RespValue::array(
                items
                    .into_iter()
                    .flat_map(|(f, v)| [RespValue::bulk(f), RespValue::bulk(v)])
                    .collect(),
            ),
        ]),
        Err(OpStatus::KeyNotFound) => RespValue::array(vec![
            RespValue::bulk("0"),
            RespValue::array(Vec::new()),
        ]),
        Err(e) => e.to_resp(),
    }
}
