//! String commands
//!
//! SET/GET and friends. These are the commands that exercise the tiered
//! engine end to end: GET on an offloaded value resolves through the fetch
//! pipeline, APPEND through the modify pipeline, and overwrites cancel
//! in-flight stashes or release dead segments.

use crate::error::{OpResult, OpStatus};
use crate::shard::OpArgs;
use crate::shard_set::ShardSet;
use crate::transaction::{LockMode, Transaction};
use crate::util::{parse_i64, upper};
use bytes::Bytes;
use ember_core::DbIndex;
use resp::RespValue;
use std::sync::Arc;
use storage::ObjType;
use tokio::sync::oneshot;

/// A string read that may resolve asynchronously through tiered storage.
pub enum StringResult {
    Value(Vec<u8>),
    Pending(oneshot::Receiver<Vec<u8>>),
}

impl StringResult {
    pub async fn resolve(self) -> OpResult<Vec<u8>> {
        match self {
            StringResult::Value(v) => Ok(v),
            StringResult::Pending(rx) => rx.await.map_err(|_| OpStatus::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SetOpts {
    expire_at_ms: Option<u64>,
    nx: bool,
    xx: bool,
    keepttl: bool,
}

fn op_set(op: &mut OpArgs<'_>, key: &[u8], value: &[u8], opts: &SetOpts) -> OpResult<()> {
    let cntx = op.db_cntx;
    let exists = op
        .shard
        .db_slice
        .find_read_only(&cntx, key, None)
        .is_ok();
    if (opts.nx && exists) || (opts.xx && !exists) {
        return Err(OpStatus::Skipped);
    }
    op.shard.prepare_value_overwrite(&cntx, key);
    let (pos, is_new) = op.shard.db_slice.add_or_find(&cntx, key);
    op.shard
        .db_slice
        .update_value(&cntx, pos, key, |v| v.set_string(value));
    if let Some(at) = opts.expire_at_ms {
        op.shard.db_slice.set_expire(&cntx, key, at);
    } else if !is_new && !opts.keepttl {
        op.shard.db_slice.persist(&cntx, key);
    }
    Ok(())
}

fn op_get(op: &mut OpArgs<'_>, key: &[u8]) -> OpResult<StringResult> {
    let cntx = op.db_cntx;
    let shard = &mut *op.shard;
    let pos = shard
        .db_slice
        .find_read_only(&cntx, key, Some(ObjType::String))?;
    let value = shard
        .db_slice
        .value(cntx.db_index, pos)
        .ok_or(OpStatus::KeyNotFound)?;
    if value.is_external() {
        let tiered = shard.tiered.as_mut().ok_or(OpStatus::KeyNotFound)?;
        Ok(StringResult::Pending(tiered.read(cntx.db_index, key, value)))
    } else {
        Ok(StringResult::Value(value.get_string()))
    }
}

fn op_append(op: &mut OpArgs<'_>, key: &[u8], suffix: &[u8]) -> OpResult<AppendResult> {
    let cntx = op.db_cntx;
    let shard = &mut *op.shard;
    match shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::String))
        .map_err(OpStatus::from)
    {
        Ok(pos) => {
            let value = shard
                .db_slice
                .value(cntx.db_index, pos)
                .ok_or(OpStatus::KeyNotFound)?;
            if value.is_external() {
                let tiered = shard.tiered.as_mut().ok_or(OpStatus::KeyNotFound)?;
                let owned = suffix.to_vec();
                let rx = tiered.modify(cntx.db_index, key, value, move |buf| {
                    buf.extend_from_slice(&owned);
                    buf.len()
                });
                return Ok(AppendResult::Pending(rx));
            }
            let suffix = suffix.to_vec();
            let len = shard
                .db_slice
                .update_value(&cntx, pos, key, move |v| {
                    let mut s = v.get_string();
                    s.extend_from_slice(&suffix);
                    v.set_string(&s);
                    s.len()
                })
                .ok_or(OpStatus::KeyNotFound)?;
            Ok(AppendResult::Len(len))
        }
        Err(OpStatus::KeyNotFound) => {
            let (pos, _) = shard.db_slice.add_or_find(&cntx, key);
            shard
                .db_slice
                .update_value(&cntx, pos, key, |v| v.set_string(suffix));
            Ok(AppendResult::Len(suffix.len()))
        }
        Err(e) => Err(e),
    }
}

pub enum AppendResult {
    Len(usize),
    Pending(oneshot::Receiver<usize>),
}

fn op_incrby(op: &mut OpArgs<'_>, key: &[u8], delta: i64) -> OpResult<i64> {
    let cntx = op.db_cntx;
    match op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::String))
        .map_err(OpStatus::from)
    {
        Ok(pos) => {
            let value = op
                .shard
                .db_slice
                .value(cntx.db_index, pos)
                .ok_or(OpStatus::KeyNotFound)?;
            if value.is_external() {
                // numbers never offload (far below the size threshold)
                return Err(OpStatus::InvalidInt);
            }
            let cur = match value.try_get_int() {
                Some(i) => i,
                None => parse_i64(&value.get_string())?,
            };
            let next = cur.checked_add(delta).ok_or(OpStatus::OutOfRange)?;
            op.shard
                .db_slice
                .update_value(&cntx, pos, key, |v| v.set_int(next));
            Ok(next)
        }
        Err(OpStatus::KeyNotFound) => {
            let (pos, _) = op.shard.db_slice.add_or_find(&cntx, key);
            op.shard
                .db_slice
                .update_value(&cntx, pos, key, |v| v.set_int(delta));
            Ok(delta)
        }
        Err(e) => Err(e),
    }
}

fn parse_set_opts(cntx_now: u64, args: &[Bytes]) -> OpResult<SetOpts> {
    let mut opts = SetOpts::default();
    let mut i = 0;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "EX" => {
                i += 1;
                let secs = parse_i64(args.get(i).ok_or(OpStatus::SyntaxErr)?)?;
                if secs <= 0 {
                    return Err(OpStatus::InvalidInt);
                }
                opts.expire_at_ms = Some(cntx_now + secs as u64 * 1000);
            }
            "PX" => {
                i += 1;
                let ms = parse_i64(args.get(i).ok_or(OpStatus::SyntaxErr)?)?;
                if ms <= 0 {
                    return Err(OpStatus::InvalidInt);
                }
                opts.expire_at_ms = Some(cntx_now + ms as u64);
            }
            "NX" => opts.nx = true,
            "XX" => opts.xx = true,
            "KEEPTTL" => opts.keepttl = true,
            _ => return Err(OpStatus::SyntaxErr),
        }
        i += 1;
    }
    if opts.nx && opts.xx {
        return Err(OpStatus::SyntaxErr);
    }
    Ok(opts)
}

// ==================== command handlers ====================

pub async fn set(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let value = args[1].clone();
    let opts = match parse_set_opts(ember_core::time::now_ms(), &args[2..]) {
        Ok(o) => o,
        Err(e) => return e.to_resp(),
    };
    let all_args = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_set(op, &key, &value, &opts);
            if r.is_ok() {
                op.record_journal("SET", &all_args);
            }
            r
        }))
        .await;
    match result {
        Ok(()) => RespValue::ok(),
        Err(OpStatus::Skipped) => RespValue::nil(),
        Err(e) => e.to_resp(),
    }
}

pub async fn get(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| op_get(op, &key)))
        .await;
    match result {
        Ok(r) => match r.resolve().await {
            Ok(v) => RespValue::bulk(v),
            Err(e) => e.to_resp(),
        },
        Err(OpStatus::KeyNotFound) => RespValue::nil(),
        Err(e) => e.to_resp(),
    }
}

pub async fn mget(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.is_empty() {
        return OpStatus::SyntaxErr.to_resp();
    }
    let keys: Vec<Bytes> = args.to_vec();
    let wanted = keys.clone();
    let mut tx = Transaction::new(ss, db, &keys, LockMode::Shared);
    let results = tx
        .execute(
            Arc::new(move |op: &mut OpArgs<'_>| {
                let mut out = Vec::new();
                for key in wanted.iter() {
                    if !op.owns_key(key) {
                        continue;
                    }
                    let r = match op_get(op, key) {
                        Ok(v) => Some(v),
                        Err(_) => None,
                    };
                    out.push((key.clone(), r));
                }
                Ok(out)
            }),
            true,
        )
        .await;

    let mut by_key: std::collections::HashMap<Bytes, Option<Vec<u8>>> =
        std::collections::HashMap::new();
    for (_, r) in results {
        if let Ok(list) = r {
            for (key, item) in list {
                let resolved = match item {
                    Some(sr) => sr.resolve().await.ok(),
                    None => None,
                };
                by_key.insert(key, resolved);
            }
        }
    }
    RespValue::array(
        keys.iter()
            .map(|k| match by_key.get(k).cloned().flatten() {
                Some(v) => RespValue::bulk(v),
                None => RespValue::nil(),
            })
            .collect(),
    )
}

pub async fn append(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let suffix = args[1].clone();
    let all_args = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_append(op, &key, &suffix);
            if r.is_ok() {
                op.record_journal("APPEND", &all_args);
            }
            r
        }))
        .await;
    match result {
        Ok(AppendResult::Len(n)) => RespValue::Integer(n as i64),
        Ok(AppendResult::Pending(rx)) => match rx.await {
            Ok(n) => RespValue::Integer(n as i64),
            Err(_) => OpStatus::Cancelled.to_resp(),
        },
        Err(e) => e.to_resp(),
    }
}

pub async fn strlen(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let cntx = op.db_cntx;
            let pos = op
                .shard
                .db_slice
                .find_read_only(&cntx, &key, Some(ObjType::String))?;
            Ok(op
                .shard
                .db_slice
                .value(cntx.db_index, pos)
                .map(|v| v.size())
                .unwrap_or(0))
        }))
        .await;
    match result {
        Ok(n) => RespValue::Integer(n as i64),
        Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn incrby(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let delta = match parse_i64(&args[1]) {
        Ok(d) => d,
        Err(e) => return e.to_resp(),
    };
    incr_generic(ss, db, args[0].clone(), delta).await
}

pub async fn decrby(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let delta = match parse_i64(&args[1]) {
        Ok(d) => d,
        Err(e) => return e.to_resp(),
    };
    match delta.checked_neg() {
        Some(neg) => incr_generic(ss, db, args[0].clone(), neg).await,
        None => OpStatus::OutOfRange.to_resp(),
    }
}

pub async fn incr(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    incr_generic(ss, db, args[0].clone(), 1).await
}

pub async fn decr(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    incr_generic(ss, db, args[0].clone(), -1).await
}

async fn incr_generic(ss: &Arc<ShardSet>, db: DbIndex, key: Bytes, delta: i64) -> RespValue {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let jkey = key.clone();
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_incrby(op, &key, delta);
            if r.is_ok() {
                let d = Bytes::from(delta.to_string());
                op.record_journal("INCRBY", &[jkey.clone(), d]);
            }
            r
        }))
        .await;
    match result {
        Ok(v) => RespValue::Integer(v),
        Err(e) => e.to_resp(),
    }
}
