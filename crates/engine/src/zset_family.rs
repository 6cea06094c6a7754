//! Sorted-set commands
//!
//! Sorted sets start packed (listpack of (member, score) pairs kept in
//! (score, member) order) and promote to the skip-list encoding when the
//! entry count passes `zset_max_listpack_entries` or a member outgrows
//! `max_map_field_len`. Set algebra (ZUNION/ZINTER/ZDIFF) aggregates
//! per-shard score maps on the coordinator; ZINTER results are sorted by
//! ascending score while ZUNION sorts by the (score, member) tuple, as the
//! original engine does.

use crate::error::{aggregate_status, OpResult, OpStatus};
use crate::shard::OpArgs;
use crate::shard_set::ShardSet;
use crate::transaction::{LockMode, Transaction};
use crate::util::{glob_match, parse_f64, parse_i64, parse_scan_opts, upper};
use bytes::Bytes;
use ember_core::DbIndex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use resp::{format_double, RespValue};
use std::collections::HashMap;
use std::sync::Arc;
use storage::compact::{Payload, ZSetPayload};
use storage::listpack::ListPack;
use storage::sorted_map::{
    InsertFlags, InsertResult, LexBound, LexRange, ScoreBound, ScoreRange, SortedMap,
};
use storage::{ObjType, Pos};
use tokio::sync::mpsc;

// ==================== packed encoding helpers ====================

fn lp_score(v: storage::listpack::LpValue<'_>) -> f64 {
    match v {
        storage::listpack::LpValue::Int(i) => i as f64,
        storage::listpack::LpValue::Str(s) => std::str::from_utf8(s)
            .ok()
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(0.0),
    }
}

/// Entries of a packed sorted set, in (score, member) order.
fn zlp_entries(lp: &ListPack) -> Vec<(Vec<u8>, f64)> {
    let mut out = Vec::with_capacity(lp.len() / 2);
    let mut it = lp.iter();
    while let (Some(m), Some(s)) = (it.next(), it.next()) {
        out.push((m.to_vec(), lp_score(s)));
    }
    out
}

fn zlp_find(lp: &ListPack, member: &[u8]) -> Option<(usize, f64)> {
    let mut idx = 0;
    let mut it = lp.iter();
    while let (Some(m), Some(s)) = (it.next(), it.next()) {
        if m.eq_bytes(member) {
            return Some((idx, lp_score(s)));
        }
        idx += 1;
    }
    None
}

fn zlp_delete(lp: &mut ListPack, member: &[u8]) -> bool {
    match zlp_find(lp, member) {
        Some((pair_idx, _)) => {
            if let Some(off) = lp.offset_of(pair_idx * 2) {
                lp.delete_at(off, 2);
                true
            } else {
                false
            }
        }
        None => false,
    }
}

/// Insert keeping (score, member) order. The member must not be present.
fn zlp_insert(lp: &mut ListPack, member: &[u8], score: f64) {
    let entries = zlp_entries(lp);
    let mut pair_idx = entries.len();
    for (i, (m, s)) in entries.iter().enumerate() {
        let after = score < *s
            || (score == *s && member < m.as_slice());
        if after {
            pair_idx = i;
            break;
        }
    }
    let score_text = format_double(score);
    match lp.offset_of(pair_idx * 2) {
        Some(off) => lp.insert_at(off, &[member, score_text.as_bytes()]),
        None => {
            lp.push(member);
            lp.push(score_text.as_bytes());
        }
    }
}

fn promote_to_skiplist(lp: &ListPack) -> Box<SortedMap> {
    let mut sm = Box::new(SortedMap::new());
    for (m, s) in zlp_entries(lp) {
        let _ = sm.insert(s, &m, InsertFlags::default());
    }
    sm
}

/// Flag-respecting insert for the packed encoding; mirrors
/// `SortedMap::insert`.
fn zlp_flag_insert(
    lp: &mut ListPack,
    score: f64,
    member: &[u8],
    flags: InsertFlags,
) -> Result<InsertResult, storage::sorted_map::NanScore> {
    match zlp_find(lp, member) {
        Some((_, cur)) => {
            if flags.nx {
                return Ok(InsertResult::Skipped);
            }
            let new_score = if flags.incr { cur + score } else { score };
            if new_score.is_nan() {
                return Err(storage::sorted_map::NanScore);
            }
            if (flags.gt && new_score <= cur) || (flags.lt && new_score >= cur) {
                return Ok(InsertResult::Skipped);
            }
            if new_score == cur {
                return Ok(InsertResult::Noop(cur));
            }
            zlp_delete(lp, member);
            zlp_insert(lp, member, new_score);
            Ok(InsertResult::Updated(new_score))
        }
        None => {
            if flags.xx {
                return Ok(InsertResult::Skipped);
            }
            if score.is_nan() {
                return Err(storage::sorted_map::NanScore);
            }
            zlp_insert(lp, member, score);
            Ok(InsertResult::Added(score))
        }
    }
}

// ==================== shared payload views ====================

fn zp_len(z: &ZSetPayload) -> usize {
    z.len()
}

fn zp_entries(z: &ZSetPayload) -> Vec<(Vec<u8>, f64)> {
    match z {
        ZSetPayload::ListPack(lp) => zlp_entries(lp),
        ZSetPayload::SkipList(sm) => sm.iter().map(|(m, s)| (m.to_vec(), s)).collect(),
    }
}

fn zp_score(z: &ZSetPayload, member: &[u8]) -> Option<f64> {
    match z {
        ZSetPayload::ListPack(lp) => zlp_find(lp, member).map(|(_, s)| s),
        ZSetPayload::SkipList(sm) => sm.get_score(member),
    }
}

// ==================== shard ops ====================

fn with_zset<R>(
    op: &mut OpArgs<'_>,
    key: &[u8],
    f: impl FnOnce(&mut ZSetPayload) -> R + 'static,
) -> OpResult<R>
where
    R: 'static,
{
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_read_only(&cntx, key, Some(ObjType::ZSet))?;
    op.shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::ZSet(z)) => Some(f(z)),
            _ => None,
        })
        .flatten()
        .ok_or(OpStatus::KeyNotFound)
}

fn remove_if_empty_zset(op: &mut OpArgs<'_>, key: &[u8], pos: Pos) {
    let cntx = op.db_cntx;
    let empty = matches!(
        op.shard
            .db_slice
            .value(cntx.db_index, pos)
            .and_then(|v| v.payload()),
        Some(Payload::ZSet(z)) if z.is_empty()
    );
    if empty {
        op.shard.db_slice.delete(&cntx, key);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZParams {
    pub flags: InsertFlags,
    pub ch: bool,
}

#[derive(Debug, Default)]
pub struct ZAddResult {
    pub added: usize,
    pub updated: usize,
    /// Set for INCR mode: the new score, or None when skipped.
    pub incr_score: Option<Option<f64>>,
}

pub(crate) fn op_zadd(
    op: &mut OpArgs<'_>,
    key: &[u8],
    params: ZParams,
    pairs: &[(f64, Bytes)],
) -> OpResult<ZAddResult> {
    let cntx = op.db_cntx;
    let config = op.shard.config.clone();

    let pos = match op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::ZSet))
        .map_err(OpStatus::from)
    {
        Ok(pos) => pos,
        Err(OpStatus::KeyNotFound) => {
            if params.flags.xx {
                let mut r = ZAddResult::default();
                if params.flags.incr {
                    r.incr_score = Some(None);
                }
                return Ok(r);
            }
            let (pos, _) = op.shard.db_slice.add_or_find(&cntx, key);
            op.shard.db_slice.update_value(&cntx, pos, key, |v| {
                v.init_robj(Payload::ZSet(ZSetPayload::ListPack(ListPack::new())))
            });
            pos
        }
        Err(e) => return Err(e),
    };

    let pairs = pairs.to_vec();
    let outcome = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| {
            let Some(Payload::ZSet(z)) = v.payload_mut() else {
                return Err(OpStatus::WrongType);
            };
            let mut result = ZAddResult::default();
            for (score, member) in &pairs {
                // promotion: oversized member or entry-count overflow
                let promote = match &*z {
                    ZSetPayload::ListPack(lp) => {
                        member.len() > config.max_map_field_len
                            || lp.len() / 2 + 1 > config.zset_max_listpack_entries
                    }
                    ZSetPayload::SkipList(_) => false,
                };
                if promote {
                    let promoted = match &*z {
                        ZSetPayload::ListPack(lp) => Some(promote_to_skiplist(lp)),
                        ZSetPayload::SkipList(_) => None,
                    };
                    if let Some(sm) = promoted {
                        *z = ZSetPayload::SkipList(sm);
                    }
                }
                let ins = match z {
                    ZSetPayload::ListPack(lp) => {
                        zlp_flag_insert(lp, *score, member, params.flags)
                    }
                    ZSetPayload::SkipList(sm) => sm.insert(*score, member, params.flags),
                };
                let ins = ins.map_err(|_| OpStatus::InvalidFloat)?;
                match ins {
                    InsertResult::Added(s) => {
                        result.added += 1;
                        if params.flags.incr {
                            result.incr_score = Some(Some(s));
                        }
                    }
                    InsertResult::Updated(s) => {
                        result.updated += 1;
                        if params.flags.incr {
                            result.incr_score = Some(Some(s));
                        }
                    }
                    InsertResult::Noop(s) => {
                        if params.flags.incr {
                            result.incr_score = Some(Some(s));
                        }
                    }
                    InsertResult::Skipped => {
                        if params.flags.incr {
                            result.incr_score = Some(None);
                        }
                    }
                }
            }
            Ok(result)
        })
        .unwrap_or(Err(OpStatus::KeyNotFound))?;
    remove_if_empty_zset(op, key, pos);
    Ok(outcome)
}

fn op_zrem(op: &mut OpArgs<'_>, key: &[u8], members: &[Bytes]) -> OpResult<usize> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::ZSet))?;
    let members = members.to_vec();
    let removed = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| match v.payload_mut() {
            Some(Payload::ZSet(ZSetPayload::ListPack(lp))) => {
                members.iter().filter(|m| zlp_delete(lp, m)).count()
            }
            Some(Payload::ZSet(ZSetPayload::SkipList(sm))) => {
                members.iter().filter(|m| sm.delete(m)).count()
            }
            _ => 0,
        })
        .unwrap_or(0);
    remove_if_empty_zset(op, key, pos);
    Ok(removed)
}

/// Range addressing for the unified range extractor.
#[derive(Debug, Clone)]
pub enum ZRangeBy {
    Rank(i64, i64),
    Score(ScoreRange),
    Lex(LexRange),
}

#[derive(Debug, Clone)]
pub struct ZRangeParams {
    pub by: ZRangeBy,
    pub reverse: bool,
    pub offset: usize,
    pub limit: usize,
}

fn normalize_ranks(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    let n = len as i64;
    let mut s = if start < 0 { n + start } else { start };
    let mut e = if end < 0 { n + end } else { end };
    if s < 0 {
        s = 0;
    }
    if e >= n {
        e = n - 1;
    }
    if s > e || s >= n || e < 0 {
        return None;
    }
    Some((s as usize, e as usize))
}

fn extract_range(z: &ZSetPayload, params: &ZRangeParams) -> Vec<(Vec<u8>, f64)> {
    match z {
        ZSetPayload::SkipList(sm) => match &params.by {
            ZRangeBy::Rank(start, end) => match normalize_ranks(sm.len(), *start, *end) {
                Some((s, e)) => sm.range_by_rank(s, e, params.reverse),
                None => Vec::new(),
            },
            ZRangeBy::Score(r) => sm.range_by_score(r, params.offset, params.limit, params.reverse),
            ZRangeBy::Lex(r) => sm.range_by_lex(r, params.offset, params.limit, params.reverse),
        },
        ZSetPayload::ListPack(lp) => {
            let mut entries = zlp_entries(lp);
            if params.reverse {
                entries.reverse();
            }
            let filtered: Vec<(Vec<u8>, f64)> = match &params.by {
                ZRangeBy::Rank(start, end) => {
                    match normalize_ranks(entries.len(), *start, *end) {
                        Some((s, e)) => entries[s..=e].to_vec(),
                        None => Vec::new(),
                    }
                }
                ZRangeBy::Score(r) => entries
                    .into_iter()
                    .filter(|(_, s)| r.contains(*s))
                    .collect(),
                ZRangeBy::Lex(r) => entries
                    .into_iter()
                    .filter(|(m, _)| r.contains(m))
                    .collect(),
            };
            match &params.by {
                ZRangeBy::Rank(..) => filtered,
                _ => filtered
                    .into_iter()
                    .skip(params.offset)
                    .take(params.limit)
                    .collect(),
            }
        }
    }
}

pub(crate) fn op_zrange(
    op: &mut OpArgs<'_>,
    key: &[u8],
    params: ZRangeParams,
) -> OpResult<Vec<(Vec<u8>, f64)>> {
    with_zset(op, key, move |z| extract_range(z, &params))
}

fn op_zremrange(op: &mut OpArgs<'_>, key: &[u8], by: ZRangeBy) -> OpResult<usize> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::ZSet))?;
    let removed = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| {
            let Some(Payload::ZSet(z)) = v.payload_mut() else {
                return 0;
            };
            match z {
                ZSetPayload::SkipList(sm) => match &by {
                    ZRangeBy::Rank(start, end) => match normalize_ranks(sm.len(), *start, *end) {
                        Some((s, e)) => sm.delete_range_by_rank(s, e),
                        None => 0,
                    },
                    ZRangeBy::Score(r) => sm.delete_range_by_score(r),
                    ZRangeBy::Lex(r) => sm.delete_range_by_lex(r),
                },
                ZSetPayload::ListPack(lp) => {
                    let entries = zlp_entries(lp);
                    let victims: Vec<(Vec<u8>, f64)> = match &by {
                        ZRangeBy::Rank(start, end) => {
                            match normalize_ranks(entries.len(), *start, *end) {
                                Some((s, e)) => entries[s..=e].to_vec(),
                                None => Vec::new(),
                            }
                        }
                        ZRangeBy::Score(r) => entries
                            .into_iter()
                            .filter(|(_, s)| r.contains(*s))
                            .collect(),
                        ZRangeBy::Lex(r) => entries
                            .into_iter()
                            .filter(|(m, _)| r.contains(m))
                            .collect(),
                    };
                    for (m, _) in &victims {
                        zlp_delete(lp, m);
                    }
                    victims.len()
                }
            }
        })
        .unwrap_or(0);
    remove_if_empty_zset(op, key, pos);
    Ok(removed)
}

fn op_zpop(op: &mut OpArgs<'_>, key: &[u8], n: usize, reverse: bool) -> OpResult<Vec<(Vec<u8>, f64)>> {
    let cntx = op.db_cntx;
    let pos = op
        .shard
        .db_slice
        .find_mutable(&cntx, key, Some(ObjType::ZSet))?;
    let popped = op
        .shard
        .db_slice
        .update_value(&cntx, pos, key, move |v| {
            let Some(Payload::ZSet(z)) = v.payload_mut() else {
                return Vec::new();
            };
            match z {
                ZSetPayload::SkipList(sm) => sm.pop_top(n, reverse),
                ZSetPayload::ListPack(lp) => {
                    let mut entries = zlp_entries(lp);
                    if reverse {
                        entries.reverse();
                    }
                    let out: Vec<(Vec<u8>, f64)> = entries.into_iter().take(n).collect();
                    for (m, _) in &out {
                        zlp_delete(lp, m);
                    }
                    out
                }
            }
        })
        .unwrap_or_default();
    remove_if_empty_zset(op, key, pos);
    Ok(popped)
}

// ==================== argument parsing ====================

fn parse_score(arg: &[u8]) -> OpResult<f64> {
    if arg.eq_ignore_ascii_case(b"nan") {
        return Err(OpStatus::InvalidFloat);
    }
    parse_f64(arg)
}

/// `min`/`max` score bound: "(5", "5", "-inf", "+inf".
fn parse_score_bound(arg: &[u8]) -> OpResult<ScoreBound> {
    let (excl, rest) = match arg.first() {
        Some(b'(') => (true, &arg[1..]),
        _ => (false, arg),
    };
    let v = parse_f64(rest)?;
    if v.is_infinite() {
        return Ok(if v > 0.0 {
            ScoreBound::PosInf
        } else {
            ScoreBound::NegInf
        });
    }
    Ok(ScoreBound::Val { v, incl: !excl })
}

fn parse_score_range(min: &[u8], max: &[u8]) -> OpResult<ScoreRange> {
    Ok(ScoreRange {
        min: parse_score_bound(min)?,
        max: parse_score_bound(max)?,
    })
}

/// Lex bound: "-", "+", "[member", "(member".
fn parse_lex_bound(arg: &[u8]) -> OpResult<LexBound> {
    match arg.first() {
        Some(b'-') if arg.len() == 1 => Ok(LexBound::NegInf),
        Some(b'+') if arg.len() == 1 => Ok(LexBound::PosInf),
        Some(b'[') => Ok(LexBound::Closed(arg[1..].to_vec())),
        Some(b'(') => Ok(LexBound::Open(arg[1..].to_vec())),
        _ => Err(OpStatus::InvalidValue(
            "min or max not valid string range item".into(),
        )),
    }
}

fn parse_lex_range(min: &[u8], max: &[u8]) -> OpResult<LexRange> {
    Ok(LexRange {
        min: parse_lex_bound(min)?,
        max: parse_lex_bound(max)?,
    })
}

// ==================== command handlers ====================

/// ZADD key [NX|XX] [GT|LT] [CH] [INCR] score member [score member ...]
pub async fn zadd(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let mut params = ZParams::default();
    let mut i = 1;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "NX" => params.flags.nx = true,
            "XX" => params.flags.xx = true,
            "GT" => params.flags.gt = true,
            "LT" => params.flags.lt = true,
            "CH" => params.ch = true,
            "INCR" => params.flags.incr = true,
            _ => break,
        }
        i += 1;
    }
    if params.flags.nx && (params.flags.xx || params.flags.gt || params.flags.lt) {
        return RespValue::error(
            "ERR GT, LT, and/or NX options at the same time are not compatible",
        );
    }
    if params.flags.gt && params.flags.lt {
        return RespValue::error(
            "ERR GT, LT, and/or NX options at the same time are not compatible",
        );
    }
    let rest = &args[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let mut pairs = Vec::with_capacity(rest.len() / 2);
    for chunk in rest.chunks(2) {
        let score = match parse_score(&chunk[0]) {
            Ok(s) => s,
            Err(e) => return e.to_resp(),
        };
        pairs.push((score, chunk[1].clone()));
    }
    if params.flags.incr && pairs.len() != 1 {
        return RespValue::error("ERR INCR option supports a single increment-element pair");
    }

    let raw = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_zadd(op, &key, params, &pairs);
            if r.is_ok() {
                op.record_journal("ZADD", &raw);
            }
            r
        }))
        .await;
    match result {
        Ok(r) => {
            if let Some(incr) = r.incr_score {
                match incr {
                    Some(s) => RespValue::double(s),
                    None => RespValue::nil(),
                }
            } else if params.ch {
                RespValue::Integer((r.added + r.updated) as i64)
            } else {
                RespValue::Integer(r.added as i64)
            }
        }
        Err(e) => e.to_resp(),
    }
}

pub async fn zincrby(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let incr_args = vec![
        args[0].clone(),
        Bytes::from_static(b"INCR"),
        args[1].clone(),
        args[2].clone(),
    ];
    zadd(ss, db, &incr_args).await
}

pub async fn zrem(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let members: Vec<Bytes> = args[1..].to_vec();
    let raw = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_zrem(op, &key, &members);
            if matches!(r, Ok(n) if n > 0) {
                op.record_journal("ZREM", &raw);
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

pub async fn zcard(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            with_zset(op, &key, |z| zp_len(z))
        }))
        .await;
    match result {
        Ok(n) => RespValue::Integer(n as i64),
        Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn zscore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let member = args[1].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let member = member.clone();
            with_zset(op, &key, move |z| zp_score(z, &member))
        }))
        .await;
    match result {
        Ok(Some(s)) => RespValue::double(s),
        Ok(None) | Err(OpStatus::KeyNotFound) => RespValue::nil(),
        Err(e) => e.to_resp(),
    }
}

pub async fn zmscore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let members: Vec<Bytes> = args[1..].to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let members = members.clone();
            with_zset(op, &key, move |z| {
                members
                    .iter()
                    .map(|m| zp_score(z, m))
                    .collect::<Vec<Option<f64>>>()
            })
        }))
        .await;
    match result {
        Ok(scores) => RespValue::array(
            scores
                .into_iter()
                .map(|s| s.map(RespValue::double).unwrap_or_else(RespValue::nil))
                .collect(),
        ),
        Err(OpStatus::KeyNotFound) => {
            RespValue::array(args[1..].iter().map(|_| RespValue::nil()).collect())
        }
        Err(e) => e.to_resp(),
    }
}

async fn zrank_generic(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes], reverse: bool) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let member = args[1].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let member = member.clone();
            with_zset(op, &key, move |z| match z {
                ZSetPayload::SkipList(sm) => sm.rank(&member, reverse),
                ZSetPayload::ListPack(lp) => {
                    let entries = zlp_entries(lp);
                    entries
                        .iter()
                        .position(|(m, _)| m.as_slice() == &member[..])
                        .map(|i| if reverse { entries.len() - 1 - i } else { i })
                }
            })
        }))
        .await;
    match result {
        Ok(Some(rank)) => RespValue::Integer(rank as i64),
        Ok(None) | Err(OpStatus::KeyNotFound) => RespValue::nil(),
        Err(e) => e.to_resp(),
    }
}

pub async fn zrank(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zrank_generic(ss, db, args, false).await
}

pub async fn zrevrank(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zrank_generic(ss, db, args, true).await
}

fn range_reply(items: Vec<(Vec<u8>, f64)>, with_scores: bool) -> RespValue {
    let mut out = Vec::with_capacity(items.len() * if with_scores { 2 } else { 1 });
    for (m, s) in items {
        out.push(RespValue::bulk(m));
        if with_scores {
            out.push(RespValue::double(s));
        }
    }
    RespValue::array(out)
}

async fn run_range(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    key: Bytes,
    params: ZRangeParams,
) -> OpResult<Vec<(Vec<u8>, f64)>> {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    tx.schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
        op_zrange(op, &key, params.clone())
    }))
    .await
}

/// ZRANGE key start stop [BYSCORE|BYLEX] [REV] [LIMIT offset count] [WITHSCORES]
pub async fn zrange(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let (min_arg, max_arg) = (args[1].clone(), args[2].clone());
    let mut by_score = false;
    let mut by_lex = false;
    let mut reverse = false;
    let mut with_scores = false;
    let mut offset = 0usize;
    let mut limit = usize::MAX;
    let mut i = 3;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "BYSCORE" => by_score = true,
            "BYLEX" => by_lex = true,
            "REV" => reverse = true,
            "WITHSCORES" => with_scores = true,
            "LIMIT" => {
                let off = args.get(i + 1).ok_or(OpStatus::SyntaxErr);
                let cnt = args.get(i + 2).ok_or(OpStatus::SyntaxErr);
                match (off, cnt) {
                    (Ok(o), Ok(c)) => {
                        let o = match parse_i64(o) {
                            Ok(v) if v >= 0 => v as usize,
                            _ => return OpStatus::SyntaxErr.to_resp(),
                        };
                        let c = match parse_i64(c) {
                            Ok(v) => v,
                            Err(e) => return e.to_resp(),
                        };
                        offset = o;
                        limit = if c < 0 { usize::MAX } else { c as usize };
                        i += 2;
                    }
                    _ => return OpStatus::SyntaxErr.to_resp(),
                }
            }
            _ => return OpStatus::SyntaxErr.to_resp(),
        }
        i += 1;
    }
    if by_score && by_lex {
        return OpStatus::SyntaxErr.to_resp();
    }
    if limit != usize::MAX && !(by_score || by_lex) {
        return RespValue::error(
            "ERR syntax error, LIMIT is only supported in combination with either BYSCORE or BYLEX",
        );
    }

    let by = if by_score {
        // REV swaps the endpoint order on the wire
        let (lo, hi) = if reverse {
            (&max_arg, &min_arg)
        } else {
            (&min_arg, &max_arg)
        };
        match parse_score_range(lo, hi) {
            Ok(r) => ZRangeBy::Score(r),
            Err(e) => return e.to_resp(),
        }
    } else if by_lex {
        let (lo, hi) = if reverse {
            (&max_arg, &min_arg)
        } else {
            (&min_arg, &max_arg)
        };
        match parse_lex_range(lo, hi) {
            Ok(r) => ZRangeBy::Lex(r),
            Err(e) => return e.to_resp(),
        }
    } else {
        let start = match parse_i64(&min_arg) {
            Ok(v) => v,
            Err(e) => return e.to_resp(),
        };
        let end = match parse_i64(&max_arg) {
            Ok(v) => v,
            Err(e) => return e.to_resp(),
        };
        ZRangeBy::Rank(start, end)
    };

    let params = ZRangeParams {
        by,
        reverse,
        offset,
        limit,
    };
    match run_range(ss, db, key, params).await {
        Ok(items) => range_reply(items, with_scores),
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn zrangebyscore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zrangebyscore_generic(ss, db, args, false).await
}

pub async fn zrevrangebyscore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zrangebyscore_generic(ss, db, args, true).await
}

async fn zrangebyscore_generic(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    args: &[Bytes],
    reverse: bool,
) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    // reversed form passes (max, min)
    let (min_arg, max_arg) = if reverse {
        (args[2].clone(), args[1].clone())
    } else {
        (args[1].clone(), args[2].clone())
    };
    let mut with_scores = false;
    let mut offset = 0usize;
    let mut limit = usize::MAX;
    let mut i = 3;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "WITHSCORES" => with_scores = true,
            "LIMIT" => {
                let (Some(o), Some(c)) = (args.get(i + 1), args.get(i + 2)) else {
                    return OpStatus::SyntaxErr.to_resp();
                };
                offset = match parse_i64(o) {
                    Ok(v) if v >= 0 => v as usize,
                    _ => return OpStatus::SyntaxErr.to_resp(),
                };
                limit = match parse_i64(c) {
                    Ok(v) if v < 0 => usize::MAX,
                    Ok(v) => v as usize,
                    Err(e) => return e.to_resp(),
                };
                i += 2;
            }
            _ => return OpStatus::SyntaxErr.to_resp(),
        }
        i += 1;
    }
    let range = match parse_score_range(&min_arg, &max_arg) {
        Ok(r) => r,
        Err(e) => return e.to_resp(),
    };
    let params = ZRangeParams {
        by: ZRangeBy::Score(range),
        reverse,
        offset,
        limit,
    };
    match run_range(ss, db, key, params).await {
        Ok(items) => range_reply(items, with_scores),
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn zrangebylex(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zrangebylex_generic(ss, db, args, false).await
}

pub async fn zrevrangebylex(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zrangebylex_generic(ss, db, args, true).await
}

async fn zrangebylex_generic(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    args: &[Bytes],
    reverse: bool,
) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let (min_arg, max_arg) = if reverse {
        (args[2].clone(), args[1].clone())
    } else {
        (args[1].clone(), args[2].clone())
    };
    let mut offset = 0usize;
    let mut limit = usize::MAX;
    let mut i = 3;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "LIMIT" => {
                let (Some(o), Some(c)) = (args.get(i + 1), args.get(i + 2)) else {
                    return OpStatus::SyntaxErr.to_resp();
                };
                offset = match parse_i64(o) {
                    Ok(v) if v >= 0 => v as usize,
                    _ => return OpStatus::SyntaxErr.to_resp(),
                };
                limit = match parse_i64(c) {
                    Ok(v) if v < 0 => usize::MAX,
                    Ok(v) => v as usize,
                    Err(e) => return e.to_resp(),
                };
                i += 2;
            }
            _ => return OpStatus::SyntaxErr.to_resp(),
        }
        i += 1;
    }
    let range = match parse_lex_range(&min_arg, &max_arg) {
        Ok(r) => r,
        Err(e) => return e.to_resp(),
    };
    let params = ZRangeParams {
        by: ZRangeBy::Lex(range),
        reverse,
        offset,
        limit,
    };
    match run_range(ss, db, key, params).await {
        Ok(items) => range_reply(items, false),
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn zrevrange(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let start = match parse_i64(&args[1]) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    let end = match parse_i64(&args[2]) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    let with_scores = match args.get(3) {
        Some(a) if upper(a) == "WITHSCORES" => true,
        Some(_) => return OpStatus::SyntaxErr.to_resp(),
        None => false,
    };
    let params = ZRangeParams {
        by: ZRangeBy::Rank(start, end),
        reverse: true,
        offset: 0,
        limit: usize::MAX,
    };
    match run_range(ss, db, key, params).await {
        Ok(items) => range_reply(items, with_scores),
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn zcount(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let range = match parse_score_range(&args[1], &args[2]) {
        Ok(r) => r,
        Err(e) => return e.to_resp(),
    };
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            with_zset(op, &key, move |z| match z {
                ZSetPayload::SkipList(sm) => sm.count_by_score(&range),
                ZSetPayload::ListPack(lp) => zlp_entries(lp)
                    .iter()
                    .filter(|(_, s)| range.contains(*s))
                    .count(),
            })
        }))
        .await;
    match result {
        Ok(n) => RespValue::Integer(n as i64),
        Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

pub async fn zlexcount(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let range = match parse_lex_range(&args[1], &args[2]) {
        Ok(r) => r,
        Err(e) => return e.to_resp(),
    };
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let range = range.clone();
            with_zset(op, &key, move |z| match z {
                ZSetPayload::SkipList(sm) => sm.count_by_lex(&range),
                ZSetPayload::ListPack(lp) => zlp_entries(lp)
                    .iter()
                    .filter(|(m, _)| range.contains(m))
                    .count(),
            })
        }))
        .await;
    match result {
        Ok(n) => RespValue::Integer(n as i64),
        Err(OpStatus::KeyNotFound) => RespValue::Integer(0),
        Err(e) => e.to_resp(),
    }
}

async fn zremrange_generic(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    key: Bytes,
    by: ZRangeBy,
    cmd: &'static str,
    raw: Vec<Bytes>,
) -> RespValue {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_zremrange(op, &key, by.clone());
            if matches!(r, Ok(n) if n > 0) {
                op.record_journal(cmd, &raw);
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

pub async fn zremrangebyrank(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let (start, end) = match (parse_i64(&args[1]), parse_i64(&args[2])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return OpStatus::InvalidInt.to_resp(),
    };
    zremrange_generic(
        ss,
        db,
        args[0].clone(),
        ZRangeBy::Rank(start, end),
        "ZREMRANGEBYRANK",
        args.to_vec(),
    )
    .await
}

pub async fn zremrangebyscore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let range = match parse_score_range(&args[1], &args[2]) {
        Ok(r) => r,
        Err(e) => return e.to_resp(),
    };
    zremrange_generic(
        ss,
        db,
        args[0].clone(),
        ZRangeBy::Score(range),
        "ZREMRANGEBYSCORE",
        args.to_vec(),
    )
    .await
}

pub async fn zremrangebylex(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let range = match parse_lex_range(&args[1], &args[2]) {
        Ok(r) => r,
        Err(e) => return e.to_resp(),
    };
    zremrange_generic(
        ss,
        db,
        args[0].clone(),
        ZRangeBy::Lex(range),
        "ZREMRANGEBYLEX",
        args.to_vec(),
    )
    .await
}

async fn zpop_generic(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes], reverse: bool) -> RespValue {
    if args.is_empty() || args.len() > 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let n = match args.get(1) {
        Some(a) => match parse_i64(a) {
            Ok(v) if v >= 0 => v as usize,
            _ => return OpStatus::InvalidInt.to_resp(),
        },
        None => 1,
    };
    let raw = args.to_vec();
    let cmd: &'static str = if reverse { "ZPOPMAX" } else { "ZPOPMIN" };
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = op_zpop(op, &key, n, reverse);
            if matches!(&r, Ok(v) if !v.is_empty()) {
                op.record_journal(cmd, &raw);
            }
            r
        }))
        .await;
    match result {
        Ok(items) => range_reply(items, true),
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

pub async fn zpopmin(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zpop_generic(ss, db, args, false).await
}

pub async fn zpopmax(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    zpop_generic(ss, db, args, true).await
}

/// BZPOPMIN/BZPOPMAX key [key ...] timeout
async fn bzpop_generic(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    args: &[Bytes],
    reverse: bool,
) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let timeout_s = match std::str::from_utf8(args.last().map(|b| b.as_ref()).unwrap_or(b""))
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
    {
        Some(t) if t >= 0.0 => t,
        _ => return RespValue::error("ERR timeout is not a float or out of range"),
    };
    let keys: Vec<Bytes> = args[..args.len() - 1].to_vec();
    let deadline = if timeout_s == 0.0 {
        None
    } else {
        Some(tokio::time::Instant::now() + std::time::Duration::from_secs_f64(timeout_s))
    };
    let cmd: &'static str = if reverse { "ZPOPMAX" } else { "ZPOPMIN" };

    loop {
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut tx = Transaction::new(ss, db, &keys, LockMode::Exclusive);
        let txid = tx.txid();
        let keys2 = keys.clone();
        let wake_tx2 = wake_tx.clone();
        let results = tx
            .execute(
                Arc::new(move |op: &mut OpArgs<'_>| {
                    let my_keys: Vec<&Bytes> =
                        keys2.iter().filter(|k| op.owns_key(k)).collect();
                    for key in &my_keys {
                        match op_zpop(op, key, 1, reverse) {
                            Ok(items) if !items.is_empty() => {
                                op.record_journal(cmd, &[(*key).clone()]);
                                let (m, s) = items.into_iter().next().unwrap_or_default();
                                return Ok(Some((key.to_vec(), m, s)));
                            }
                            Ok(_) | Err(OpStatus::KeyNotFound) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    // nothing to pop on this shard: watch the keys while
                    // still holding the shard lock
                    let watched: Vec<Vec<u8>> = my_keys.iter().map(|k| k.to_vec()).collect();
                    op.shard.blocking.add_watcher(
                        txid,
                        op.db_cntx.db_index,
                        &watched,
                        wake_tx2.clone(),
                    );
                    Ok(None)
                }),
                true,
            )
            .await;

        if let Some(e) = aggregate_status(&results) {
            if !e.is_benign() {
                unregister_watchers(ss, db, &keys, txid).await;
                return e.to_resp();
            }
        }
        // first hit in key-argument order wins
        let mut popped: Vec<(Vec<u8>, Vec<u8>, f64)> = results
            .into_iter()
            .filter_map(|(_, r)| r.ok().flatten())
            .collect();
        popped.sort_by_key(|(k, _, _)| keys.iter().position(|a| a.as_ref() == k.as_slice()));
        if let Some((k, m, s)) = popped.into_iter().next() {
            unregister_watchers(ss, db, &keys, txid).await;
            return RespValue::array(vec![
                RespValue::bulk(k),
                RespValue::bulk(m),
                RespValue::double(s),
            ]);
        }

        let tx2 = Transaction::new(ss, db, &keys, LockMode::Shared);
        let waited = tx2.wait_for_wakeup(&mut wake_rx, deadline).await;
        unregister_watchers(ss, db, &keys, txid).await;
        match waited {
            Ok(_) => continue,
            Err(OpStatus::TimedOut) => return RespValue::nil(),
            Err(e) => return e.to_resp(),
        }
    }
}

async fn unregister_watchers(ss: &Arc<ShardSet>, db: DbIndex, keys: &[Bytes], txid: u64) {
    let mut tx = Transaction::new(ss, db, keys, LockMode::Shared);
    let _ = tx
        .execute::<()>(
            Arc::new(move |op: &mut OpArgs<'_>| {
                op.shard.blocking.remove_watcher(txid);
                Ok(())
            }),
            true,
        )
        .await;
}

pub async fn bzpopmin(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    bzpop_generic(ss, db, args, false).await
}

pub async fn bzpopmax(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    bzpop_generic(ss, db, args, true).await
}

/// ZRANDMEMBER key [count [WITHSCORES]]
pub async fn zrandmember(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.is_empty() || args.len() > 3 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let count = match args.get(1) {
        Some(a) => match parse_i64(a) {
            Ok(v) => Some(v),
            Err(e) => return e.to_resp(),
        },
        None => None,
    };
    let with_scores = match args.get(2) {
        Some(a) if upper(a) == "WITHSCORES" => true,
        Some(_) => return OpStatus::SyntaxErr.to_resp(),
        None => false,
    };
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let mut rng = StdRng::from_entropy();
            with_zset(op, &key, move |z| match z {
                ZSetPayload::SkipList(sm) => match count {
                    None => sm.random_members(1, true, &mut rng),
                    Some(n) if n >= 0 => sm.random_members(n as usize, true, &mut rng),
                    Some(n) => sm.random_members(n.unsigned_abs() as usize, false, &mut rng),
                },
                ZSetPayload::ListPack(lp) => {
                    let picked = match count {
                        None => lp.random_pair(&mut rng).into_iter().collect(),
                        Some(n) if n >= 0 => lp.random_pairs_unique(n as usize, &mut rng),
                        Some(n) => lp.random_pairs(n.unsigned_abs() as usize, &mut rng),
                    };
                    picked
                        .into_iter()
                        .map(|(m, s)| {
                            let score = std::str::from_utf8(&s)
                                .ok()
                                .and_then(|t| t.parse::<f64>().ok())
                                .unwrap_or(0.0);
                            (m, score)
                        })
                        .collect()
                }
            })
        }))
        .await;
    match result {
        Ok(items) => {
            if count.is_none() {
                return items
                    .into_iter()
                    .next()
                    .map(|(m, _)| RespValue::bulk(m))
                    .unwrap_or_else(RespValue::nil);
            }
            range_reply(items, with_scores)
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

/// ZSCAN key cursor [MATCH pattern] [COUNT count]
pub async fn zscan(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
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
            let pattern = pattern.clone();
            with_zset(op, &key, move |z| match z {
                ZSetPayload::ListPack(lp) => {
                    let items: Vec<(Vec<u8>, f64)> = zlp_entries(lp)
                        .into_iter()
                        .filter(|(m, _)| {
                            pattern.as_ref().map(|p| glob_match(p, m)).unwrap_or(true)
                        })
                        .collect();
                    (0u64, items)
                }
                ZSetPayload::SkipList(sm) => {
                    let mut items = Vec::new();
                    let mut cur = cursor;
                    let mut steps = 0usize;
                    loop {
                        cur = sm.scan(cur, |m, s| {
                            let keep =
                                pattern.as_ref().map(|p| glob_match(p, m)).unwrap_or(true);
                            if keep {
                                items.push((m.to_vec(), s));
                            }
                        });
                        steps += 1;
                        if cur == 0 || items.len() >= count || steps >= count * 10 {
                            break;
                        }
                    }
                    (cur, items)
                }
            })
        }))
        .await;
    match result {
        Ok((next, items)) => RespValue::array(vec![
            RespValue::bulk(next.to_string()),
            RespValue::array(
                items
                    .into_iter()
                    .flat_map(|(m, s)| {
                        [RespValue::bulk(m), RespValue::bulk(format_double(s))]
                    })
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

// ==================== set algebra ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggType {
    Sum,
    Min,
    Max,
}

fn agg(a: f64, b: f64, how: AggType) -> f64 {
    match how {
        AggType::Sum => {
            let s = a + b;
            // inf + -inf: Redis settles on 0
            if s.is_nan() {
                0.0
            } else {
                s
            }
        }
        AggType::Min => a.min(b),
        AggType::Max => a.max(b),
    }
}

struct SetOpArgs {
    keys: Vec<Bytes>,
    weights: Vec<f64>,
    agg: AggType,
    with_scores: bool,
}

fn parse_set_op(args: &[Bytes], store: bool) -> OpResult<(Option<Bytes>, SetOpArgs)> {
    let mut i = 0;
    let dest = if store {
        let d = args.get(i).cloned().ok_or(OpStatus::SyntaxErr)?;
        i += 1;
        Some(d)
    } else {
        None
    };
    let numkeys = parse_i64(args.get(i).ok_or(OpStatus::SyntaxErr)?)?;
    i += 1;
    if numkeys <= 0 {
        return Err(OpStatus::InvalidValue(
            "at least 1 input key is needed for this command".into(),
        ));
    }
    let numkeys = numkeys as usize;
    if args.len() < i + numkeys {
        return Err(OpStatus::SyntaxErr);
    }
    let keys: Vec<Bytes> = args[i..i + numkeys].to_vec();
    i += numkeys;

    let mut weights = vec![1.0; numkeys];
    let mut how = AggType::Sum;
    let mut with_scores = false;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "WEIGHTS" => {
                if args.len() < i + 1 + numkeys {
                    return Err(OpStatus::SyntaxErr);
                }
                for (w, arg) in weights.iter_mut().zip(&args[i + 1..i + 1 + numkeys]) {
                    *w = parse_f64(arg)
                        .map_err(|_| OpStatus::InvalidValue("weight value is not a float".into()))?;
                }
                i += numkeys;
            }
            "AGGREGATE" => {
                i += 1;
                how = match upper(args.get(i).ok_or(OpStatus::SyntaxErr)?).as_str() {
                    "SUM" => AggType::Sum,
                    "MIN" => AggType::Min,
                    "MAX" => AggType::Max,
                    _ => return Err(OpStatus::SyntaxErr),
                };
            }
            "WITHSCORES" => with_scores = true,
            _ => return Err(OpStatus::SyntaxErr),
        }
        i += 1;
    }
    Ok((
        dest,
        SetOpArgs {
            keys,
            weights,
            agg: how,
            with_scores,
        },
    ))
}

/// Fetch each source key's entries (None = missing key) in one hop per
/// shard.
async fn fetch_sources(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    keys: &[Bytes],
) -> OpResult<Vec<Option<Vec<(Vec<u8>, f64)>>>> {
    let keys_arg: Vec<Bytes> = keys.to_vec();
    let wanted = keys_arg.clone();
    let mut tx = Transaction::new(ss, db, &keys_arg, LockMode::Shared);
    let results = tx
        .execute(
            Arc::new(move |op: &mut OpArgs<'_>| {
                let mut out: Vec<(usize, Option<Vec<(Vec<u8>, f64)>>)> = Vec::new();
                for (idx, key) in wanted.iter().enumerate() {
                    if !op.owns_key(key) {
                        continue;
                    }
                    match with_zset(op, key, |z| zp_entries(z)) {
                        Ok(entries) => out.push((idx, Some(entries))),
                        Err(OpStatus::KeyNotFound) => out.push((idx, None)),
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            }),
            true,
        )
        .await;
    if let Some(e) = aggregate_status(&results) {
        if !e.is_benign() {
            return Err(e);
        }
    }
    let mut merged: Vec<Option<Vec<(Vec<u8>, f64)>>> = vec![None; keys.len()];
    for (_, r) in results {
        if let Ok(list) = r {
            for (idx, entries) in list {
                merged[idx] = entries;
            }
        }
    }
    Ok(merged)
}

fn union_sources(
    sources: &[Option<Vec<(Vec<u8>, f64)>>],
    weights: &[f64],
    how: AggType,
) -> HashMap<Vec<u8>, f64> {
    let mut acc: HashMap<Vec<u8>, f64> = HashMap::new();
    for (src, w) in sources.iter().zip(weights) {
        let Some(entries) = src else { continue };
        for (m, s) in entries {
            let ws = s * w;
            acc.entry(m.clone())
                .and_modify(|cur| *cur = agg(*cur, ws, how))
                .or_insert(ws);
        }
    }
    acc
}

fn inter_sources(
    sources: &[Option<Vec<(Vec<u8>, f64)>>],
    weights: &[f64],
    how: AggType,
) -> HashMap<Vec<u8>, f64> {
    if sources.iter().any(|s| s.is_none()) {
        return HashMap::new();
    }
    let mut acc: HashMap<Vec<u8>, (f64, usize)> = HashMap::new();
    for (src, w) in sources.iter().zip(weights) {
        if let Some(entries) = src {
            for (m, s) in entries {
                let ws = s * w;
                acc.entry(m.clone())
                    .and_modify(|(cur, n)| {
                        *cur = agg(*cur, ws, how);
                        *n += 1;
                    })
                    .or_insert((ws, 1));
            }
        }
    }
    let need = sources.len();
    acc.into_iter()
        .filter(|(_, (_, n))| *n == need)
        .map(|(m, (s, _))| (m, s))
        .collect()
}

fn diff_sources(sources: &[Option<Vec<(Vec<u8>, f64)>>]) -> HashMap<Vec<u8>, f64> {
    let mut acc: HashMap<Vec<u8>, f64> = match sources.first() {
        Some(Some(entries)) => entries.iter().cloned().collect(),
        _ => return HashMap::new(),
    };
    for src in &sources[1..] {
        if let Some(entries) = src {
            for (m, _) in entries {
                acc.remove(m);
            }
        }
    }
    acc
}

async fn store_result(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    dest: Bytes,
    entries: Vec<(Vec<u8>, f64)>,
    cmd: &'static str,
) -> OpResult<usize> {
    let card = entries.len();
    let tx = Transaction::new(ss, db, &[dest.clone()], LockMode::Exclusive);
    tx.schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
        let cntx = op.db_cntx;
        op.shard.delete_key(&cntx, &dest);
        if entries.is_empty() {
            return Ok(0);
        }
        let (pos, _) = op.shard.db_slice.add_or_find(&cntx, &dest);
        let entries2 = entries.clone();
        let max_packed = op.shard.config.zset_max_listpack_entries;
        let max_field = op.shard.config.max_map_field_len;
        op.shard.db_slice.update_value(&cntx, pos, &dest, move |v| {
            let packed_ok = entries2.len() <= max_packed
                && entries2.iter().all(|(m, _)| m.len() <= max_field);
            if packed_ok {
                let mut lp = ListPack::new();
                let mut sorted = entries2.clone();
                sorted.sort_by(|(am, asc), (bm, bsc)| {
                    asc.partial_cmp(bsc)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| am.cmp(bm))
                });
                for (m, s) in sorted {
                    lp.push(&m);
                    lp.push(format_double(s).as_bytes());
                }
                v.init_robj(Payload::ZSet(ZSetPayload::ListPack(lp)));
            } else {
                let mut sm = Box::new(SortedMap::new());
                for (m, s) in &entries2 {
                    let _ = sm.insert(*s, m, InsertFlags::default());
                }
                v.init_robj(Payload::ZSet(ZSetPayload::SkipList(sm)));
            }
        });
        op.record_journal(cmd, &[dest.clone()]);
        Ok(card)
    }))
    .await
}

fn sort_union(mut items: Vec<(Vec<u8>, f64)>) -> Vec<(Vec<u8>, f64)> {
    // lexicographic (score, member) tuple order
    items.sort_by(|(am, asc), (bm, bsc)| {
        asc.partial_cmp(bsc)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| am.cmp(bm))
    });
    items
}

fn sort_inter(mut items: Vec<(Vec<u8>, f64)>) -> Vec<(Vec<u8>, f64)> {
    // ascending score only, as the original does
    items.sort_by(|(_, asc), (_, bsc)| asc.partial_cmp(bsc).unwrap_or(std::cmp::Ordering::Equal));
    items
}

pub async fn zunion(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    let (_, sargs) = match parse_set_op(args, false) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    match fetch_sources(ss, db, &sargs.keys).await {
        Ok(sources) => {
            let items =
                sort_union(union_sources(&sources, &sargs.weights, sargs.agg).into_iter().collect());
            range_reply(items, sargs.with_scores)
        }
        Err(e) => e.to_resp(),
    }
}

pub async fn zunionstore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    let (dest, sargs) = match parse_set_op(args, true) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    let Some(dest) = dest else {
        return OpStatus::SyntaxErr.to_resp();
    };
    match fetch_sources(ss, db, &sargs.keys).await {
        Ok(sources) => {
            let items =
                sort_union(union_sources(&sources, &sargs.weights, sargs.agg).into_iter().collect());
            match store_result(ss, db, dest, items, "ZUNIONSTORE").await {
                Ok(card) => RespValue::Integer(card as i64),
                Err(e) => e.to_resp(),
            }
        }
        Err(e) => e.to_resp(),
    }
}

pub async fn zinter(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    let (_, sargs) = match parse_set_op(args, false) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    match fetch_sources(ss, db, &sargs.keys).await {
        Ok(sources) => {
            let items =
                sort_inter(inter_sources(&sources, &sargs.weights, sargs.agg).into_iter().collect());
            range_reply(items, sargs.with_scores)
        }
        Err(e) => e.to_resp(),
    }
}

pub async fn zinterstore(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    let (dest, sargs) = match parse_set_op(args, true) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    let Some(dest) = dest else {
        return OpStatus::SyntaxErr.to_resp();
    };
    match fetch_sources(ss, db, &sargs.keys).await {
        Ok(sources) => {
            let items =
                sort_inter(inter_sources(&sources, &sargs.weights, sargs.agg).into_iter().collect());
            match store_result(ss, db, dest, items, "ZINTERSTORE").await {
                Ok(card) => RespValue::Integer(card as i64),
                Err(e) => e.to_resp(),
            }
        }
        Err(e) => e.to_resp(),
    }
}

/// ZINTERCARD numkeys key [key ...] [LIMIT limit]
pub async fn zintercard(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let numkeys = match parse_i64(&args[0]) {
        Ok(n) if n > 0 => n as usize,
        _ => return OpStatus::SyntaxErr.to_resp(),
    };
    if args.len() < 1 + numkeys {
        return OpStatus::SyntaxErr.to_resp();
    }
    let keys: Vec<Bytes> = args[1..1 + numkeys].to_vec();
    let mut limit = usize::MAX;
    let rest = &args[1 + numkeys..];
    if !rest.is_empty() {
        if rest.len() != 2 || upper(&rest[0]) != "LIMIT" {
            return OpStatus::SyntaxErr.to_resp();
        }
        limit = match parse_i64(&rest[1]) {
            Ok(v) if v >= 0 => {
                if v == 0 {
                    usize::MAX
                } else {
                    v as usize
                }
            }
            _ => return RespValue::error("ERR LIMIT can't be negative"),
        };
    }
    match fetch_sources(ss, db, &keys).await {
        Ok(sources) => {
            let weights = vec![1.0; keys.len()];
            let inter = inter_sources(&sources, &weights, AggType::Sum);
            RespValue::Integer(inter.len().min(limit) as i64)
        }
        Err(e) => e.to_resp(),
    }
}

pub async fn zdiff(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    let (_, sargs) = match parse_set_op(args, false) {
        Ok(v) => v,
        Err(e) => return e.to_resp(),
    };
    match fetch_sources(ss, db, &sargs.keys).await {
        Ok(sources) => {
            let items = sort_union(diff_sources(&sources).into_iter().collect());
            range_reply(items, sargs.with_scores)
        }
        Err(e) => e.to_resp(),
    }
}
