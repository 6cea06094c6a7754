//! Generic key commands
//!
//! DEL/EXISTS/EXPIRE/TTL/TYPE and friends: the key-level surface that is
//! type agnostic. Deletions route through the shard helper so tiered
//! segments and in-flight stashes are cleaned up.

use crate::error::{OpResult, OpStatus};
use crate::shard::OpArgs;
use crate::shard_set::ShardSet;
use crate::transaction::{LockMode, Transaction};
use crate::util::parse_i64;
use bytes::Bytes;
use ember_core::DbIndex;
use resp::RespValue;
use std::sync::Arc;

pub async fn del(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.is_empty() {
        return OpStatus::SyntaxErr.to_resp();
    }
    let keys = args.to_vec();
    let wanted = keys.clone();
    let mut tx = Transaction::new(ss, db, &keys, LockMode::Exclusive);
    let results = tx
        .execute(
            Arc::new(move |op: &mut OpArgs<'_>| {
                let cntx = op.db_cntx;
                let mut removed = 0i64;
                for key in wanted.iter() {
                    if !op.owns_key(key) {
                        continue;
                    }
                    if op.shard.delete_key(&cntx, key) {
                        removed += 1;
                        op.record_journal("DEL", std::slice::from_ref(key));
                    }
                }
                Ok(removed)
            }),
            true,
        )
        .await;
    let total: i64 = results.iter().filter_map(|(_, r)| r.as_ref().ok()).sum();
    RespValue::Integer(total)
}

pub async fn exists(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.is_empty() {
        return OpStatus::SyntaxErr.to_resp();
    }
    let keys = args.to_vec();
    let wanted = keys.clone();
    let mut tx = Transaction::new(ss, db, &keys, LockMode::Shared);
    let results = tx
        .execute(
            Arc::new(move |op: &mut OpArgs<'_>| {
                let cntx = op.db_cntx;
                let mut found = 0i64;
                // EXISTS counts repeated keys repeatedly
                for key in wanted.iter() {
                    if !op.owns_key(key) {
                        continue;
                    }
                    if op.shard.db_slice.find_read_only(&cntx, key, None).is_ok() {
                        found += 1;
                    }
                }
                Ok(found)
            }),
            true,
        )
        .await;
    let total: i64 = results.iter().filter_map(|(_, r)| r.as_ref().ok()).sum();
    RespValue::Integer(total)
}

async fn expire_generic(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    key: Bytes,
    ttl_ms: i64,
    cmd: &'static str,
) -> RespValue {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result: OpResult<bool> = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let cntx = op.db_cntx;
            if op.shard.db_slice.find_read_only(&cntx, &key, None).is_err() {
                return Ok(false);
            }
            if ttl_ms <= 0 {
                // non-positive TTL deletes immediately
                op.shard.delete_key(&cntx, &key);
                op.record_journal("DEL", std::slice::from_ref(&key));
                return Ok(true);
            }
            let at = cntx.time_now_ms + ttl_ms as u64;
            let set = op.shard.db_slice.set_expire(&cntx, &key, at);
            if set {
                let ms = Bytes::from(ttl_ms.to_string());
                op.record_journal(cmd, &[key.clone(), ms]);
            }
            Ok(set)
        }))
        .await;
    match result {
        Ok(set) => RespValue::Integer(if set { 1 } else { 0 }),
        Err(e) => e.to_resp(),
    }
}

pub async fn expire(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    match parse_i64(&args[1]) {
        Ok(secs) => {
            expire_generic(ss, db, args[0].clone(), secs.saturating_mul(1000), "PEXPIRE").await
        }
        Err(e) => e.to_resp(),
    }
}

pub async fn pexpire(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    match parse_i64(&args[1]) {
        Ok(ms) => expire_generic(ss, db, args[0].clone(), ms, "PEXPIRE").await,
        Err(e) => e.to_resp(),
    }
}

async fn ttl_generic(ss: &Arc<ShardSet>, db: DbIndex, key: Bytes, in_seconds: bool) -> RespValue {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result: OpResult<i64> = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let cntx = op.db_cntx;
            if op.shard.db_slice.find_read_only(&cntx, &key, None).is_err() {
                return Ok(-2);
            }
            Ok(op.shard.db_slice.ttl_ms(&cntx, &key).unwrap_or(-1))
        }))
        .await;
    match result {
        Ok(ms) if ms >= 0 && in_seconds => RespValue::Integer((ms + 999) / 1000),
        Ok(v) => RespValue::Integer(v),
        Err(e) => e.to_resp(),
    }
}

pub async fn ttl(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    ttl_generic(ss, db, args[0].clone(), true).await
}

pub async fn pttl(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    ttl_generic(ss, db, args[0].clone(), false).await
}

pub async fn persist(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result: OpResult<bool> = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let cntx = op.db_cntx;
            if op.shard.db_slice.find_read_only(&cntx, &key, None).is_err() {
                return Ok(false);
            }
            let done = op.shard.db_slice.persist(&cntx, &key);
            if done {
                op.record_journal("PERSIST", std::slice::from_ref(&key));
            }
            Ok(done)
        }))
        .await;
    match result {
        Ok(done) => RespValue::Integer(if done { 1 } else { 0 }),
        Err(e) => e.to_resp(),
    }
}

pub async fn type_cmd(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() != 1 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let result: OpResult<Option<&'static str>> = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let cntx = op.db_cntx;
            match op
                .shard
                .db_slice
                .find_read_only(&cntx, &key, None)
                .map_err(OpStatus::from)
            {
                Ok(pos) => Ok(op
                    .shard
                    .db_slice
                    .value(cntx.db_index, pos)
                    .map(|v| v.obj_type().type_name())),
                Err(OpStatus::KeyNotFound) => Ok(None),
                Err(e) => Err(e),
            }
        }))
        .await;
    match result {
        Ok(Some(name)) => RespValue::SimpleString(Bytes::from_static(name.as_bytes())),
        Ok(None) => RespValue::SimpleString(Bytes::from_static(b"none")),
        Err(e) => e.to_resp(),
    }
}
