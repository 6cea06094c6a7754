//! Transaction coordination
//!
//! A transaction is a structured handle over a command's key set. Its
//! lifecycle is schedule (acquire per-shard intent locks in ascending
//! shard order, which makes the global order deterministic and
//! deadlock-free), one or more hops (a closure dispatched to every
//! participating shard executor), and conclude (release locks, wake
//! blocked waiters). Within a shard, lock requests are granted strictly
//! first-in first-out, so any two overlapping transactions are observed in
//! the same order by every shard.

use crate::error::{OpResult, OpStatus};
use crate::shard::{OpArgs, ShardMessage};
use crate::shard_set::ShardSet;
use bytes::Bytes;
use ember_core::{time, DbIndex, ShardId, TxId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use storage::DbContext;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub struct LockRequest {
    pub txid: TxId,
    pub db: DbIndex,
    pub keys: Vec<Vec<u8>>,
    pub mode: LockMode,
    pub granted: oneshot::Sender<()>,
}

struct HeldLock {
    mode: LockMode,
    count: u32,
}

/// Per-shard intent lock table with head-of-line FIFO waiting.
#[derive(Default)]
pub struct IntentLocks {
    held: HashMap<(DbIndex, Vec<u8>), HeldLock>,
    queue: VecDeque<LockRequest>,
}

impl IntentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn compatible(&self, req: &LockRequest) -> bool {
        req.keys.iter().all(|k| {
            match self.held.get(&(req.db, k.clone())) {
                None => true,
                Some(h) => h.mode == LockMode::Shared && req.mode == LockMode::Shared,
            }
        })
    }

    fn grant(&mut self, req: LockRequest) {
        for k in &req.keys {
            let e = self
                .held
                .entry((req.db, k.clone()))
                .or_insert(HeldLock {
                    mode: req.mode,
                    count: 0,
                });
            e.count += 1;
        }
        let _ = req.granted.send(());
    }

    pub fn acquire(&mut self, req: LockRequest) {
        if self.queue.is_empty() && self.compatible(&req) {
            self.grant(req);
        } else {
            self.queue.push_back(req);
        }
    }

    pub fn release(&mut self, _txid: TxId, db: DbIndex, keys: &[Vec<u8>]) {
        for k in keys {
            if let Some(h) = self.held.get_mut(&(db, k.clone())) {
                h.count -= 1;
                if h.count == 0 {
                    self.held.remove(&(db, k.clone()));
                }
            }
        }
        // grant in arrival order; the queue head gates everyone behind it
        while let Some(front) = self.queue.front() {
            if self.compatible(front) {
                if let Some(req) = self.queue.pop_front() {
                    self.grant(req);
                }
            } else {
                break;
            }
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

pub type ShardFn<R> = Arc<dyn Fn(&mut OpArgs<'_>) -> OpResult<R> + Send + Sync>;

/// Multi-shard transaction handle.
pub struct Transaction {
    txid: TxId,
    db: DbIndex,
    mode: LockMode,
    shard_keys: BTreeMap<ShardId, Vec<Bytes>>,
    shard_set: Arc<ShardSet>,
    scheduled: bool,
    concluded: bool,
}

impl Transaction {
    pub fn new(shard_set: &Arc<ShardSet>, db: DbIndex, keys: &[Bytes], mode: LockMode) -> Self {
        let mut shard_keys: BTreeMap<ShardId, Vec<Bytes>> = BTreeMap::new();
        for key in keys {
            let sid = shard_set.shard_for_key(key);
            let entry = shard_keys.entry(sid).or_default();
            if !entry.contains(key) {
                entry.push(key.clone());
            }
        }
        Self {
            txid: shard_set.next_txid(),
            db,
            mode,
            shard_keys,
            shard_set: shard_set.clone(),
            scheduled: false,
            concluded: false,
        }
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shard_keys.keys().copied().collect()
    }

    pub fn keys_on_shard(&self, sid: ShardId) -> &[Bytes] {
        self.shard_keys
            .get(&sid)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Acquire intent locks shard by shard in ascending order.
    pub async fn schedule(&mut self) {
        if self.scheduled {
            return;
        }
        for (&sid, keys) in &self.shard_keys {
            let (granted_tx, granted_rx) = oneshot::channel();
            self.shard_set.send(
                sid,
                ShardMessage::Lock {
                    txid: self.txid,
                    db: self.db,
                    keys: keys.iter().map(|k| k.to_vec()).collect(),
                    mode: self.mode,
                    granted: granted_tx,
                },
            );
            // a dropped grant means the shard is shutting down; hops will
            // fail the same way, so proceed
            let _ = granted_rx.await;
        }
        self.scheduled = true;
        debug!(txid = self.txid, shards = ?self.shard_ids(), "transaction scheduled");
    }

    /// Run one hop on every participating shard. With `is_last`, the
    /// transaction concludes once all per-shard results arrived.
    pub async fn execute<R: Send + 'static>(
        &mut self,
        f: ShardFn<R>,
        is_last: bool,
    ) -> Vec<(ShardId, OpResult<R>)> {
        self.schedule().await;
        let mut pending = Vec::new();
        for &sid in self.shard_keys.keys() {
            let (res_tx, res_rx) = oneshot::channel();
            let f = f.clone();
            let db = self.db;
            let txid = self.txid;
            self.shard_set.send(
                sid,
                ShardMessage::Hop(Box::new(move |shard| {
                    let db_cntx = DbContext {
                        db_index: db,
                        time_now_ms: time::now_ms(),
                    };
                    let mut args = OpArgs {
                        shard,
                        db_cntx,
                        txid,
                    };
                    let r = f(&mut args);
                    let _ = res_tx.send(r);
                })),
            );
            pending.push((sid, res_rx));
        }
        let mut results = Vec::with_capacity(pending.len());
        for (sid, rx) in pending {
            let r = rx.await.unwrap_or(Err(OpStatus::Cancelled));
            results.push((sid, r));
        }
        if is_last {
            self.conclude().await;
        }
        results
    }

    /// Fast path for single-hop commands: schedule, hop, conclude.
    pub async fn schedule_single_hop<R: Send + 'static>(mut self, f: ShardFn<R>) -> OpResult<R> {
        let mut results = self.execute(f, true).await;
        match results.len() {
            0 => Err(OpStatus::KeyNotFound),
            _ => results.remove(0).1,
        }
    }

    /// Release locks and wake blocked waiters (for write transactions).
    pub async fn conclude(&mut self) {
        if self.concluded || !self.scheduled {
            self.concluded = true;
            return;
        }
        for (&sid, keys) in &self.shard_keys {
            self.shard_set.send(
                sid,
                ShardMessage::Unlock {
                    txid: self.txid,
                    db: self.db,
                    keys: keys.iter().map(|k| k.to_vec()).collect(),
                    wake: self.mode == LockMode::Exclusive,
                },
            );
        }
        self.concluded = true;
        debug!(txid = self.txid, "transaction concluded");
    }

    /// Wait until one of the transaction's keys is written by another
    /// transaction, or the deadline passes. Watchers must already be
    /// registered through a hop; this only parks the coordinator.
    pub async fn wait_for_wakeup(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        deadline: Option<tokio::time::Instant>,
    ) -> OpResult<Vec<u8>> {
        match deadline {
            None => rx.recv().await.ok_or(OpStatus::Cancelled),
            Some(d) => match tokio::time::timeout_at(d, rx.recv()).await {
                Ok(Some(key)) => Ok(key),
                Ok(None) => Err(OpStatus::Cancelled),
                Err(_) => Err(OpStatus::TimedOut),
            },
        }
    }
}
