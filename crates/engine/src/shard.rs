//! Shard executor
//!
//! One single-threaded cooperative executor per shard: a dedicated OS
//! thread running a current-thread tokio runtime with a `LocalSet`. All
//! access to the shard's `DbSlice`, intent locks and tiered structures
//! happens on this thread; work arrives as messages (transaction hops,
//! lock requests, shutdown) and tiered I/O completions, and a periodic
//! tick drives the expiry scan and the cold offloading sweep.

use crate::blocking::BlockingController;
use crate::journal::Journal;
use crate::transaction::{IntentLocks, LockMode, LockRequest};
use bytes::Bytes;
use ember_core::{time, Config, DbIndex, ShardId, TxId};
use std::sync::Arc;
use storage::tiered::IoEvent;
use storage::{DbContext, DbSlice, TieredStorage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Interval of the shard maintenance tick.
const TICK_INTERVAL_MS: u64 = 100;
/// Expire-table buckets sampled per tick and database.
const EXPIRE_SCAN_BUCKETS: usize = 16;
/// Every this many ticks a partially filled tiered bin is pushed out.
const BIN_FLUSH_TICKS: u64 = 10;

pub enum ShardMessage {
    /// Run a closure with exclusive access to the shard.
    Hop(Box<dyn FnOnce(&mut EngineShard) + Send>),
    Lock {
        txid: TxId,
        db: DbIndex,
        keys: Vec<Vec<u8>>,
        mode: LockMode,
        granted: oneshot::Sender<()>,
    },
    Unlock {
        txid: TxId,
        db: DbIndex,
        keys: Vec<Vec<u8>>,
        /// Wake blocked waiters of these keys (set for write transactions).
        wake: bool,
    },
    Shutdown,
}

/// Arguments handed to a shard-local operation callback.
pub struct OpArgs<'a> {
    pub shard: &'a mut EngineShard,
    pub db_cntx: DbContext,
    pub txid: TxId,
}

impl<'a> OpArgs<'a> {
    /// Whether a key of the transaction's key set belongs to this shard.
    pub fn owns_key(&self, key: &[u8]) -> bool {
        ember_core::shard_for_key(key, self.shard.config.shard_count) == self.shard.shard_id
    }

    /// Record a write command into the shard journal.
    pub fn record_journal(&mut self, cmd: &str, args: &[Bytes]) {
        let shard_cnt = self.shard.config.shard_count;
        let slot = args.first().map(|k| ember_core::slot_for_key(k));
        self.shard
            .journal
            .record_command(self.txid, self.db_cntx.db_index, shard_cnt, slot, cmd, args);
    }
}

pub struct EngineShard {
    pub shard_id: ShardId,
    pub config: Arc<Config>,
    pub db_slice: DbSlice,
    pub tiered: Option<TieredStorage>,
    pub journal: Journal,
    pub locks: IntentLocks,
    pub blocking: BlockingController,
    tick_count: u64,
}

impl EngineShard {
    fn new(shard_id: ShardId, config: Arc<Config>, io_tx: mpsc::UnboundedSender<IoEvent>) -> Self {
        let tiered = if config.tiered_enabled() {
            match TieredStorage::open(&config, shard_id, io_tx) {
                Ok(t) => Some(t),
                Err(e) => {
                    error!(shard = shard_id, error = %e, "tiered storage unavailable");
                    None
                }
            }
        } else {
            None
        };
        Self {
            shard_id,
            config: config.clone(),
            db_slice: DbSlice::new(shard_id, config.db_count),
            tiered,
            journal: Journal::new(),
            locks: IntentLocks::new(),
            blocking: BlockingController::new(),
            tick_count: 0,
        }
    }

    pub fn db_context(&self, db: DbIndex) -> DbContext {
        DbContext {
            db_index: db,
            time_now_ms: time::now_ms(),
        }
    }

    /// Free tiered segments of values that were removed behind our back
    /// (lazy expiry).
    pub fn drain_dropped(&mut self) {
        for (_, value) in self.db_slice.take_dropped() {
            if value.is_external() {
                if let Some(t) = self.tiered.as_mut() {
                    t.free_external(&value);
                }
            }
        }
    }

    /// Delete a key, routing external values and in-flight stashes through
    /// the tiered engine first.
    pub fn delete_key(&mut self, cntx: &DbContext, key: &[u8]) -> bool {
        self.prepare_value_overwrite(cntx, key);
        self.db_slice.delete(cntx, key).is_some()
    }

    /// Make a key safe to overwrite or remove: cancel a pending stash or
    /// release its disk segment, fixing tiered accounting.
    pub fn prepare_value_overwrite(&mut self, cntx: &DbContext, key: &[u8]) {
        let Some(tiered) = self.tiered.as_mut() else {
            return;
        };
        let table = self.db_slice.table_mut(cntx.db_index);
        let Some(pos) = table.prime.find(key) else {
            return;
        };
        let (prime, stats) = table.prime_and_stats();
        let Some(value) = prime.value_mut(pos) else {
            return;
        };
        if value.has_io_pending() {
            tiered.cancel_stash(cntx.db_index, key, value);
        } else if value.is_external() {
            if let Some((_, len)) = value.get_external_slice() {
                // the caller is about to drop the descriptor; balance the
                // tiered counters unless deletion bookkeeping does it
                tiered.free_external(value);
                stats.tiered_entries -= 1;
                stats.tiered_used_bytes -= len as i64;
                value.reset();
            }
        }
    }

    fn on_tick(&mut self) {
        self.tick_count += 1;
        for db in 0..self.db_slice.db_count() as DbIndex {
            let cntx = self.db_context(db);
            self.db_slice.expire_scan_step(&cntx, EXPIRE_SCAN_BUCKETS);
        }
        if let Some(mut tiered) = self.tiered.take() {
            for db in 0..self.db_slice.db_count() as DbIndex {
                tiered.run_offloading(&mut self.db_slice, db);
            }
            if self.tick_count % BIN_FLUSH_TICKS == 0 {
                tiered.flush_filling_bin(&mut self.db_slice);
            }
            self.tiered = Some(tiered);
        }
        self.drain_dropped();
    }

    fn on_io(&mut self, event: IoEvent) {
        if let Some(mut tiered) = self.tiered.take() {
            tiered.on_io_event(&mut self.db_slice, event);
            self.tiered = Some(tiered);
        }
        self.drain_dropped();
    }

    fn handle(&mut self, msg: ShardMessage) -> bool {
        match msg {
            ShardMessage::Hop(f) => {
                f(self);
                self.drain_dropped();
            }
            ShardMessage::Lock {
                txid,
                db,
                keys,
                mode,
                granted,
            } => {
                self.locks.acquire(LockRequest {
                    txid,
                    db,
                    keys,
                    mode,
                    granted,
                });
            }
            ShardMessage::Unlock {
                txid,
                db,
                keys,
                wake,
            } => {
                self.locks.release(txid, db, &keys);
                if wake {
                    for key in &keys {
                        self.blocking.notify(db, key, txid);
                    }
                }
            }
            ShardMessage::Shutdown => return false,
        }
        true
    }
}

/// Spawn a shard executor thread; returns its message endpoint.
pub fn spawn_shard(shard_id: ShardId, config: Arc<Config>) -> mpsc::UnboundedSender<ShardMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    let builder = std::thread::Builder::new().name(format!("shard-{shard_id}"));
    let spawn_result = builder.spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(shard = shard_id, error = %e, "failed to build shard runtime");
                return;
            }
        };
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, shard_main(shard_id, config, rx));
        info!(shard = shard_id, "shard executor stopped");
    });
    if let Err(e) = spawn_result {
        error!(shard = shard_id, error = %e, "failed to spawn shard thread");
    }
    tx
}

async fn shard_main(
    shard_id: ShardId,
    config: Arc<Config>,
    mut rx: mpsc::UnboundedReceiver<ShardMessage>,
) {
    let (io_tx, mut io_rx) = mpsc::unbounded_channel();
    let mut shard = EngineShard::new(shard_id, config, io_tx);
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(TICK_INTERVAL_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!(shard = shard_id, "shard executor running");
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if !shard.handle(msg) {
                        break;
                    }
                }
                None => break,
            },
            Some(ev) = io_rx.recv() => shard.on_io(ev),
            _ = tick.tick() => shard.on_tick(),
        }
    }
}
