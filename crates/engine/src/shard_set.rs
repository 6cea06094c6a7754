//! Shard set
//!
//! Owns the shard executors and routes keys to them by CRC16 slot. The
//! coordinator side of every command talks to shards exclusively through
//! this handle.

use crate::shard::{spawn_shard, EngineShard, ShardMessage};
use ember_core::{routing, Config, ShardId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub struct ShardSet {
    config: Arc<Config>,
    shards: Vec<mpsc::UnboundedSender<ShardMessage>>,
    next_txid: AtomicU64,
}

impl ShardSet {
    pub fn new(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let shards = (0..config.shard_count)
            .map(|sid| spawn_shard(sid, config.clone()))
            .collect();
        Arc::new(Self {
            config,
            shards,
            next_txid: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn shard_count(&self) -> u32 {
        self.config.shard_count
    }

    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        routing::shard_for_key(key, self.config.shard_count)
    }

    pub fn next_txid(&self) -> u64 {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send(&self, sid: ShardId, msg: ShardMessage) {
        if let Some(tx) = self.shards.get(sid as usize) {
            let _ = tx.send(msg);
        }
    }

    /// Run a closure on a shard outside any transaction (admin paths,
    /// streamer setup, tests).
    pub async fn run_on_shard<R, F>(&self, sid: ShardId, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(
            sid,
            ShardMessage::Hop(Box::new(move |shard| {
                let _ = tx.send(f(shard));
            })),
        );
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        for tx in &self.shards {
            let _ = tx.send(ShardMessage::Shutdown);
        }
    }
}
