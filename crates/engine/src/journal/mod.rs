//! Shard journal
//!
//! Every write command records a journal entry on its owning shard; a
//! streamer fiber drains a subscription and pushes the entries to a
//! replication socket. The journal itself is shard-local and lock-free;
//! only the subscriber registry is shared with streamer setup.

pub mod streamer;

use bytes::Bytes;
use ember_core::{DbIndex, TxId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    Command,
    Lsn,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub txid: TxId,
    pub op: JournalOp,
    pub db: DbIndex,
    pub shard_cnt: u32,
    pub slot: Option<u32>,
    pub lsn: u64,
    /// Command name followed by its arguments.
    pub payload: Vec<Vec<u8>>,
}

pub struct Journal {
    next_lsn: u64,
    next_sub_id: u32,
    subscribers: Vec<(u32, mpsc::UnboundedSender<JournalEntry>)>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self {
            next_lsn: 1,
            next_sub_id: 1,
            subscribers: Vec::new(),
        }
    }

    pub fn lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Record a write command.
    pub fn record_command(
        &mut self,
        txid: TxId,
        db: DbIndex,
        shard_cnt: u32,
        slot: Option<u32>,
        cmd: &str,
        args: &[Bytes],
    ) {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(cmd.as_bytes().to_vec());
        payload.extend(args.iter().map(|a| a.to_vec()));
        self.push(JournalEntry {
            txid,
            op: JournalOp::Command,
            db,
            shard_cnt,
            slot,
            lsn: 0,
            payload,
        });
    }

    fn push(&mut self, mut entry: JournalEntry) {
        entry.lsn = self.next_lsn;
        self.next_lsn += 1;
        debug!(lsn = entry.lsn, op = ?entry.op, "journal record");
        self.subscribers
            .retain(|(_, tx)| tx.send(entry.clone()).is_ok());
    }

    pub fn subscribe(&mut self) -> (u32, mpsc::UnboundedReceiver<JournalEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.subscribers.push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: u32) {
        self.subscribers.retain(|(i, _)| *i != id);
    }
}
