//! Blocking command support
//!
//! Commands like BZPOPMIN register a watcher on their key set while holding
//! the shard lock; a concluding write transaction notifies watchers of the
//! keys it touched. The woken coordinator re-evaluates its predicate under
//! a fresh shard hop, so spurious wakeups are harmless.

use ember_core::DbIndex;
use tokio::sync::mpsc;

struct Watcher {
    id: u64,
    db: DbIndex,
    key: Vec<u8>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
pub struct BlockingController {
    watchers: Vec<Watcher>,
}

impl BlockingController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for every key in `keys`, replacing any previous
    /// registration under the same id.
    pub fn add_watcher(
        &mut self,
        id: u64,
        db: DbIndex,
        keys: &[Vec<u8>],
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        self.remove_watcher(id);
        for key in keys {
            self.watchers.push(Watcher {
                id,
                db,
                key: key.clone(),
                tx: tx.clone(),
            });
        }
    }

    pub fn remove_watcher(&mut self, id: u64) {
        self.watchers.retain(|w| w.id != id);
    }

    /// A write transaction touched `key`: wake everyone watching it except
    /// the transaction itself (a blocking command's own conclude must not
    /// wake its own watcher).
    pub fn notify(&mut self, db: DbIndex, key: &[u8], writer: u64) {
        self.watchers.retain(|w| {
            !(w.db == db && w.key == key && w.id != writer) || w.tx.send(key.to_vec()).is_ok()
        });
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_wakes_matching_watchers() {
        let mut bc = BlockingController::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bc.add_watcher(1, 0, &[b"a".to_vec(), b"b".to_vec()], tx);
        assert_eq!(bc.watcher_count(), 2);

        bc.notify(0, b"a", 99);
        assert_eq!(rx.try_recv().unwrap(), b"a".to_vec());

        // wrong db does not wake
        bc.notify(1, b"b", 99);
        assert!(rx.try_recv().is_err());

        bc.remove_watcher(1);
        bc.notify(0, b"b", 99);
        assert!(rx.try_recv().is_err());
        assert_eq!(bc.watcher_count(), 0);
    }

    #[test]
    fn test_own_transaction_does_not_wake_itself() {
        let mut bc = BlockingController::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bc.add_watcher(7, 0, &[b"k".to_vec()], tx);
        bc.notify(0, b"k", 7);
        assert!(rx.try_recv().is_err());
        bc.notify(0, b"k", 8);
        assert_eq!(rx.try_recv().unwrap(), b"k".to_vec());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut bc = BlockingController::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bc.add_watcher(9, 0, &[b"k".to_vec()], tx1);
        bc.add_watcher(9, 0, &[b"k".to_vec()], tx2);
        bc.notify(0, b"k", 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), b"k".to_vec());
    }
}
