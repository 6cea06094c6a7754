//! Tiered storage engine
//!
//! Offloads cold string values to a page-aligned file, one per shard.
//! Values at least a page large occupy whole pages; smaller values are
//! batched into shared bin pages. All I/O is asynchronous: stash and fetch
//! requests are issued here, their completions arrive back at the shard
//! executor as [`IoEvent`] messages and are applied by
//! [`TieredStorage::on_io_event`] with the shard's `DbSlice` at hand. The
//! back-reference from an in-flight request to its entry is always
//! `(db index, key bytes)`, re-resolved through the prime table on
//! completion, so eviction during I/O is safe.
//!
//! Per-entry state machine:
//!
//! ```text
//! INLINE/HEAP --try_stash--> IO_PENDING --stash ok--> EXTERNAL
//!                                       \-stash err-> INLINE/HEAP
//! EXTERNAL --read--> EXTERNAL (+ optional upload -> INLINE/HEAP)
//! EXTERNAL --modify--> INLINE/HEAP (old segment freed)
//! EXTERNAL --delete--> (gone)
//! IO_PENDING --cancel--> INLINE/HEAP
//! ```

pub mod disk_storage;
pub mod small_bins;

use crate::compact::{CompactValue, ObjType};
use crate::db_slice::DbSlice;
use disk_storage::{DiskStats, DiskStorage};
use ember_core::{Config, DbIndex};
use small_bins::{BinId, SmallBins, MAX_SMALL_VALUE};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Fixed page size of the tiered file.
pub const PAGE_SIZE: usize = 4096;

/// Iteration ceiling of one offloading sweep.
const MAX_OFFLOAD_ITERATIONS: usize = 500;

/// A page-aligned region of the tiered file holding one value (or, for bin
/// pages, several).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskSegment {
    pub offset: u64,
    pub length: usize,
}

impl DiskSegment {
    fn of(value: &CompactValue) -> Option<Self> {
        value.get_external_slice().map(|(offset, len)| Self {
            offset,
            length: len as usize,
        })
    }
}

fn occupies_whole_pages(len: usize) -> bool {
    len > MAX_SMALL_VALUE
}

/// Identity of an in-flight stash request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Key(DbIndex, Vec<u8>),
    Bin(BinId),
}

/// I/O completion delivered to the shard executor loop.
pub enum IoEvent {
    Stashed {
        id: EntryKey,
        segment: DiskSegment,
        result: io::Result<()>,
    },
    Fetched {
        offset: u64,
        result: io::Result<Vec<u8>>,
    },
}

/// Fetch callback: receives (is_raw, buffer) and returns whether it
/// modified the buffer (forcing a re-upload).
type ReadCb = Box<dyn FnOnce(&mut bool, &mut Vec<u8>) -> bool>;

struct PendingRead {
    segment: DiskSegment,
    key: Option<(DbIndex, Vec<u8>)>,
    callbacks: Vec<ReadCb>,
    defrag: bool,
}

struct PendingStash {
    cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TieredStats {
    pub total_stashes: u64,
    pub total_fetches: u64,
    pub total_cancels: u64,
    pub total_defrags: u64,
    pub total_deletes: u64,
    pub total_stash_overflows: u64,
    pub pending_read_cnt: usize,
    pub pending_stash_cnt: usize,
    pub allocated_bytes: u64,
    pub capacity_bytes: u64,
    pub small_bins_cnt: usize,
    pub small_bins_entries_cnt: usize,
    pub small_bins_filling_bytes: usize,
}

#[derive(Default)]
struct Counters {
    total_stashes: u64,
    total_fetches: u64,
    total_cancels: u64,
    total_defrags: u64,
    total_deletes: u64,
    stash_overflow_cnt: u64,
}

pub struct TieredStorage {
    disk: DiskStorage,
    bins: SmallBins,
    pending_stashes: HashMap<EntryKey, PendingStash>,
    pending_reads: HashMap<u64, PendingRead>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    cache_fetched: bool,
    write_depth_limit: usize,
    min_value_size: usize,
    snapshotting: bool,
    offloading_cursor: u64,
    stats: Counters,
}

impl TieredStorage {
    /// Open the shard's page file at `<tiered_path><shard_id>`.
    pub fn open(
        config: &Config,
        shard_id: u32,
        io_tx: mpsc::UnboundedSender<IoEvent>,
    ) -> io::Result<Self> {
        let path = PathBuf::from(format!("{}{}", config.tiered_path, shard_id));
        Ok(Self {
            disk: DiskStorage::open(&path, config.tiered_max_file_size)?,
            bins: SmallBins::new(config.tiered_defrag_ratio),
            pending_stashes: HashMap::new(),
            pending_reads: HashMap::new(),
            io_tx,
            cache_fetched: config.tiered_storage_cache_fetched,
            write_depth_limit: config.tiered_storage_write_depth,
            min_value_size: config.tiered_min_value_size,
            snapshotting: false,
            offloading_cursor: 0,
            stats: Counters::default(),
        })
    }

    /// A snapshot in progress suspends offloading and read caching.
    pub fn set_snapshotting(&mut self, on: bool) {
        self.snapshotting = on;
    }

    pub fn stats(&self) -> TieredStats {
        let disk: DiskStats = self.disk.stats();
        let bins = self.bins.stats();
        TieredStats {
            total_stashes: self.stats.total_stashes,
            total_fetches: self.stats.total_fetches,
            total_cancels: self.stats.total_cancels,
            total_defrags: self.stats.total_defrags,
            total_deletes: self.stats.total_deletes,
            total_stash_overflows: self.stats.stash_overflow_cnt,
            pending_read_cnt: self.pending_reads.len(),
            pending_stash_cnt: self.pending_stashes.len(),
            allocated_bytes: disk.allocated_bytes,
            capacity_bytes: disk.capacity_bytes,
            small_bins_cnt: bins.stashed_bins_cnt,
            small_bins_entries_cnt: bins.stashed_entries_cnt,
            small_bins_filling_bytes: bins.current_bin_bytes,
        }
    }

    /// Fraction of the write-depth budget currently in flight.
    pub fn write_depth_usage(&self) -> f32 {
        self.pending_stashes.len() as f32 / self.write_depth_limit as f32
    }

    fn spawn_io<F>(&self, fut: F)
    where
        F: Future<Output = IoEvent> + 'static,
    {
        let tx = self.io_tx.clone();
        tokio::task::spawn_local(async move {
            let _ = tx.send(fut.await);
        });
    }

    fn should_stash(&self, value: &CompactValue) -> bool {
        let disk = self.disk.stats();
        !value.is_external()
            && !value.has_io_pending()
            && !value.is_sticky()
            && value.obj_type() == ObjType::String
            && value.size() >= self.min_value_size
            && disk.allocated_bytes + (PAGE_SIZE + value.size()) as u64 <= disk.max_file_size
    }

    /// Try to move a value to disk. Returns true when a stash request was
    /// accepted (the value is `IO_PENDING` until completion).
    pub fn try_stash(&mut self, db_slice: &mut DbSlice, dbid: DbIndex, key: &[u8]) -> bool {
        let raw = {
            let table = db_slice.table(dbid);
            let Some(pos) = table.prime.find(key) else {
                return false;
            };
            let Some(value) = table.prime.value(pos) else {
                return false;
            };
            if !self.should_stash(value) {
                return false;
            }
            debug_assert!(!self.bins.is_pending(dbid, key));
            if self.pending_stashes.len() >= self.write_depth_limit {
                self.stats.stash_overflow_cnt += 1;
                return false;
            }
            match value.get_raw_bytes() {
                Some(raw) => raw.to_vec(),
                None => return false,
            }
        };

        if occupies_whole_pages(raw.len()) {
            let Some(segment) = self.disk.allocate(raw.len()) else {
                return false;
            };
            self.mark_io_pending(db_slice, dbid, key, true);
            let id = EntryKey::Key(dbid, key.to_vec());
            self.pending_stashes
                .insert(id.clone(), PendingStash { cancelled: false });
            let fut = self.disk.write(segment.offset, raw);
            self.spawn_io(async move {
                IoEvent::Stashed {
                    id,
                    segment,
                    result: fut.await,
                }
            });
        } else {
            self.mark_io_pending(db_slice, dbid, key, true);
            if let Some((bin_id, page)) = self.bins.stash(dbid, key, &raw) {
                if !self.stash_bin_page(db_slice, bin_id, page) {
                    // the new entry stays in the next filling bin
                    return true;
                }
            }
        }
        true
    }

    fn stash_bin_page(&mut self, db_slice: &mut DbSlice, bin_id: BinId, page: Vec<u8>) -> bool {
        let Some(segment) = self.disk.allocate(page.len()) else {
            for (dbid, key) in self.bins.report_stash_aborted(bin_id) {
                self.mark_io_pending(db_slice, dbid, &key, false);
                self.stats.total_cancels += 1;
            }
            return false;
        };
        let id = EntryKey::Bin(bin_id);
        self.pending_stashes
            .insert(id.clone(), PendingStash { cancelled: false });
        let fut = self.disk.write(segment.offset, page);
        self.spawn_io(async move {
            IoEvent::Stashed {
                id,
                segment,
                result: fut.await,
            }
        });
        true
    }

    /// Push out the partially filled bin (periodic maintenance).
    pub fn flush_filling_bin(&mut self, db_slice: &mut DbSlice) {
        if let Some((bin_id, page)) = self.bins.force_flush() {
            self.stash_bin_page(db_slice, bin_id, page);
        }
    }

    /// Fetch an offloaded value; resolves to the decoded logical string.
    pub fn read(
        &mut self,
        dbid: DbIndex,
        key: &[u8],
        value: &CompactValue,
    ) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let Some(segment) = DiskSegment::of(value) else {
            return rx;
        };
        // the raw bytes may be ASCII-packed; carry the encoding flags in a
        // decoder cell so the fetched image decodes into the logical string
        let mut decoder = CompactValue::new();
        decoder.import_external(value);
        let cb: ReadCb = Box::new(move |is_raw, buf| {
            let out = if *is_raw {
                let mut d = decoder;
                d.materialize(buf, true);
                d.get_string()
            } else {
                buf.clone()
            };
            let _ = tx.send(out);
            false
        });
        self.enqueue_read(segment, Some((dbid, key.to_vec())), cb, false);
        rx
    }

    /// Fetch, decode, hand a mutable string to `modf` and re-upload the
    /// result; resolves to `modf`'s return value.
    pub fn modify<T, F>(
        &mut self,
        dbid: DbIndex,
        key: &[u8],
        value: &CompactValue,
        modf: F,
    ) -> oneshot::Receiver<T>
    where
        T: 'static,
        F: FnOnce(&mut Vec<u8>) -> T + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let Some(segment) = DiskSegment::of(value) else {
            return rx;
        };
        let mut decoder = CompactValue::new();
        decoder.import_external(value);
        let cb: ReadCb = Box::new(move |is_raw, buf| {
            if *is_raw {
                let mut d = decoder;
                d.materialize(buf, true);
                *buf = d.get_string();
                *is_raw = false;
            }
            let _ = tx.send(modf(buf));
            true
        });
        self.enqueue_read(segment, Some((dbid, key.to_vec())), cb, false);
        rx
    }

    fn enqueue_read(
        &mut self,
        segment: DiskSegment,
        key: Option<(DbIndex, Vec<u8>)>,
        cb: ReadCb,
        defrag: bool,
    ) {
        match self.pending_reads.entry(segment.offset) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().callbacks.push(cb);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(PendingRead {
                    segment,
                    key,
                    callbacks: vec![cb],
                    defrag,
                });
                let fut = self.disk.read(segment);
                let offset = segment.offset;
                self.spawn_io(async move {
                    IoEvent::Fetched {
                        offset,
                        result: fut.await,
                    }
                });
            }
        }
    }

    /// Release the disk space of an external value that is being deleted or
    /// overwritten. The caller owns the in-table bookkeeping. REF views
    /// carry the descriptor but do not own the segment; they are refused.
    pub fn free_external(&mut self, value: &CompactValue) {
        if value.is_ref() {
            return;
        }
        let Some(segment) = DiskSegment::of(value) else {
            return;
        };
        self.stats.total_deletes += 1;
        self.delete_offloaded(segment);
    }

    fn delete_offloaded(&mut self, segment: DiskSegment) {
        if occupies_whole_pages(segment.length) {
            self.disk.mark_free(segment);
            return;
        }
        let Some(bin) = self.bins.delete(segment) else {
            return;
        };
        if bin.empty {
            self.disk.mark_free(bin.segment);
        } else if bin.fragmented {
            debug!(offset = bin.segment.offset, "enqueueing bin defragmentation");
            let cb: ReadCb = Box::new(|_, _| false);
            self.enqueue_read(bin.segment, None, cb, true);
        }
    }

    /// Cancel an in-flight stash for a value being deleted or overwritten.
    pub fn cancel_stash(&mut self, dbid: DbIndex, key: &[u8], value: &mut CompactValue) {
        debug_assert!(value.has_io_pending());
        let raw_len = value.get_raw_bytes().map(|r| r.len()).unwrap_or(0);
        if occupies_whole_pages(raw_len) {
            if let Some(p) = self
                .pending_stashes
                .get_mut(&EntryKey::Key(dbid, key.to_vec()))
            {
                p.cancelled = true;
            }
        } else {
            self.bins.cancel(dbid, key);
        }
        value.set_io_pending(false);
        self.stats.total_cancels += 1;
    }

    /// Background offloading sweep: walk the prime table in segment order
    /// and stash eligible cold entries until the write depth is exhausted,
    /// the traversal wraps, or the iteration budget runs out. Values that
    /// were touched since the last sweep get a second chance instead.
    pub fn run_offloading(&mut self, db_slice: &mut DbSlice, dbid: DbIndex) {
        if self.snapshotting {
            return;
        }
        let disk = self.disk.stats();
        if disk.allocated_bytes + (MAX_OFFLOAD_ITERATIONS / 2 * PAGE_SIZE) as u64
            > disk.max_file_size
        {
            return;
        }

        let mut iterations = 0usize;
        loop {
            if self.pending_stashes.len() >= self.write_depth_limit {
                break;
            }
            let mut positions = Vec::new();
            let next = db_slice
                .table(dbid)
                .prime
                .traverse_by_segment_order(self.offloading_cursor, |pos| positions.push(pos));
            for pos in positions {
                let table = db_slice.table_mut(dbid);
                let Some(key) = table.prime.key_bytes(pos) else {
                    continue;
                };
                let touched = table
                    .prime
                    .value(pos)
                    .map(|v| v.was_touched())
                    .unwrap_or(false);
                if touched {
                    if let Some(v) = table.prime.value_mut(pos) {
                        v.set_touched(false);
                    }
                    continue;
                }
                self.try_stash(db_slice, dbid, &key);
            }
            self.offloading_cursor = next;
            iterations += 1;
            if next == 0 || iterations >= MAX_OFFLOAD_ITERATIONS {
                break;
            }
        }
    }

    // ==================== completions ====================

    /// Apply an I/O completion. Runs on the shard executor with exclusive
    /// access to the slice.
    pub fn on_io_event(&mut self, db_slice: &mut DbSlice, event: IoEvent) {
        match event {
            IoEvent::Stashed {
                id,
                segment,
                result,
            } => self.on_stashed(db_slice, id, segment, result),
            IoEvent::Fetched { offset, result } => self.on_fetched(db_slice, offset, result),
        }
    }

    fn on_stashed(
        &mut self,
        db_slice: &mut DbSlice,
        id: EntryKey,
        segment: DiskSegment,
        result: io::Result<()>,
    ) {
        let cancelled = self
            .pending_stashes
            .remove(&id)
            .map(|p| p.cancelled)
            .unwrap_or(true);
        match result {
            Ok(()) => match id {
                EntryKey::Key(dbid, key) => {
                    if cancelled || !self.set_external_entry(db_slice, dbid, &key, segment) {
                        self.disk.mark_free(segment);
                    }
                }
                EntryKey::Bin(bin_id) => {
                    let entries = self.bins.report_stashed(bin_id, segment.offset);
                    let mut any = false;
                    for (dbid, key, sub) in entries {
                        any |= self.set_external_entry(db_slice, dbid, &key, sub);
                    }
                    if !any {
                        // nothing in the bin survived; take the page back
                        for (dbid2, key2, _) in self.bins.delete_bin(DiskSegment {
                            offset: segment.offset,
                            length: PAGE_SIZE,
                        }) {
                            self.mark_io_pending(db_slice, dbid2, &key2, false);
                        }
                        self.disk.mark_free(segment);
                    }
                }
            },
            Err(e) => {
                warn!(error = %e, "stash failed");
                self.disk.mark_free(segment);
                match id {
                    EntryKey::Key(dbid, key) => {
                        self.mark_io_pending(db_slice, dbid, &key, false);
                        self.stats.total_cancels += 1;
                    }
                    EntryKey::Bin(bin_id) => {
                        for (dbid, key) in self.bins.report_stash_aborted(bin_id) {
                            self.mark_io_pending(db_slice, dbid, &key, false);
                            self.stats.total_cancels += 1;
                        }
                    }
                }
            }
        }
    }

    fn on_fetched(&mut self, db_slice: &mut DbSlice, offset: u64, result: io::Result<Vec<u8>>) {
        let Some(read) = self.pending_reads.remove(&offset) else {
            return;
        };
        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                // dropping the callbacks resolves waiting futures with an
                // error on the receiver side
                error!(error = %e, offset, "fetch failed");
                return;
            }
        };
        if read.defrag {
            self.defragment(db_slice, read.segment, &bytes);
            return;
        }

        self.stats.total_fetches += 1;
        let mut buf = bytes;
        let mut is_raw = true;
        let mut modified = false;
        for cb in read.callbacks {
            modified |= cb(&mut is_raw, &mut buf);
        }

        let should_upload = modified || (self.cache_fetched && !self.snapshotting);
        if !should_upload {
            return;
        }
        let Some((dbid, key)) = read.key else {
            return;
        };
        if self.upload(db_slice, dbid, &key, read.segment, &buf, is_raw) {
            // the value lives in memory again; its segment is dead
            self.delete_offloaded(read.segment);
        }
    }

    /// Load live values of a fragmented bin page back to memory, then free
    /// the page.
    fn defragment(&mut self, db_slice: &mut DbSlice, page_segment: DiskSegment, page: &[u8]) {
        for (dbid, key, sub) in self.bins.delete_bin(page_segment) {
            let start = (sub.offset - page_segment.offset) as usize;
            let raw = &page[start..start + sub.length];
            if self.upload(db_slice, dbid, &key, sub, raw, true) {
                self.stats.total_defrags += 1;
            }
        }
        self.disk.mark_free(page_segment);
    }

    /// Re-materialize an external value in memory if it still points at
    /// `segment`. Returns whether the upload happened.
    fn upload(
        &mut self,
        db_slice: &mut DbSlice,
        dbid: DbIndex,
        key: &[u8],
        segment: DiskSegment,
        data: &[u8],
        is_raw: bool,
    ) -> bool {
        let table = db_slice.table_mut(dbid);
        let Some(pos) = table.prime.find(key) else {
            return false;
        };
        let (prime, stats) = table.prime_and_stats();
        let Some(value) = prime.value_mut(pos) else {
            return false;
        };
        if !value.is_external() || DiskSegment::of(value) != Some(segment) {
            return false;
        }
        value.materialize(data, is_raw);
        stats.tiered_entries -= 1;
        stats.tiered_used_bytes -= segment.length as i64;
        stats.per_type_memory[ObjType::String.as_index()] += value.malloc_used() as i64;
        true
    }

    /// Install the external descriptor after a successful stash.
    fn set_external_entry(
        &mut self,
        db_slice: &mut DbSlice,
        dbid: DbIndex,
        key: &[u8],
        segment: DiskSegment,
    ) -> bool {
        let table = db_slice.table_mut(dbid);
        let Some(pos) = table.prime.find(key) else {
            return false;
        };
        let (prime, stats) = table.prime_and_stats();
        let Some(value) = prime.value_mut(pos) else {
            return false;
        };
        if !value.has_io_pending() {
            // overwritten or cancelled while the write was in flight
            return false;
        }
        stats.per_type_memory[ObjType::String.as_index()] -= value.malloc_used() as i64;
        stats.tiered_entries += 1;
        stats.tiered_used_bytes += segment.length as i64;
        value.set_external(segment.offset, segment.length as u32);
        self.stats.total_stashes += 1;
        true
    }

    fn mark_io_pending(&self, db_slice: &mut DbSlice, dbid: DbIndex, key: &[u8], on: bool) {
        let table = db_slice.table_mut(dbid);
        if let Some(pos) = table.prime.find(key) {
            if let Some(v) = table.prime.value_mut(pos) {
                v.set_io_pending(on);
            }
        }
    }
}
