//! Per-shard database slice
//!
//! One `DbTable` per logical database: the prime table, the expire table
//! and per-type statistics. Find/add/delete resolve TTLs (an expired key is
//! absent, and is lazily removed on access), touch values for the cold
//! scan, and fire registered change callbacks so observers (blocking
//! waiters, replication capture) see every mutation.
//!
//! Values removed behind the caller's back (lazy expiry) are parked in a
//! drop list rather than freed in place: external values still own a disk
//! segment, and only the shard executor can return it to the tiered
//! allocator.

use crate::compact::{CompactValue, ObjType};
use crate::dense_table::DenseTable;
use crate::prime_table::{Pos, PrimeTable};
use crate::stats::DbTableStats;
use ember_core::DbIndex;
use tracing::debug;

/// Time context of one shard-local operation.
#[derive(Debug, Clone, Copy)]
pub struct DbContext {
    pub db_index: DbIndex,
    pub time_now_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindError {
    KeyNotFound,
    WrongType,
}

/// Mutation notification delivered to registered observers.
#[derive(Debug)]
pub enum ChangeEvent<'a> {
    /// A key was inserted.
    New { key: &'a [u8] },
    /// An existing key's value was mutated in place.
    Update { key: &'a [u8] },
    /// A key was removed.
    Del { key: &'a [u8] },
}

pub struct DbTable {
    pub prime: PrimeTable,
    pub expire: DenseTable<u64>,
    pub stats: DbTableStats,
}

impl DbTable {
    fn new() -> Self {
        Self {
            prime: PrimeTable::new(),
            expire: DenseTable::new(),
            stats: DbTableStats::default(),
        }
    }

    /// Split borrows for callers that mutate values while accounting.
    pub fn prime_and_stats(&mut self) -> (&mut PrimeTable, &mut DbTableStats) {
        (&mut self.prime, &mut self.stats)
    }
}

type ChangeCallback = Box<dyn FnMut(DbIndex, &ChangeEvent<'_>)>;

pub struct DbSlice {
    shard_id: u32,
    tables: Vec<DbTable>,
    callbacks: Vec<(u64, ChangeCallback)>,
    next_callback_id: u64,
    /// Values removed by lazy expiry; drained by the shard executor, which
    /// releases any tiered segments they still reference.
    dropped: Vec<(DbIndex, CompactValue)>,
    /// Per-db resumable cursor of the background expiry scan.
    expire_cursors: Vec<u64>,
}

impl DbSlice {
    pub fn new(shard_id: u32, db_count: u16) -> Self {
        Self {
            shard_id,
            tables: (0..db_count).map(|_| DbTable::new()).collect(),
            callbacks: Vec::new(),
            next_callback_id: 1,
            dropped: Vec::new(),
            expire_cursors: vec![0; db_count as usize],
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn table(&self, db: DbIndex) -> &DbTable {
        &self.tables[db as usize]
    }

    pub fn table_mut(&mut self, db: DbIndex) -> &mut DbTable {
        &mut self.tables[db as usize]
    }

    pub fn stats(&self, db: DbIndex) -> &DbTableStats {
        &self.tables[db as usize].stats
    }

    pub fn stats_mut(&mut self, db: DbIndex) -> &mut DbTableStats {
        &mut self.tables[db as usize].stats
    }

    // ==================== change callbacks ====================

    /// Register an observer; returns the handle for unregistration.
    pub fn register_on_change(&mut self, cb: ChangeCallback) -> u64 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.callbacks.push((id, cb));
        id
    }

    pub fn unregister_on_change(&mut self, id: u64) {
        self.callbacks.retain(|(i, _)| *i != id);
    }

    fn fire(&mut self, db: DbIndex, event: ChangeEvent<'_>) {
        if self.callbacks.is_empty() {
            return;
        }
        let mut cbs = std::mem::take(&mut self.callbacks);
        for (_, cb) in cbs.iter_mut() {
            cb(db, &event);
        }
        // registrations that happened during dispatch land behind the rest
        let mut added = std::mem::take(&mut self.callbacks);
        self.callbacks = cbs;
        self.callbacks.append(&mut added);
    }

    // ==================== expiry ====================

    /// Remove the key if its expiry is due. Returns true when it was.
    fn expire_if_needed(&mut self, cntx: &DbContext, key: &[u8]) -> bool {
        let due = match self.tables[cntx.db_index as usize].expire.get(key) {
            Some(&at) => at <= cntx.time_now_ms,
            None => return false,
        };
        if !due {
            return false;
        }
        debug!(shard = self.shard_id, key = ?String::from_utf8_lossy(key), "lazy expire");
        self.remove_entry(cntx.db_index, key);
        true
    }

    /// Millisecond TTL of a live key: None when the key has no expiry.
    pub fn ttl_ms(&self, cntx: &DbContext, key: &[u8]) -> Option<i64> {
        self.tables[cntx.db_index as usize]
            .expire
            .get(key)
            .map(|&at| at.saturating_sub(cntx.time_now_ms) as i64)
    }

    /// Set an absolute millisecond expiry on a live key.
    pub fn set_expire(&mut self, cntx: &DbContext, key: &[u8], at_ms: u64) -> bool {
        let table = &mut self.tables[cntx.db_index as usize];
        let pos = match table.prime.find(key) {
            Some(p) => p,
            None => return false,
        };
        if table.expire.insert(key, at_ms).is_none() {
            table.stats.expire_count += 1;
        }
        if let Some(v) = table.prime.value_mut(pos) {
            v.set_expire(true);
        }
        true
    }

    /// Drop the expiry of a key; returns whether one existed.
    pub fn persist(&mut self, cntx: &DbContext, key: &[u8]) -> bool {
        let table = &mut self.tables[cntx.db_index as usize];
        if table.expire.remove(key).is_none() {
            return false;
        }
        table.stats.expire_count -= 1;
        if let Some(pos) = table.prime.find(key) {
            if let Some(v) = table.prime.value_mut(pos) {
                v.set_expire(false);
            }
        }
        true
    }

    /// One bounded step of the background expiry scan for `db`. Returns the
    /// number of keys evicted.
    pub fn expire_scan_step(&mut self, cntx: &DbContext, max_buckets: usize) -> usize {
        let db = cntx.db_index as usize;
        let now = cntx.time_now_ms;
        let mut due: Vec<Vec<u8>> = Vec::new();
        let mut cursor = self.expire_cursors[db];
        for _ in 0..max_buckets {
            cursor = self.tables[db].expire.scan(cursor, |k, &at| {
                if at <= now {
                    due.push(k.to_vec());
                }
            });
            if cursor == 0 {
                break;
            }
        }
        self.expire_cursors[db] = cursor;
        let evicted = due.len();
        for key in due {
            self.remove_entry(cntx.db_index, &key);
        }
        evicted
    }

    // ==================== find / add / delete ====================

    /// Read-only lookup. Expired keys are absent (and lazily removed);
    /// found values are touched for the cold scan.
    pub fn find_read_only(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        expected: Option<ObjType>,
    ) -> Result<Pos, FindError> {
        self.find_common(cntx, key, expected)
    }

    /// Lookup for mutation. The caller mutates through
    /// [`value_mut`](Self::value_mut) (or [`update_value`](Self::update_value))
    /// and must invoke [`post_update`](Self::post_update) exactly once
    /// afterwards to fire change callbacks and refresh accounting.
    pub fn find_mutable(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        expected: Option<ObjType>,
    ) -> Result<Pos, FindError> {
        self.find_common(cntx, key, expected)
    }

    fn find_common(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        expected: Option<ObjType>,
    ) -> Result<Pos, FindError> {
        if self.expire_if_needed(cntx, key) {
            return Err(FindError::KeyNotFound);
        }
        let table = &mut self.tables[cntx.db_index as usize];
        let pos = table.prime.find(key).ok_or(FindError::KeyNotFound)?;
        if let (Some(t), Some(v)) = (expected, table.prime.value(pos)) {
            if v.obj_type() != t {
                return Err(FindError::WrongType);
            }
        }
        table.prime.touch(pos);
        Ok(pos)
    }

    /// Find or insert an empty-string entry for `key`. Fires the `New`
    /// callback on insertion.
    pub fn add_or_find(&mut self, cntx: &DbContext, key: &[u8]) -> (Pos, bool) {
        if let Ok(pos) = self.find_mutable(cntx, key, None) {
            return (pos, false);
        }
        let table = &mut self.tables[cntx.db_index as usize];
        let value = CompactValue::new();
        table.stats.add_value(&value);
        let pos = table.prime.insert(CompactValue::of(key), value);
        table.prime.touch(pos);
        self.fire(cntx.db_index, ChangeEvent::New { key });
        (pos, true)
    }

    pub fn value(&self, db: DbIndex, pos: Pos) -> Option<&CompactValue> {
        self.tables[db as usize].prime.value(pos)
    }

    pub fn value_mut(&mut self, db: DbIndex, pos: Pos) -> Option<&mut CompactValue> {
        self.tables[db as usize].prime.value_mut(pos)
    }

    /// Mutate the value at `pos` through a closure, then run the post-update
    /// protocol (stats refresh, version bump, change callback) exactly once.
    pub fn update_value<R>(
        &mut self,
        cntx: &DbContext,
        pos: Pos,
        key: &[u8],
        f: impl FnOnce(&mut CompactValue) -> R,
    ) -> Option<R> {
        let db = cntx.db_index;
        let (old_type, old_mem) = {
            let v = self.tables[db as usize].prime.value(pos)?;
            (v.obj_type(), v.malloc_used())
        };
        let r = {
            let v = self.tables[db as usize].prime.value_mut(pos)?;
            f(v)
        };
        self.finish_update(db, pos, key, old_type, old_mem);
        Some(r)
    }

    /// Post-mutation bookkeeping for callers that used `value_mut`
    /// directly. `old_type`/`old_mem` describe the value before mutation.
    pub fn post_update(
        &mut self,
        cntx: &DbContext,
        pos: Pos,
        key: &[u8],
        old_type: ObjType,
        old_mem: usize,
    ) {
        self.finish_update(cntx.db_index, pos, key, old_type, old_mem);
    }

    fn finish_update(&mut self, db: DbIndex, pos: Pos, key: &[u8], old_type: ObjType, old_mem: usize) {
        {
            let table = &mut self.tables[db as usize];
            let (new_type, new_mem) = match table.prime.value(pos) {
                Some(v) => (v.obj_type(), v.malloc_used()),
                None => return,
            };
            if new_type != old_type {
                table.stats.per_type_count[old_type.as_index()] -= 1;
                table.stats.per_type_memory[old_type.as_index()] -= old_mem as i64;
                table.stats.per_type_count[new_type.as_index()] += 1;
                table.stats.per_type_memory[new_type.as_index()] += new_mem as i64;
            } else {
                table.stats.per_type_memory[new_type.as_index()] += new_mem as i64 - old_mem as i64;
            }
            table.prime.touch(pos);
        }
        self.fire(db, ChangeEvent::Update { key });
    }

    /// Remove a key, returning its value (the caller releases any tiered
    /// segment it still points at). Fires the `Del` callback.
    pub fn delete(&mut self, cntx: &DbContext, key: &[u8]) -> Option<CompactValue> {
        if self.expire_if_needed(cntx, key) {
            return None;
        }
        self.remove_returning(cntx.db_index, key)
    }

    fn remove_returning(&mut self, db: DbIndex, key: &[u8]) -> Option<CompactValue> {
        let table = &mut self.tables[db as usize];
        let (_, value) = table.prime.remove(key)?;
        table.stats.remove_value(&value);
        if value.is_external() {
            if let Some((_, len)) = value.get_external_slice() {
                table.stats.tiered_entries -= 1;
                table.stats.tiered_used_bytes -= len as i64;
            }
        }
        if table.expire.remove(key).is_some() {
            table.stats.expire_count -= 1;
        }
        self.fire(db, ChangeEvent::Del { key });
        Some(value)
    }

    /// Internal removal path (lazy expiry): the value is parked on the drop
    /// list for the shard executor to dispose of.
    fn remove_entry(&mut self, db: DbIndex, key: &[u8]) {
        if let Some(value) = self.remove_returning(db, key) {
            self.dropped.push((db, value));
        }
    }

    /// Values removed behind the caller's back since the last drain.
    pub fn take_dropped(&mut self) -> Vec<(DbIndex, CompactValue)> {
        std::mem::take(&mut self.dropped)
    }

    pub fn db_count(&self) -> usize {
        self.tables.len()
    }
}
