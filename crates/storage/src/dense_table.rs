//! Dense bucket table
//!
//! The shared open-addressed backbone behind the hash field map, the sorted
//! set member index and the expire table: a power-of-two bucket array of
//! short slot-index chains over an append-friendly slot arena. Iteration in
//! slot order approximates insertion order; resumable scans walk buckets
//! with a reverse-bit cursor so every surviving entry is observed at least
//! once per full cursor cycle even across rehashes.

use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Hash of a raw key, shared by every keyed structure in this crate so
/// lookups by byte slice and by stored cell agree.
pub fn hash_bytes(key: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(key);
    h.finish()
}

const MIN_BUCKETS: usize = 8;
const CHAIN_TARGET: usize = 3;

struct Entry<V> {
    key: Box<[u8]>,
    hash: u64,
    val: V,
}

pub struct DenseTable<V> {
    buckets: Vec<Vec<u32>>,
    slots: Vec<Option<Entry<V>>>,
    free: Vec<u32>,
    len: usize,
}

impl<V> Default for DenseTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DenseTable<V> {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reserve(&mut self, additional: usize) {
        let want = self.len + additional;
        let mut target = self.buckets.len().max(MIN_BUCKETS);
        while target * CHAIN_TARGET < want {
            target *= 2;
        }
        if target > self.buckets.len() {
            self.rehash(target);
        }
        self.slots.reserve(additional);
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn rehash(&mut self, new_buckets: usize) {
        self.buckets = (0..new_buckets).map(|_| Vec::new()).collect();
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(e) = slot {
                let b = (e.hash as usize) & (new_buckets - 1);
                self.buckets[b].push(idx as u32);
            }
        }
    }

    fn grow_if_needed(&mut self) {
        if self.buckets.is_empty() {
            self.rehash(MIN_BUCKETS);
        } else if self.len + 1 > self.buckets.len() * CHAIN_TARGET {
            let target = self.buckets.len() * 2;
            self.rehash(target);
        }
    }

    fn find_slot(&self, key: &[u8]) -> Option<u32> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = hash_bytes(key);
        let b = self.bucket_of(hash);
        for &idx in &self.buckets[b] {
            if let Some(e) = &self.slots[idx as usize] {
                if e.hash == hash && &*e.key == key {
                    return Some(idx);
                }
            }
        }
        None
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let idx = self.find_slot(key)?;
        self.slots[idx as usize].as_ref().map(|e| &e.val)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let idx = self.find_slot(key)?;
        self.slots[idx as usize].as_mut().map(|e| &mut e.val)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find_slot(key).is_some()
    }

    /// Insert or overwrite. Returns the previous value when present.
    pub fn insert(&mut self, key: &[u8], val: V) -> Option<V> {
        if let Some(idx) = self.find_slot(key) {
            if let Some(e) = self.slots[idx as usize].as_mut() {
                return Some(std::mem::replace(&mut e.val, val));
            }
        }
        self.grow_if_needed();
        let hash = hash_bytes(key);
        let entry = Entry {
            key: key.to_vec().into_boxed_slice(),
            hash,
            val,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(entry);
                i
            }
            None => {
                self.slots.push(Some(entry));
                (self.slots.len() - 1) as u32
            }
        };
        let b = self.bucket_of(hash);
        self.buckets[b].push(idx);
        self.len += 1;
        None
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let idx = self.find_slot(key)?;
        self.remove_slot(idx)
    }

    fn remove_slot(&mut self, idx: u32) -> Option<V> {
        let entry = self.slots[idx as usize].take()?;
        let b = self.bucket_of(entry.hash);
        self.buckets[b].retain(|&i| i != idx);
        self.free.push(idx);
        self.len -= 1;
        Some(entry.val)
    }

    /// Iterate live entries in slot (≈ insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|e| (&*e.key, &e.val)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&[u8], &mut V)> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut().map(|e| (&*e.key, &mut e.val)))
    }

    /// Stateless resumable scan. Visits one bucket per call and returns the
    /// next cursor, 0 when the cycle completed. Entries present for the
    /// whole cycle are visited at least once; entries may be seen a small
    /// constant number of times when the table grows mid-cycle.
    pub fn scan<F: FnMut(&[u8], &V)>(&self, cursor: u64, mut f: F) -> u64 {
        if self.len == 0 || self.buckets.is_empty() {
            return 0;
        }
        let mask = (self.buckets.len() - 1) as u64;
        let mut v = cursor;
        for &idx in &self.buckets[(v & mask) as usize] {
            if let Some(e) = &self.slots[idx as usize] {
                f(&e.key, &e.val);
            }
        }
        v |= !mask;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v = v.reverse_bits();
        v
    }

    /// Like `scan`, but the callback decides survival: entries for which it
    /// returns false are removed after the bucket visit.
    pub fn scan_filter<F: FnMut(&[u8], &V) -> bool>(&mut self, cursor: u64, mut f: F) -> u64 {
        if self.len == 0 || self.buckets.is_empty() {
            return 0;
        }
        let mask = (self.buckets.len() - 1) as u64;
        let mut v = cursor;
        let bucket = (v & mask) as usize;
        let mut dead: Vec<u32> = Vec::new();
        for &idx in &self.buckets[bucket] {
            if let Some(e) = &self.slots[idx as usize] {
                if !f(&e.key, &e.val) {
                    dead.push(idx);
                }
            }
        }
        for idx in dead {
            self.remove_slot(idx);
        }
        v |= !mask;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v = v.reverse_bits();
        v
    }

    /// One random live entry.
    pub fn random_entry<R: Rng>(&self, rng: &mut R) -> Option<(&[u8], &V)> {
        if self.len == 0 {
            return None;
        }
        let n = self.slots.len();
        let start = rng.gen_range(0..n);
        for i in 0..n {
            if let Some(e) = &self.slots[(start + i) % n] {
                return Some((&e.key, &e.val));
            }
        }
        None
    }

    /// Indices of live slots, for unique sampling.
    pub fn live_slots(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }

    pub fn slot_entry(&self, idx: u32) -> Option<(&[u8], &V)> {
        self.slots
            .get(idx as usize)
            .and_then(|s| s.as_ref())
            .map(|e| (&*e.key, &e.val))
    }

    /// Approximate heap usage of keys and table structure; callers add the
    /// bytes owned by their values.
    pub fn mem_used(&self) -> usize {
        let keys: usize = self.iter().map(|(k, _)| k.len()).sum();
        keys + self.slots.capacity() * std::mem::size_of::<Option<Entry<V>>>()
            + self.buckets.iter().map(|b| b.capacity() * 4).sum::<usize>()
    }
}
