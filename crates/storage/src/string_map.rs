//! Hash field map with per-field TTL
//!
//! The promoted encoding for hash values: field -> value map over a
//! [`DenseTable`](crate::dense_table::DenseTable), with an optional 32-bit
//! expiry per field. The owner advances the reference clock (coarse
//! seconds) before operating; expired fields are treated as absent by every
//! lookup and garbage collected lazily when probed.

use crate::dense_table::DenseTable;
use rand::Rng;

#[derive(Debug, Clone)]
struct FieldValue {
    value: Box<[u8]>,
    /// Absolute expiry in the owner's clock domain (seconds).
    expire_at: Option<u32>,
}

pub struct StringMap {
    table: DenseTable<FieldValue>,
    clock: u32,
}

impl Default for StringMap {
    fn default() -> Self {
        Self::new()
    }
}

impl StringMap {
    pub fn new() -> Self {
        Self {
            table: DenseTable::new(),
            clock: 0,
        }
    }

    /// Advance the reference clock. Must be called by the owner before a
    /// batch of operations; never moves backwards.
    pub fn set_time(&mut self, now_sec: u32) {
        if now_sec > self.clock {
            self.clock = now_sec;
        }
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    fn is_expired(&self, fv: &FieldValue) -> bool {
        matches!(fv.expire_at, Some(at) if at <= self.clock)
    }

    /// Insert or overwrite a field. `ttl_sec` of None keeps no expiry (and
    /// clears a previous one). Returns true when the field was newly added.
    pub fn add_or_update(&mut self, field: &[u8], value: &[u8], ttl_sec: Option<u32>) -> bool {
        let expired = self.table.get(field).map(|fv| self.is_expired(fv));
        let fv = FieldValue {
            value: value.to_vec().into_boxed_slice(),
            expire_at: ttl_sec.map(|t| self.clock.saturating_add(t.max(1))),
        };
        match self.table.insert(field, fv) {
            None => true,
            // overwriting an expired entry counts as a fresh insert
            Some(_) => expired == Some(true),
        }
    }

    /// Insert only when the field is absent (or expired). Returns true when
    /// the value was stored.
    pub fn add_or_skip(&mut self, field: &[u8], value: &[u8], ttl_sec: Option<u32>) -> bool {
        match self.table.get(field) {
            Some(fv) if !self.is_expired(fv) => false,
            _ => self.add_or_update(field, value, ttl_sec),
        }
    }

    /// Remove a field. Returns whether a live entry existed.
    pub fn erase(&mut self, field: &[u8]) -> bool {
        let live = match self.table.get(field) {
            Some(fv) => !self.is_expired(fv),
            None => return false,
        };
        self.table.remove(field);
        live
    }

    /// Look up a live field, lazily collecting it when expired.
    pub fn find(&mut self, field: &[u8]) -> Option<FoundField<'_>> {
        let expired = match self.table.get(field) {
            None => return None,
            Some(fv) => self.is_expired(fv),
        };
        if expired {
            self.table.remove(field);
            return None;
        }
        let clock = self.clock;
        let fv = self.table.get(field)?;
        Some(FoundField {
            value: &fv.value,
            expire_at: fv.expire_at,
            clock,
        })
    }

    /// Read-only probe without lazy collection.
    pub fn contains(&self, field: &[u8]) -> bool {
        matches!(self.table.get(field), Some(fv) if !self.is_expired(fv))
    }

    /// Set or clear the expiry of an existing live field.
    pub fn set_expiry(&mut self, field: &[u8], ttl_sec: Option<u32>) -> bool {
        if !self.contains(field) {
            return false;
        }
        let clock = self.clock;
        if let Some(fv) = self.table.get_mut(field) {
            fv.expire_at = ttl_sec.map(|t| clock.saturating_add(t.max(1)));
            true
        } else {
            false
        }
    }

    /// Upper bound on the live size: may overcount by entries that expired
    /// but were not yet collected.
    pub fn upper_bound_size(&self) -> usize {
        self.table.len()
    }

    /// Exact live length (linear in the number of entries).
    pub fn live_len(&self) -> usize {
        self.table.iter().filter(|(_, fv)| !self.is_expired(fv)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.live_len() == 0
    }

    /// Iterate live (field, value, expire_at) triples in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8], Option<u32>)> {
        self.table
            .iter()
            .filter(|(_, fv)| !self.is_expired(fv))
            .map(|(k, fv)| (k, &*fv.value, fv.expire_at))
    }

    /// Stateless resumable scan over live entries; expired entries seen
    /// along the way are collected.
    pub fn scan<F: FnMut(&[u8], &[u8])>(&mut self, cursor: u64, mut f: F) -> u64 {
        let clock = self.clock;
        self.table.scan_filter(cursor, |k, fv| {
            if matches!(fv.expire_at, Some(at) if at <= clock) {
                return false;
            }
            f(k, &fv.value);
            true
        })
    }

    /// One random live pair.
    pub fn random_pair<R: Rng>(&self, rng: &mut R) -> Option<(Vec<u8>, Vec<u8>)> {
        // rejection-sample live entries; bail after a few failed probes and
        // fall back to a linear pick
        for _ in 0..8 {
            if let Some((k, fv)) = self.table.random_entry(rng) {
                if !self.is_expired(fv) {
                    return Some((k.to_vec(), fv.value.to_vec()));
                }
            } else {
                return None;
            }
        }
        let live: Vec<_> = self.iter().collect();
        if live.is_empty() {
            return None;
        }
        let (k, v, _) = live[rng.gen_range(0..live.len())];
        Some((k.to_vec(), v.to_vec()))
    }

    /// `k` distinct random live pairs.
    pub fn random_pairs_unique<R: Rng>(&self, k: usize, rng: &mut R) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut live: Vec<(Vec<u8>, Vec<u8>)> = self
            .iter()
            .map(|(f, v, _)| (f.to_vec(), v.to_vec()))
            .collect();
        let k = k.min(live.len());
        for i in 0..k {
            let j = rng.gen_range(i..live.len());
            live.swap(i, j);
        }
        live.truncate(k);
        live
    }

    /// `k` random live pairs, repetition allowed.
    pub fn random_pairs<R: Rng>(&self, k: usize, rng: &mut R) -> Vec<(Vec<u8>, Vec<u8>)> {
        let live: Vec<_> = self.iter().collect();
        if live.is_empty() {
            return Vec::new();
        }
        (0..k)
            .map(|_| {
                let (f, v, _) = live[rng.gen_range(0..live.len())];
                (f.to_vec(), v.to_vec())
            })
            .collect()
    }

    pub fn reserve(&mut self, n: usize) {
        self.table.reserve(n);
    }

    pub fn mem_used(&self) -> usize {
        let values: usize = self.table.iter().map(|(_, fv)| fv.value.len()).sum();
        self.table.mem_used() + values
    }
}

/// A resolved live field.
pub struct FoundField<'a> {
    value: &'a [u8],
    expire_at: Option<u32>,
    clock: u32,
}

impl<'a> FoundField<'a> {
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    pub fn has_expiry(&self) -> bool {
        self.expire_at.is_some()
    }

    /// Remaining TTL in seconds, None when persistent.
    pub fn ttl_sec(&self) -> Option<u32> {
        self.expire_at.map(|at| at.saturating_sub(self.clock))
    }

    /// Absolute expiry time in the owner's clock domain.
    pub fn expiry_time(&self) -> Option<u32> {
        self.expire_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_add_update_skip() {
        let mut sm = StringMap::new();
        assert!(sm.add_or_update(b"f1", b"v1", None));
        assert!(!sm.add_or_update(b"f1", b"v2", None));
        assert_eq!(sm.find(b"f1").unwrap().value(), b"v2");

        assert!(!sm.add_or_skip(b"f1", b"v3", None));
        assert_eq!(sm.find(b"f1").unwrap().value(), b"v2");
        assert!(sm.add_or_skip(b"f2", b"x", None));
        assert_eq!(sm.upper_bound_size(), 2);
    }

    #[test]
    fn test_erase() {
        let mut sm = StringMap::new();
        sm.add_or_update(b"f", b"v", None);
        assert!(sm.erase(b"f"));
        assert!(!sm.erase(b"f"));
        assert!(sm.find(b"f").is_none());
    }

    #[test]
    fn test_field_ttl_expires() {
        let mut sm = StringMap::new();
        sm.set_time(100);
        sm.add_or_update(b"f", b"v", Some(5));
        let found = sm.find(b"f").unwrap();
        assert!(found.has_expiry());
        assert_eq!(found.ttl_sec(), Some(5));

        sm.set_time(104);
        assert!(sm.find(b"f").is_some());
        sm.set_time(105);
        assert!(sm.find(b"f").is_none());
        assert_eq!(sm.upper_bound_size(), 0); // lazily collected by find
        assert!(sm.is_empty());
    }

    #[test]
    fn test_overwrite_expired_counts_as_new() {
        let mut sm = StringMap::new();
        sm.set_time(10);
        sm.add_or_update(b"f", b"v", Some(1));
        sm.set_time(20);
        assert!(sm.add_or_update(b"f", b"w", None));
        assert_eq!(sm.find(b"f").unwrap().value(), b"w");
    }

    #[test]
    fn test_scan_skips_expired() {
        let mut sm = StringMap::new();
        sm.set_time(10);
        for i in 0..20 {
            let ttl = if i % 2 == 0 { Some(1) } else { None };
            sm.add_or_update(format!("f{i}").as_bytes(), b"v", ttl);
        }
        sm.set_time(12);
        let mut seen = Vec::new();
        let mut cursor = 0;
        loop {
            cursor = sm.scan(cursor, |f, _| seen.push(f.to_vec()));
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|f| {
            let n: u32 = std::str::from_utf8(&f[1..]).unwrap().parse().unwrap();
            n % 2 == 1
        }));
        // expired ones were collected during the scan
        assert_eq!(sm.upper_bound_size(), 10);
    }

    #[test]
    fn test_random_sampling_live_only() {
        let mut sm = StringMap::new();
        sm.set_time(10);
        sm.add_or_update(b"dead", b"v", Some(1));
        sm.add_or_update(b"live", b"v", None);
        sm.set_time(20);

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            let (f, _) = sm.random_pair(&mut rng).unwrap();
            assert_eq!(f, b"live".to_vec());
        }
        let uniq = sm.random_pairs_unique(5, &mut rng);
        assert_eq!(uniq.len(), 1);
        let multi = sm.random_pairs(4, &mut rng);
        assert_eq!(multi.len(), 4);
        assert!(multi.iter().all(|(f, _)| f == b"live"));
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut sm = StringMap::new();
        for i in 0..10 {
            sm.add_or_update(format!("f{i}").as_bytes(), b"v", None);
        }
        let fields: Vec<Vec<u8>> = sm.iter().map(|(f, _, _)| f.to_vec()).collect();
        let expected: Vec<Vec<u8>> = (0..10).map(|i| format!("f{i}").into_bytes()).collect();
        assert_eq!(fields, expected);
    }
}
