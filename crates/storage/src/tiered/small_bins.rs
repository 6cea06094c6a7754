//! Small-value bins
//!
//! Values below the whole-page threshold are batched into a shared bin
//! page: a small header records each sub-entry's offset and length, the raw
//! encoded values follow concatenated, and the page is padded to the page
//! size. The filling bin accumulates entries until the next value no
//! longer fits, at which point it is serialized and handed to the stash
//! pipeline. Stashed bins track per-entry liveness so deletions can detect
//! empty pages (freed) and fragmented pages (defragmented in the
//! background).

use super::{DiskSegment, PAGE_SIZE};
use ember_core::DbIndex;
use std::collections::HashMap;

pub type BinId = u64;

/// Per-entry header bytes (u16 offset + u16 length).
const ENTRY_OVERHEAD: usize = 4;
/// Page header bytes (u16 entry count).
const PAGE_HEADER: usize = 2;

/// Largest value the bins accept; anything bigger occupies whole pages.
pub const MAX_SMALL_VALUE: usize = PAGE_SIZE - PAGE_HEADER - ENTRY_OVERHEAD;

struct FillingEntry {
    dbid: DbIndex,
    key: Vec<u8>,
    value: Vec<u8>,
}

struct PendingEntry {
    dbid: DbIndex,
    key: Vec<u8>,
    offset_in_page: u16,
    len: u16,
    cancelled: bool,
}

struct StashedEntry {
    dbid: DbIndex,
    key: Vec<u8>,
    segment: DiskSegment,
    live: bool,
}

struct StashedBin {
    entries: Vec<StashedEntry>,
    defrag_enqueued: bool,
}

/// Outcome of deleting a sub-entry from a stashed bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinDelete {
    pub empty: bool,
    pub fragmented: bool,
    /// The whole bin page.
    pub segment: DiskSegment,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinStats {
    pub stashed_bins_cnt: usize,
    pub stashed_entries_cnt: usize,
    pub current_bin_bytes: usize,
}

pub struct SmallBins {
    filling: Vec<FillingEntry>,
    filling_bytes: usize,
    next_bin_id: BinId,
    pending: HashMap<BinId, Vec<PendingEntry>>,
    stashed: HashMap<u64, StashedBin>,
    defrag_ratio: f32,
}

impl SmallBins {
    pub fn new(defrag_ratio: f32) -> Self {
        Self {
            filling: Vec::new(),
            filling_bytes: 0,
            next_bin_id: 1,
            pending: HashMap::new(),
            stashed: HashMap::new(),
            defrag_ratio,
        }
    }

    fn fits(&self, value_len: usize) -> bool {
        PAGE_HEADER + self.filling_bytes + value_len + ENTRY_OVERHEAD <= PAGE_SIZE
    }

    /// Add a small value to the filling bin. When it does not fit, the
    /// filling bin is serialized first and returned for stashing.
    pub fn stash(
        &mut self,
        dbid: DbIndex,
        key: &[u8],
        value: &[u8],
    ) -> Option<(BinId, Vec<u8>)> {
        debug_assert!(value.len() <= MAX_SMALL_VALUE);
        let flushed = if !self.fits(value.len()) {
            self.flush_filling()
        } else {
            None
        };
        self.filling.push(FillingEntry {
            dbid,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.filling_bytes += value.len() + ENTRY_OVERHEAD;
        flushed
    }

    /// Force-serialize the filling bin (used when offloading wants to push
    /// out stragglers).
    pub fn force_flush(&mut self) -> Option<(BinId, Vec<u8>)> {
        self.flush_filling()
    }

    fn flush_filling(&mut self) -> Option<(BinId, Vec<u8>)> {
        if self.filling.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.filling);
        self.filling_bytes = 0;

        let mut page = vec![0u8; PAGE_SIZE];
        let n = entries.len();
        page[0..2].copy_from_slice(&(n as u16).to_le_bytes());
        let mut data_off = PAGE_HEADER + n * ENTRY_OVERHEAD;
        let mut meta = Vec::with_capacity(n);
        for (i, e) in entries.into_iter().enumerate() {
            let hdr = PAGE_HEADER + i * ENTRY_OVERHEAD;
            page[hdr..hdr + 2].copy_from_slice(&(data_off as u16).to_le_bytes());
            page[hdr + 2..hdr + 4].copy_from_slice(&(e.value.len() as u16).to_le_bytes());
            page[data_off..data_off + e.value.len()].copy_from_slice(&e.value);
            meta.push(PendingEntry {
                dbid: e.dbid,
                key: e.key,
                offset_in_page: data_off as u16,
                len: e.value.len() as u16,
                cancelled: false,
            });
            data_off += e.value.len();
        }

        let id = self.next_bin_id;
        self.next_bin_id += 1;
        self.pending.insert(id, meta);
        Some((id, page))
    }

    /// Whether a key sits in the filling bin or an in-flight bin.
    pub fn is_pending(&self, dbid: DbIndex, key: &[u8]) -> bool {
        if self
            .filling
            .iter()
            .any(|e| e.dbid == dbid && e.key.as_slice() == key)
        {
            return true;
        }
        self.pending.values().any(|v| {
            v.iter()
                .any(|e| !e.cancelled && e.dbid == dbid && e.key.as_slice() == key)
        })
    }

    /// A bin page landed on disk: record it and return the live sub-entries
    /// with their absolute segments.
    pub fn report_stashed(
        &mut self,
        id: BinId,
        page_offset: u64,
    ) -> Vec<(DbIndex, Vec<u8>, DiskSegment)> {
        let Some(metas) = self.pending.remove(&id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut entries = Vec::with_capacity(metas.len());
        for m in metas {
            let segment = DiskSegment {
                offset: page_offset + m.offset_in_page as u64,
                length: m.len as usize,
            };
            if !m.cancelled {
                out.push((m.dbid, m.key.clone(), segment));
            }
            entries.push(StashedEntry {
                dbid: m.dbid,
                key: m.key,
                segment,
                live: !m.cancelled,
            });
        }
        self.stashed.insert(
            page_offset,
            StashedBin {
                entries,
                defrag_enqueued: false,
            },
        );
        out
    }

    /// A bin stash failed: forget it and return the keys whose io-pending
    /// flags must be cleared.
    pub fn report_stash_aborted(&mut self, id: BinId) -> Vec<(DbIndex, Vec<u8>)> {
        self.pending
            .remove(&id)
            .map(|metas| {
                metas
                    .into_iter()
                    .filter(|m| !m.cancelled)
                    .map(|m| (m.dbid, m.key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cancel a not-yet-stashed entry (filling or in-flight bin). Returns
    /// whether the key was found.
    pub fn cancel(&mut self, dbid: DbIndex, key: &[u8]) -> bool {
        if let Some(i) = self
            .filling
            .iter()
            .position(|e| e.dbid == dbid && e.key.as_slice() == key)
        {
            let e = self.filling.remove(i);
            self.filling_bytes -= e.value.len() + ENTRY_OVERHEAD;
            return true;
        }
        for metas in self.pending.values_mut() {
            for m in metas.iter_mut() {
                if !m.cancelled && m.dbid == dbid && m.key.as_slice() == key {
                    m.cancelled = true;
                    return true;
                }
            }
        }
        false
    }

    /// Delete a stashed sub-entry. Reports whether the page is now empty or
    /// fragmented (live/used ratio below the threshold; reported once).
    pub fn delete(&mut self, segment: DiskSegment) -> Option<BinDelete> {
        let page_offset = segment.offset - segment.offset % PAGE_SIZE as u64;
        let bin = self.stashed.get_mut(&page_offset)?;
        let mut used = 0usize;
        let mut live = 0usize;
        let mut found = false;
        for e in bin.entries.iter_mut() {
            if e.live && e.segment == segment {
                e.live = false;
                found = true;
            }
            used += e.segment.length;
            if e.live {
                live += e.segment.length;
            }
        }
        if !found {
            return None;
        }
        let page_segment = DiskSegment {
            offset: page_offset,
            length: PAGE_SIZE,
        };
        if live == 0 {
            self.stashed.remove(&page_offset);
            return Some(BinDelete {
                empty: true,
                fragmented: false,
                segment: page_segment,
            });
        }
        let ratio = live as f32 / used as f32;
        if ratio < self.defrag_ratio && !bin.defrag_enqueued {
            bin.defrag_enqueued = true;
            return Some(BinDelete {
                empty: false,
                fragmented: true,
                segment: page_segment,
            });
        }
        Some(BinDelete {
            empty: false,
            fragmented: false,
            segment: page_segment,
        })
    }

    /// Tear down a stashed bin for defragmentation; returns its live
    /// sub-entries.
    pub fn delete_bin(&mut self, page_segment: DiskSegment) -> Vec<(DbIndex, Vec<u8>, DiskSegment)> {
        self.stashed
            .remove(&page_segment.offset)
            .map(|bin| {
                bin.entries
                    .into_iter()
                    .filter(|e| e.live)
                    .map(|e| (e.dbid, e.key, e.segment))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BinStats {
        BinStats {
            stashed_bins_cnt: self.stashed.len(),
            stashed_entries_cnt: self
                .stashed
                .values()
                .map(|b| b.entries.iter().filter(|e| e.live).count())
                .sum(),
            current_bin_bytes: self.filling_bytes,
        }
    }
}
