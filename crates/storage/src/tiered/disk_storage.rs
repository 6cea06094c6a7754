//! Page-aligned disk storage
//!
//! One append-allocated file per shard. Allocation is page-granular with a
//! first-fit free list of returned page runs; reads and writes run on the
//! blocking pool so the shard executor never stalls on disk I/O.

use super::{DiskSegment, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
    /// Bytes currently allocated (page granular).
    pub allocated_bytes: u64,
    /// High watermark of the file.
    pub capacity_bytes: u64,
    /// Configured ceiling.
    pub max_file_size: u64,
}

pub struct DiskStorage {
    file: Arc<File>,
    /// End of the grown region; allocations past every free run extend it.
    watermark: u64,
    /// Free page runs (offset page-aligned, length a page multiple).
    free: Vec<DiskSegment>,
    allocated: u64,
    max_file_size: u64,
}

fn page_span(len: usize) -> u64 {
    (((len + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE) as u64
}

impl DiskStorage {
    pub fn open(path: &Path, max_file_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
            watermark: 0,
            free: Vec::new(),
            allocated: 0,
            max_file_size,
        })
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            allocated_bytes: self.allocated,
            capacity_bytes: self.watermark,
            max_file_size: self.max_file_size,
        }
    }

    /// Allocate a page run able to hold `len` bytes. Returns a segment with
    /// the logical length; None when the file would exceed its ceiling.
    pub fn allocate(&mut self, len: usize) -> Option<DiskSegment> {
        let need = page_span(len);
        // first fit from returned runs
        for i in 0..self.free.len() {
            if (self.free[i].length as u64) >= need {
                let run = self.free.swap_remove(i);
                if run.length as u64 > need {
                    self.free.push(DiskSegment {
                        offset: run.offset + need,
                        length: run.length - need as usize,
                    });
                }
                self.allocated += need;
                return Some(DiskSegment {
                    offset: run.offset,
                    length: len,
                });
            }
        }
        if self.watermark + need > self.max_file_size {
            return None;
        }
        let offset = self.watermark;
        self.watermark += need;
        self.allocated += need;
        Some(DiskSegment { offset, length: len })
    }

    /// Return the page run backing `segment` to the allocator.
    pub fn mark_free(&mut self, segment: DiskSegment) {
        let span = page_span(segment.length);
        self.allocated = self.allocated.saturating_sub(span);
        self.free.push(DiskSegment {
            offset: segment.offset - (segment.offset % PAGE_SIZE as u64),
            length: span as usize,
        });
    }

    /// Read the exact byte range of a segment.
    pub fn read(&self, segment: DiskSegment) -> impl Future<Output = io::Result<Vec<u8>>> + 'static {
        let file = Arc::clone(&self.file);
        async move {
            tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; segment.length];
                file.read_exact_at(&mut buf, segment.offset)?;
                Ok(buf)
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        }
    }

    /// Write `data` at `offset`, padded to a page multiple.
    pub fn write(&self, offset: u64, mut data: Vec<u8>) -> impl Future<Output = io::Result<()>> + 'static {
        let file = Arc::clone(&self.file);
        async move {
            tokio::task::spawn_blocking(move || {
                let span = page_span(data.len()) as usize;
                data.resize(span, 0);
                file.write_all_at(&data, offset)?;
                Ok(())
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_span() {
        assert_eq!(page_span(1), PAGE_SIZE as u64);
        assert_eq!(page_span(PAGE_SIZE), PAGE_SIZE as u64);
        assert_eq!(page_span(PAGE_SIZE + 1), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_allocate_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = DiskStorage::open(&dir.path().join("pages0"), 1 << 20).unwrap();

        let a = ds.allocate(100).unwrap();
        let b = ds.allocate(5000).unwrap();
        assert_eq!(a.offset % PAGE_SIZE as u64, 0);
        assert_eq!(b.offset % PAGE_SIZE as u64, 0);
        assert_ne!(a.offset, b.offset);
        assert_eq!(ds.stats().allocated_bytes, 3 * PAGE_SIZE as u64);

        ds.mark_free(a);
        let c = ds.allocate(200).unwrap();
        assert_eq!(c.offset, a.offset); // reused the freed page

        // ceiling respected
        let mut ds2 = DiskStorage::open(&dir.path().join("pages1"), PAGE_SIZE as u64).unwrap();
        assert!(ds2.allocate(100).is_some());
        assert!(ds2.allocate(100).is_none());
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = DiskStorage::open(&dir.path().join("pages"), 1 << 20).unwrap();
        let seg = ds.allocate(11).unwrap();
        ds.write(seg.offset, b"hello pages".to_vec()).await.unwrap();
        let back = ds.read(seg).await.unwrap();
        assert_eq!(back, b"hello pages".to_vec());
    }
}
