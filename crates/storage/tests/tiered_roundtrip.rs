//! End-to-end tests of the tiered engine against a real page file:
//! stash/fetch/modify round trips, small-bin batching, defragmentation and
//! write-depth back-pressure.

use ember_core::Config;
use storage::tiered::IoEvent;
use storage::{DbContext, DbSlice, ObjType, TieredStorage};
use std::time::Duration;
use tokio::sync::mpsc;

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        tiered_path: dir.join("pages").to_string_lossy().into_owned(),
        ..Config::default()
    }
}

fn cntx() -> DbContext {
    DbContext {
        db_index: 0,
        time_now_ms: 1_000,
    }
}

fn set_key(slice: &mut DbSlice, key: &[u8], value: &[u8]) {
    let c = cntx();
    let (pos, _) = slice.add_or_find(&c, key);
    slice.update_value(&c, pos, key, |v| v.set_string(value));
}

fn is_external(slice: &DbSlice, key: &[u8]) -> bool {
    slice
        .table(0)
        .prime
        .find(key)
        .and_then(|pos| slice.table(0).prime.value(pos))
        .map(|v| v.is_external())
        .unwrap_or(false)
}

fn in_memory_value(slice: &DbSlice, key: &[u8]) -> Option<Vec<u8>> {
    slice
        .table(0)
        .prime
        .find(key)
        .and_then(|pos| slice.table(0).prime.value(pos))
        .filter(|v| !v.is_external())
        .map(|v| v.get_string())
}

/// Pump I/O completions until the channel goes quiet.
async fn settle(
    tiered: &mut TieredStorage,
    slice: &mut DbSlice,
    rx: &mut mpsc::UnboundedReceiver<IoEvent>,
) {
    loop {
        match tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            Ok(Some(ev)) => tiered.on_io_event(slice, ev),
            _ => break,
        }
    }
}

fn setup(config: &Config) -> (DbSlice, TieredStorage, mpsc::UnboundedReceiver<IoEvent>) {
    let slice = DbSlice::new(0, 1);
    let (io_tx, io_rx) = mpsc::unbounded_channel();
    let tiered = TieredStorage::open(config, 0, io_tx).expect("open tiered file");
    (slice, tiered, io_rx)
}

#[tokio::test]
async fn test_whole_page_stash_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            // non-ascii so the raw image is stored unpacked
            let value: Vec<u8> = (0..6000).map(|i| (i % 251) as u8 | 0x80).collect();
            set_key(&mut slice, b"big", &value);

            assert!(tiered.try_stash(&mut slice, 0, b"big"));
            settle(&mut tiered, &mut slice, &mut io_rx).await;

            assert!(is_external(&slice, b"big"));
            assert_eq!(slice.stats(0).tiered_entries, 1);
            assert_eq!(tiered.stats().total_stashes, 1);

            // fetch resolves to the original bytes
            let pos = slice.table(0).prime.find(b"big").unwrap();
            let rx = {
                let v = slice.table(0).prime.value(pos).unwrap();
                tiered.read(0, b"big", v)
            };
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert_eq!(rx.await.unwrap(), value);

            // caching-on-read brought it back to memory and freed the disk copy
            assert_eq!(in_memory_value(&slice, b"big"), Some(value));
            assert_eq!(slice.stats(0).tiered_entries, 0);
            assert_eq!(tiered.stats().allocated_bytes, 0);
        })
        .await;
}

#[tokio::test]
async fn test_ascii_packed_value_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            let value: Vec<u8> = (0..5000).map(|i| b'a' + (i % 26) as u8).collect();
            set_key(&mut slice, b"packed", &value);

            // the stored raw image is ASCII-packed and smaller than logical
            {
                let pos = slice.table(0).prime.find(b"packed").unwrap();
                let v = slice.table(0).prime.value(pos).unwrap();
                assert!(v.get_raw_bytes().unwrap().len() < value.len());
            }

            assert!(tiered.try_stash(&mut slice, 0, b"packed"));
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert!(is_external(&slice, b"packed"));

            let pos = slice.table(0).prime.find(b"packed").unwrap();
            let rx = {
                let v = slice.table(0).prime.value(pos).unwrap();
                tiered.read(0, b"packed", v)
            };
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert_eq!(rx.await.unwrap(), value);
        })
        .await;
}

#[tokio::test]
async fn test_modify_reuploads_and_frees_segment() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            let value: Vec<u8> = vec![0x90; 5000];
            set_key(&mut slice, b"k", &value);
            assert!(tiered.try_stash(&mut slice, 0, b"k"));
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert!(is_external(&slice, b"k"));

            let pos = slice.table(0).prime.find(b"k").unwrap();
            let rx = {
                let v = slice.table(0).prime.value(pos).unwrap();
                tiered.modify(0, b"k", v, |buf| {
                    buf.truncate(10);
                    buf.extend_from_slice(b"-tail");
                    buf.len()
                })
            };
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert_eq!(rx.await.unwrap(), 15);

            let mut expect = vec![0x90u8; 10];
            expect.extend_from_slice(b"-tail");
            assert_eq!(in_memory_value(&slice, b"k"), Some(expect));
            assert_eq!(slice.stats(0).tiered_entries, 0);
            assert_eq!(tiered.stats().allocated_bytes, 0);
        })
        .await;
}

#[tokio::test]
async fn test_small_bins_batch_and_defragment() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            // four 1000-byte values fill a bin; the fifth triggers the flush
            for i in 0..5 {
                let key = format!("small-{i}");
                let value = vec![0x80u8 + i as u8; 1000];
                set_key(&mut slice, key.as_bytes(), &value);
                assert!(tiered.try_stash(&mut slice, 0, key.as_bytes()));
            }
            settle(&mut tiered, &mut slice, &mut io_rx).await;

            let externals = (0..5)
                .filter(|i| is_external(&slice, format!("small-{i}").as_bytes()))
                .count();
            assert_eq!(externals, 4);
            assert_eq!(tiered.stats().small_bins_cnt, 1);
            assert_eq!(tiered.stats().small_bins_entries_cnt, 4);

            // read one back
            let pos = slice.table(0).prime.find(b"small-1").unwrap();
            let rx = {
                let v = slice.table(0).prime.value(pos).unwrap();
                tiered.read(0, b"small-1", v)
            };
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert_eq!(rx.await.unwrap(), vec![0x81u8; 1000]);

            // dropping most sub-entries fragments the bin; defragmentation
            // reloads the survivors and frees the page
            for key in [b"small-0".as_slice(), b"small-2"] {
                let c = cntx();
                let v = slice.delete(&c, key).unwrap();
                tiered.free_external(&v);
            }
            settle(&mut tiered, &mut slice, &mut io_rx).await;

            assert_eq!(tiered.stats().small_bins_cnt, 0);
            assert!(in_memory_value(&slice, b"small-3").is_some());
            assert_eq!(slice.stats(0).tiered_entries, 0);
        })
        .await;
}

#[tokio::test]
async fn test_write_depth_backpressure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.tiered_storage_write_depth = 2;
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            for i in 0..3 {
                let key = format!("wd-{i}");
                set_key(&mut slice, key.as_bytes(), &vec![0x85u8; 5000]);
            }
            assert!(tiered.try_stash(&mut slice, 0, b"wd-0"));
            assert!(tiered.try_stash(&mut slice, 0, b"wd-1"));
            // third exceeds the depth: refused, value untouched in memory
            assert!(!tiered.try_stash(&mut slice, 0, b"wd-2"));
            assert_eq!(tiered.stats().pending_stash_cnt, 2);
            assert_eq!(tiered.stats().total_stash_overflows, 1);
            assert_eq!(in_memory_value(&slice, b"wd-2"), Some(vec![0x85u8; 5000]));

            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert_eq!(tiered.stats().pending_stash_cnt, 0);
            // room again
            assert!(tiered.try_stash(&mut slice, 0, b"wd-2"));
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert!(is_external(&slice, b"wd-2"));
        })
        .await;
}

#[tokio::test]
async fn test_cancel_stash_keeps_value() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            let value = vec![0x84u8; 5000];
            set_key(&mut slice, b"c", &value);
            assert!(tiered.try_stash(&mut slice, 0, b"c"));

            // overwrite decided before the write completed
            {
                let pos = slice.table(0).prime.find(b"c").unwrap();
                let table = slice.table_mut(0);
                let v = table.prime.value_mut(pos).unwrap();
                assert!(v.has_io_pending());
                tiered.cancel_stash(0, b"c", v);
                assert!(!v.has_io_pending());
            }
            settle(&mut tiered, &mut slice, &mut io_rx).await;

            assert!(!is_external(&slice, b"c"));
            assert_eq!(in_memory_value(&slice, b"c"), Some(value));
            assert_eq!(tiered.stats().total_cancels, 1);
            // the orphaned segment was returned to the allocator
            assert_eq!(tiered.stats().allocated_bytes, 0);
        })
        .await;
}

#[tokio::test]
async fn test_run_offloading_sweeps_cold_entries() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            for i in 0..8 {
                let key = format!("cold-{i}");
                set_key(&mut slice, key.as_bytes(), &vec![0x90u8; 5000]);
            }
            // values start touched (written); the first sweep clears the
            // touch marker, the second stashes
            tiered.run_offloading(&mut slice, 0);
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert_eq!(tiered.stats().total_stashes, 0);

            tiered.run_offloading(&mut slice, 0);
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            let externals = (0..8)
                .filter(|i| is_external(&slice, format!("cold-{i}").as_bytes()))
                .count();
            assert_eq!(externals, 8);

            // values below the size threshold are never picked up
            set_key(&mut slice, b"tiny", b"short");
            tiered.run_offloading(&mut slice, 0);
            tiered.run_offloading(&mut slice, 0);
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert!(!is_external(&slice, b"tiny"));
        })
        .await;
}

#[test]
fn test_values_keep_type_after_external() {
    // external descriptors still report as strings
    let mut v = storage::CompactValue::of(&[0x80u8; 100]);
    v.set_io_pending(true);
    v.set_external(0, 100);
    assert_eq!(v.obj_type(), ObjType::String);
    assert_eq!(v.size(), 100);
}

#[tokio::test]
async fn test_free_external_refuses_ref_views() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut slice, mut tiered, mut io_rx) = setup(&config);
            set_key(&mut slice, b"k", &vec![0x91u8; 5000]);
            assert!(tiered.try_stash(&mut slice, 0, b"k"));
            settle(&mut tiered, &mut slice, &mut io_rx).await;
            assert!(is_external(&slice, b"k"));

            // a view carries the descriptor but must not release the segment
            let view = {
                let pos = slice.table(0).prime.find(b"k").unwrap();
                slice.table(0).prime.value(pos).unwrap().as_ref()
            };
            let before = tiered.stats().allocated_bytes;
            tiered.free_external(&view);
            assert_eq!(tiered.stats().allocated_bytes, before);
            assert_eq!(tiered.stats().total_deletes, 0);

            // the owner still frees it
            let c = cntx();
            let owned = slice.delete(&c, b"k").unwrap();
            tiered.free_external(&owned);
            assert_eq!(tiered.stats().allocated_bytes, 0);
            assert_eq!(tiered.stats().total_deletes, 1);
        })
        .await;
}
