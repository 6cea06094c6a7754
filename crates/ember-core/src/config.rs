//! Engine configuration
//!
//! All options are resolved once at startup and injected as an immutable
//! `Arc<Config>` into every shard executor. Nothing here changes at runtime.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of shard executors.
    pub shard_count: u32,

    /// Number of logical databases per shard.
    pub db_count: u16,

    /// Upper bound on a single hash field or value byte length before the
    /// hash is promoted out of its packed encoding.
    pub max_map_field_len: usize,

    /// Upper bound on packed hash byte size before promotion.
    pub max_listpack_map_bytes: usize,

    /// Upper bound on sorted-set packed entries before promotion.
    pub zset_max_listpack_entries: usize,

    /// Smallest string value eligible for tiered offloading.
    pub tiered_min_value_size: usize,

    /// Load results of offloaded reads back into memory.
    pub tiered_storage_cache_fetched: bool,

    /// Maximum number of concurrent stash requests per shard.
    pub tiered_storage_write_depth: usize,

    /// Capacity of the per-shard tiered page file.
    pub tiered_max_file_size: u64,

    /// Base path of the tiered page file; the shard index is appended.
    pub tiered_path: String,

    /// A stashed bin counts as fragmented when live/used bytes drop below
    /// this ratio.
    pub tiered_defrag_ratio: f32,

    /// Byte ceiling for in-flight replication bytes before throttling.
    pub replication_stream_output_limit: usize,

    /// Milliseconds to wait for the replication buffer to drain below the
    /// throttle limit.
    pub replication_stream_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shard_count: 4,
            db_count: 16,
            max_map_field_len: 64,
            max_listpack_map_bytes: 1024,
            zset_max_listpack_entries: 128,
            tiered_min_value_size: 64,
            tiered_storage_cache_fetched: true,
            tiered_storage_write_depth: 50,
            tiered_max_file_size: 1 << 30,
            tiered_path: String::new(),
            tiered_defrag_ratio: 0.5,
            replication_stream_output_limit: 64 << 10,
            replication_stream_timeout_ms: 500,
        }
    }
}

impl Config {
    /// Tiered storage is enabled when a page-file path was configured.
    pub fn tiered_enabled(&self) -> bool {
        !self.tiered_path.is_empty()
    }
}
