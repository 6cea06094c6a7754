//! Slot routing
//!
//! Keys are routed to shards through CRC16 slots, consistent with Redis
//! Cluster so external tooling agrees with our placement.

use crc::{Crc, CRC_16_XMODEM};

/// Total number of slots (consistent with Redis Cluster)
pub const TOTAL_SLOTS: u32 = 16384;

/// Shard ID type
pub type ShardId = u32;

/// CRC16 calculator for Redis Cluster (XMODEM variant)
static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculate slot for key using CRC16-CCITT (compatible with Redis Cluster)
pub fn slot_for_key(key: &[u8]) -> u32 {
    CRC16.checksum(hash_tag(key)) as u32 % TOTAL_SLOTS
}

/// Calculate shard ID from key
pub fn shard_for_key(key: &[u8], shard_count: u32) -> ShardId {
    let slot = slot_for_key(key);
    slot / (TOTAL_SLOTS / shard_count)
}

/// Slot range `[start, end)` owned by a shard
pub fn shard_slot_range(shard_id: ShardId, shard_count: u32) -> (u32, u32) {
    let slots_per_shard = TOTAL_SLOTS / shard_count;
    let start = shard_id * slots_per_shard;
    let end = if shard_id == shard_count - 1 {
        TOTAL_SLOTS
    } else {
        (shard_id + 1) * slots_per_shard
    };
    (start, end)
}

// Hash tags: if the key contains a non-empty {...} section, only that
// section participates in slot hashing so related keys can be colocated.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_calculation() {
        assert!(slot_for_key(b"test_key_1") < TOTAL_SLOTS);
        assert!(slot_for_key(b"test_key_2") < TOTAL_SLOTS);
        // deterministic
        assert_eq!(slot_for_key(b"test_key_1"), slot_for_key(b"test_key_1"));
    }

    #[test]
    fn test_crc16_compatibility() {
        // Redis Cluster's published reference value
        assert_eq!(CRC16.checksum(b"123456789"), 0x31C3);
        assert_eq!(CRC16.checksum(&[]), 0);
    }

    #[test]
    fn test_shard_routing() {
        let shard_count = 16;
        let shard_id = shard_for_key(b"test_key", shard_count);
        assert!(shard_id < shard_count);

        let (start, end) = shard_slot_range(shard_id, shard_count);
        let slot = slot_for_key(b"test_key");
        assert!(slot >= start && slot < end);
    }

    #[test]
    fn test_hash_tags_colocate() {
        assert_eq!(slot_for_key(b"{user1}.name"), slot_for_key(b"{user1}.age"));
        // Empty tag falls back to the whole key
        assert!(slot_for_key(b"{}a") < TOTAL_SLOTS);
    }

    #[test]
    fn test_shard_slot_range() {
        let (start, end) = shard_slot_range(0, 4);
        assert_eq!((start, end), (0, 4096));
        let (start, end) = shard_slot_range(3, 4);
        assert_eq!((start, end), (12288, 16384));
    }
}
