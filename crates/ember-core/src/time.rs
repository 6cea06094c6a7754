//! Clock helpers
//!
//! Expiry timestamps are monotonic-ish wall clock milliseconds; the field
//! TTL clock inside hash maps is coarser (seconds) and owner-advanced.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall clock in seconds since the epoch.
pub fn now_sec() -> u64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_advances() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert_eq!(now_sec(), now_ms() / 1000);
    }
}
