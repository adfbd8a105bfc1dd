use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as unix seconds.
pub fn unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current wall clock as unix seconds, truncated to the u32 range used by
/// entry expiry stamps.
pub fn unix32() -> u32 {
    unix() as u32
}
