//! Timestamps and time-ordered identifiers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for disambiguating identifiers generated in the same microsecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Generate a 16-byte identifier that sorts by creation time.
///
/// Layout: big-endian timestamp (8 bytes), process-wide counter (4 bytes),
/// process id (4 bytes).
pub fn generate_id() -> [u8; 16] {
    let ts = current_timestamp();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u32;
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..12].copy_from_slice(&counter.to_be_bytes());
    id[12..16].copy_from_slice(&std::process::id().to_be_bytes());
    id
}

/// Generate an identifier rendered as lowercase hex.
pub fn generate_hex_id() -> String {
    hex::encode(generate_id())
}
