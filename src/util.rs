use std::sync::OnceLock;

use rand::RngCore;

/// Mints a fresh 128-bit cryptographically random lock value, hex-encoded.
pub fn random_lock_value() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

static PROCESS_EPOCH: OnceLock<tokio::time::Instant> = OnceLock::new();

/// A fixed point in time, set on first use, that `Lock::expiration` and `now_ms` are
/// both expressed relative to. Using one process-wide epoch (rather than one per
/// `LockManager`) keeps expirations comparable across independently-constructed
/// managers in the same process, which the test suite relies on.
fn process_epoch() -> tokio::time::Instant {
    *PROCESS_EPOCH.get_or_init(tokio::time::Instant::now)
}

/// Current monotonic time in milliseconds since the process epoch.
pub fn now_ms() -> i64 {
    process_epoch().elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_lock_value_is_32_hex_chars() {
        let value = random_lock_value();
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_lock_value_is_not_constant() {
        assert_ne!(random_lock_value(), random_lock_value());
    }
}
