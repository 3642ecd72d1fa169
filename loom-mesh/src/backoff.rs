//! Reconnection backoff.

use std::time::Duration;

/// Maximum base delay before jitter.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum jitter added to each delay.
pub const MAX_JITTER_MS: u64 = 5000;

/// Delay before reconnection attempt `attempt` (1-based).
///
/// Formula: min(30s, 2^attempt seconds) + random(0..=5000ms)
pub fn backoff_delay(attempt: u32) -> Duration {
    base_delay(attempt) + Duration::from_millis(random_jitter_ms())
}

fn base_delay(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(MAX_BACKOFF.as_secs());
    Duration::from_secs(base_secs)
}

fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes) % (MAX_JITTER_MS + 1)
}
