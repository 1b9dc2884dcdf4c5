//! Resolve-loop pacing
//!
//! A connected peer is re-checked every `base` interval. After a failed
//! cycle the delay grows exponentially from one second and is capped just
//! under a minute, so long-absent peers cost little while freshly failed
//! ones are retried quickly.

use std::time::Duration;

/// Delay after a successful cycle
pub const BASE_REFRESH: Duration = Duration::from_secs(60);

const FAILURE_FLOOR_MS: u64 = 1_000;
const FAILURE_STEP_MS: u64 = 20;
const MAX_EXPONENT: u32 = 11;
const FAILURE_CAP_MS: u64 = 59_000;

/// Delay before the next resolve cycle
pub fn next_delay(connected: bool, failures: u32, base: Duration) -> Duration {
    if connected {
        return base;
    }
    let backoff = FAILURE_STEP_MS.saturating_mul(1 << failures.min(MAX_EXPONENT));
    Duration::from_millis(FAILURE_FLOOR_MS + backoff.min(FAILURE_CAP_MS))
}
