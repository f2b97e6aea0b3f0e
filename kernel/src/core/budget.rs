//! Time budget helpers for oracle retries and call spacing.

use std::time::{Duration, Instant};

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`.
///
/// With the default 5s base this yields 5s, 10s, 20s.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// How long to wait before dispatching so that consecutive calls are at
/// least `min_interval` apart.
pub fn spacing_wait(last_dispatch: Option<Instant>, now: Instant, min_interval: Duration) -> Duration {
    match last_dispatch {
        Some(last) => (last + min_interval).saturating_duration_since(now),
        None => Duration::ZERO,
    }
}
