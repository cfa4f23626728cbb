//! Retry backoff helpers
//!
//! Both the download supervisor and the upload pipeline retry transient
//! failures with exponential backoff plus uniform jitter. The delay before
//! attempt `k` (counting from zero, no delay before the first attempt) is
//!
//! ```text
//! base * 2^k + U[0, base)
//! ```
//!
//! The jitter term spreads simultaneous retries out to avoid a thundering
//! herd against the upstream service.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single backoff delay, regardless of attempt count.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Compute the jittered backoff delay before attempt `attempt`.
///
/// Attempt 0 is the first try and has no delay. The exponential component is
/// capped at [`MAX_DELAY`] so a large attempt counter cannot overflow into a
/// multi-hour sleep.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = attempt.min(16);
    let scaled = base.saturating_mul(1u32 << exponent).min(MAX_DELAY);

    let jitter = if base.is_zero() {
        Duration::ZERO
    } else {
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(0.0..base.as_secs_f64()))
    };

    scaled.saturating_add(jitter)
}

/// Sleep for `delay`, returning early (with `false`) if the token is
/// canceled first. Returns `true` when the full delay elapsed.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
