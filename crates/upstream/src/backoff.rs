//! Exponential backoff with jitter
//!
//! `delay = min(cap, base * 2^(attempt - 1))`, then scaled by up to ±20% so
//! that workers failing together do not retry together, and clamped to the
//! cap again after jitter.

use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maximum relative jitter applied to a computed delay.
pub const JITTER_RATIO: f64 = 0.2;

/// Retry parameters shared by every item in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts per item, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Fixed wait applied to a per-minute rate-limited credential
    pub rate_limit_wait: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Jittered delay to wait after failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        compute_delay(attempt, self.base, self.cap)
    }
}

/// Jittered exponential delay for 1-based `attempt`. Attempt 0 is treated as 1.
pub fn compute_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let jitter = rand::rng().random_range(-1.0..=1.0);
    compute_delay_with_jitter(attempt, base, cap, jitter)
}

/// Deterministic core of [`compute_delay`].
///
/// `jitter` is clamped to `[-1, 1]` and scaled by [`JITTER_RATIO`].
pub fn compute_delay_with_jitter(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let cap_secs = cap.as_secs_f64();
    let exponent = attempt.max(1).saturating_sub(1).min(63) as i32;
    let nominal = (base.as_secs_f64() * 2f64.powi(exponent)).min(cap_secs);
    let factor = 1.0 + JITTER_RATIO * jitter.clamp(-1.0, 1.0);
    let jittered = (nominal * factor).clamp(0.0, cap_secs);
    Duration::from_secs_f64(jittered)
}

/// Sleep for `delay` unless `shutdown` fires first.
///
/// Returns `true` if the full delay elapsed, `false` if cancelled.
pub async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    if shutdown.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        () = shutdown.cancelled() => {
            debug!(delay_ms = delay.as_millis() as u64, "backoff sleep cancelled");
            false
        }
        () = tokio::time::sleep(delay) => true,
    }
}
