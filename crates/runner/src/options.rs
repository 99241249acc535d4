//! Coordinator options and the environment test hook

use std::time::Duration;

use upstream::BackoffPolicy;

/// Concurrent slots when the caller does not say otherwise.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Hard upper bound on concurrent slots. Larger requests are clamped.
pub const MAX_CONCURRENCY_CAP: usize = 10;

/// How long one attempt waits for a credential before the item fails.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// When truthy, the first credential used in a run receives a simulated
/// per-minute rate-limit response instead of running the work function.
pub const SIMULATE_RATE_LIMIT_ENV: &str = "WORKFLOW_SIMULATE_RATE_LIMIT";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_concurrency: usize,
    /// Per-attempt credential wait; `None` waits indefinitely
    pub acquire_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    pub simulate_rate_limit: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            backoff: BackoffPolicy::default(),
            simulate_rate_limit: false,
        }
    }
}

impl RunnerOptions {
    /// Defaults with the simulated rate-limit hook read from the environment.
    pub fn from_env() -> Self {
        Self {
            simulate_rate_limit: std::env::var(SIMULATE_RATE_LIMIT_ENV)
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            ..Self::default()
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

pub(crate) fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
