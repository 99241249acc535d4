//! Upstream error classification and retry backoff
//!
//! Workers talk to rate-limited upstream services through pooled credentials.
//! When a call fails, the runner needs to know whether to back off and retry,
//! wait out a fixed rate-limit window, drop the credential, or give up. This
//! crate answers that question from the raw error text and HTTP status, and
//! computes the jittered exponential delays used between attempts.
//!
//! Nothing here holds state: classification and delay computation are pure,
//! and the only blocking helper is a cancellable sleep.

pub mod backoff;
pub mod classify;

pub use backoff::{BackoffPolicy, compute_delay, compute_delay_with_jitter, sleep_or_cancel};
pub use classify::classify;

use serde::Serialize;

/// Category of an upstream failure.
///
/// Variants are listed in detection priority order. Error texts frequently
/// contain several markers at once (an overload message that also says
/// "rate limit"), so the classifier checks categories in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Server-side capacity exhaustion; transient, retry with exponential backoff
    CapacityExhausted,
    /// Account-level quota exhausted; terminal, surface immediately
    QuotaExhausted,
    /// Per-minute request limit on this credential; wait out the fixed window
    RateLimited,
    /// Credential rejected; skip it for the rest of the run
    Authentication,
    /// Anything else; retried with standard backoff
    Unknown,
}

impl ErrorCategory {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::CapacityExhausted => "capacity_exhausted",
            ErrorCategory::QuotaExhausted => "quota_exhausted",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// What the caller should do about a failure in this category.
    pub fn action(&self) -> RetryAction {
        match self {
            ErrorCategory::CapacityExhausted | ErrorCategory::Unknown => RetryAction::Backoff,
            ErrorCategory::RateLimited => RetryAction::FixedWait,
            ErrorCategory::Authentication => RetryAction::RotateCredential,
            ErrorCategory::QuotaExhausted => RetryAction::Fail,
        }
    }
}

/// Retry decision derived from an [`ErrorCategory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    /// Sleep `compute_delay(attempt)` and retry
    Backoff,
    /// Park the credential for the fixed rate-limit window and retry
    FixedWait,
    /// Abandon this credential for the run and retry on another
    RotateCredential,
    /// Do not retry
    Fail,
}

/// Result of classifying one upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    /// Whether any further attempt (on this or another credential) is useful
    pub retryable: bool,
    pub action: RetryAction,
}

impl From<ErrorCategory> for Classification {
    fn from(category: ErrorCategory) -> Self {
        let action = category.action();
        Self {
            category,
            retryable: action != RetryAction::Fail,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_the_only_terminal_category() {
        for category in [
            ErrorCategory::CapacityExhausted,
            ErrorCategory::RateLimited,
            ErrorCategory::Authentication,
            ErrorCategory::Unknown,
        ] {
            assert!(Classification::from(category).retryable, "{category:?}");
        }
        let quota = Classification::from(ErrorCategory::QuotaExhausted);
        assert!(!quota.retryable);
        assert_eq!(quota.action, RetryAction::Fail);
    }

    #[test]
    fn actions_match_categories() {
        assert_eq!(ErrorCategory::CapacityExhausted.action(), RetryAction::Backoff);
        assert_eq!(ErrorCategory::Unknown.action(), RetryAction::Backoff);
        assert_eq!(ErrorCategory::RateLimited.action(), RetryAction::FixedWait);
        assert_eq!(
            ErrorCategory::Authentication.action(),
            RetryAction::RotateCredential
        );
    }

    #[test]
    fn labels_are_metric_friendly() {
        assert_eq!(ErrorCategory::CapacityExhausted.label(), "capacity_exhausted");
        assert_eq!(ErrorCategory::QuotaExhausted.label(), "quota_exhausted");
        assert_eq!(ErrorCategory::RateLimited.label(), "rate_limited");
    }
}
