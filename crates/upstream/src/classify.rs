//! Upstream error classification
//!
//! Maps raw error text (response body, CLI stderr) and an optional HTTP status
//! to an [`ErrorCategory`]. Text markers win over status codes, and categories
//! are checked in priority order: an overload message that also mentions a
//! rate limit is capacity exhaustion, and a 429 whose body talks about a plan
//! quota is quota exhaustion, not a per-minute limit.

use crate::{Classification, ErrorCategory};

/// Server-side capacity exhaustion. Checked first.
const CAPACITY_PATTERNS: &[&str] = &[
    "overloaded",
    "at capacity",
    "capacity exhausted",
    "capacity_exhausted",
    "no capacity available",
    "server is busy",
    "temporarily unavailable",
];

/// Account-level quota exhaustion. Retrying on this account is pointless.
const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "quota_exceeded",
    "exceeded your current quota",
    "insufficient_quota",
    "usage limit for your plan",
    "subscription usage limit",
    "5-hour",
    "5 hour",
    "credit balance is too low",
    "daily limit",
];

/// Per-minute request limits that reset on a fixed window.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "requests per minute",
    "per minute",
];

/// Rejected or revoked credentials.
const AUTH_PATTERNS: &[&str] = &[
    "invalid api key",
    "invalid x-api-key",
    "invalid_api_key",
    "authentication_error",
    "authentication failed",
    "unauthorized",
    "permission denied",
    "invalid bearer token",
];

/// Classify an upstream failure by error text and optional HTTP status.
///
/// Text is matched case-insensitively. A status code only decides the category
/// when no text marker of equal or higher priority matched:
/// 529/503 capacity, 429 rate limit, 401/403 authentication.
pub fn classify(text: &str, status: Option<u16>) -> Classification {
    category_of(text, status).into()
}

fn category_of(text: &str, status: Option<u16>) -> ErrorCategory {
    let lower = text.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(CAPACITY_PATTERNS) || matches!(status, Some(529 | 503)) {
        return ErrorCategory::CapacityExhausted;
    }
    if matches(QUOTA_PATTERNS) {
        return ErrorCategory::QuotaExhausted;
    }
    if matches(RATE_LIMIT_PATTERNS) || status == Some(429) {
        return ErrorCategory::RateLimited;
    }
    if matches(AUTH_PATTERNS) || matches!(status, Some(401 | 403)) {
        return ErrorCategory::Authentication;
    }
    ErrorCategory::Unknown
}
