//! Error types for the runner

use thiserror::Error;

/// Coordinator configuration errors.
///
/// These are programming errors in how the coordinator was set up and are
/// the only errors that propagate to the caller; per-item failures are
/// recorded in the run report instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("max_concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),
}

/// Result alias using runner Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure returned by a work function for one attempt at one item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// The upstream service rejected the call. The message is classified to
    /// decide between backoff, credential rotation, and giving up.
    #[error("upstream error{}: {message}", status_suffix(.status))]
    Upstream { status: Option<u16>, message: String },

    /// Any other failure. Recorded as-is, never retried.
    #[error("{0}")]
    Failed(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl WorkError {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}
