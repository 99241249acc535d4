//! Error types for pool operations

use std::time::Duration;

/// Reasons `acquire` did not return a credential.
///
/// None of these are fatal to a run: the coordinator records the affected
/// item as failed (or interrupted, for `Cancelled`) and carries on.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("pool exhausted: no credential became available within {0:?}")]
    Timeout(Duration),

    #[error("credential acquisition cancelled by shutdown")]
    Cancelled,

    #[error("no usable credentials: all {0} disabled for this run")]
    NoUsableCredentials(usize),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_wait() {
        let msg = Error::Timeout(Duration::from_secs(300)).to_string();
        assert!(msg.contains("pool exhausted"), "got: {msg}");
        assert!(msg.contains("300s"), "got: {msg}");
    }

    #[test]
    fn disabled_message_counts_credentials() {
        assert_eq!(
            Error::NoUsableCredentials(2).to_string(),
            "no usable credentials: all 2 disabled for this run"
        );
    }
}
