//! Secret wrapper for credential tokens
//!
//! Tokens handed to workers are wrapped in [`Secret`] so they never reach a
//! log line through `Debug` or `Display`. When a log needs to tell two
//! credentials apart it uses [`fingerprint`], which keeps only a few leading
//! and trailing characters.

use std::fmt;
use zeroize::Zeroize;

/// Number of characters kept at each end of a fingerprint.
const FINGERPRINT_EDGE: usize = 4;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Short, non-reversible-enough form of the token for log correlation.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Render a token as `head…tail`, never the full value.
///
/// Tokens too short to hide anything meaningful are fully masked.
pub fn fingerprint(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= FINGERPRINT_EDGE * 3 {
        return "*".repeat(chars.len().max(1));
    }
    let head: String = chars[..FINGERPRINT_EDGE].iter().collect();
    let tail: String = chars[chars.len() - FINGERPRINT_EDGE..].iter().collect();
    format!("{head}\u{2026}{tail}")
}
