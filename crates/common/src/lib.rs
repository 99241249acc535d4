//! Common types shared by the workflow runner crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, fingerprint};
