//! Credential pool for rate-limited upstream services
//!
//! Holds a fixed set of credentials for the lifetime of a run and hands each
//! one to at most one worker at a time. Credentials that hit a per-minute
//! limit are parked until their deadline passes; credentials rejected by the
//! upstream are disabled for the rest of the run.
//!
//! Credential lifecycle:
//! 1. `Pool::new` builds one record per distinct token, all available
//! 2. `acquire` claims the first available record and returns a lease
//! 3. Dropping the lease releases the credential and wakes waiters
//! 4. `lease.rate_limited(d)` parks the credential until `now + d`
//! 5. Deadline passes → eligible again without explicit action
//! 6. `lease.disable()` removes the credential from rotation for the run

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{Credential, CredentialLease, CredentialStatus, Pool};
