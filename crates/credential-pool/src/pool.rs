//! Credential records, exclusive leases, and rate-limit parking
//!
//! All record state lives behind one mutex so that the scan-and-claim in
//! `acquire` is atomic: two workers can never claim the same credential. The
//! mutex is synchronous because leases release from `Drop`, which cannot
//! await. Waiters park on a `Notify` that fires on every release, rate-limit
//! mark, and disable, and they also wake on their own when the earliest
//! rate-limit deadline passes.
//!
//! A credential is eligible when it is not in use, not disabled, and its
//! `rate_limited_until` is unset or in the past. The rate-limit deadline
//! excludes a credential regardless of `in_use`.
//!
//! Every claim bumps the record's generation. A lease only settles the
//! record while its generation still matches, so a lease whose credential
//! was released out from under it cannot clear a later holder's claim.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Longest rate-limit park. Backoffs beyond it (including ones that would
/// overflow `Instant`) never expire within a run.
pub const MAX_RATE_LIMIT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A credential handed to a worker: a log-safe label plus the secret token.
#[derive(Debug, Clone)]
pub struct Credential {
    label: String,
    token: Secret<String>,
}

impl Credential {
    /// Stable identifier for logs and pool operations (`cred-0`, `cred-1`, ...).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The raw token. Never log this.
    pub fn token(&self) -> &str {
        self.token.expose()
    }

    /// Redacted `head…tail` form of the token.
    pub fn fingerprint(&self) -> String {
        self.token.fingerprint()
    }
}

/// Point-in-time status of one credential, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    InUse,
    RateLimited { until: Instant },
    Disabled,
}

impl CredentialStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Available => "available",
            CredentialStatus::InUse => "in_use",
            CredentialStatus::RateLimited { .. } => "rate_limited",
            CredentialStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug)]
struct CredentialRecord {
    credential: Credential,
    in_use: bool,
    rate_limited_until: Option<Instant>,
    disabled: bool,
    generation: u64,
}

impl CredentialRecord {
    fn is_rate_limited(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    fn is_available(&self, now: Instant) -> bool {
        !self.in_use && !self.disabled && !self.is_rate_limited(now)
    }

    fn status(&self, now: Instant) -> CredentialStatus {
        if self.disabled {
            return CredentialStatus::Disabled;
        }
        match self.rate_limited_until {
            Some(until) if until > now => CredentialStatus::RateLimited { until },
            _ if self.in_use => CredentialStatus::InUse,
            _ => CredentialStatus::Available,
        }
    }
}

/// Outcome of one scan over the records.
enum Scan {
    Claimed { credential: Credential, generation: u64 },
    /// Nothing free right now; `next_expiry` is the earliest rate-limit
    /// deadline among records that will be free once it passes.
    Busy { next_expiry: Option<Instant> },
    AllDisabled(usize),
}

/// Fixed set of credentials shared by every worker in a run.
///
/// Construct one per run and share it through `Arc`; nothing about the pool
/// is global, so independent runs in one process never see each other's
/// credential state.
pub struct Pool {
    records: Mutex<Vec<CredentialRecord>>,
    changed: Notify,
    exhaustions: AtomicU64,
}

impl Pool {
    /// Build a pool from raw tokens, labelled `cred-N` in input order.
    ///
    /// Blank tokens are skipped and duplicates collapsed, so the pool never
    /// holds two records for one upstream identity.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for token in tokens {
            let token = token.into().trim().to_string();
            if token.is_empty() || !seen.insert(token.clone()) {
                continue;
            }
            records.push(CredentialRecord {
                credential: Credential {
                    label: format!("cred-{}", records.len()),
                    token: Secret::new(token),
                },
                in_use: false,
                rate_limited_until: None,
                disabled: false,
                generation: 0,
            });
        }
        info!(credentials = records.len(), "credential pool initialized");
        Self {
            records: Mutex::new(records),
            changed: Notify::new(),
            exhaustions: AtomicU64::new(0),
        }
    }

    /// Claim a credential, waiting up to `timeout` (`None` waits indefinitely,
    /// as does a timeout too large to represent as a deadline).
    ///
    /// The wait ends early with `Error::Cancelled` when `shutdown` fires, and
    /// immediately with `Error::NoUsableCredentials` once every credential is
    /// disabled. The first empty scan of a wait logs one exhaustion notice;
    /// rescans within the same wait stay quiet.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        shutdown: &CancellationToken,
    ) -> Result<CredentialLease> {
        let started = Instant::now();
        let deadline = timeout.and_then(|t| started.checked_add(t));
        let mut waiting = false;

        loop {
            // Register for wakeups before scanning so a release that lands
            // between the scan and the await is not lost.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = match self.scan() {
                Scan::Claimed { credential, generation } => {
                    if waiting {
                        debug!(
                            credential = credential.label(),
                            waited_ms = started.elapsed().as_millis() as u64,
                            "credential acquired after wait"
                        );
                    }
                    return Ok(CredentialLease {
                        pool: Arc::clone(self),
                        credential,
                        generation,
                        settled: false,
                    });
                }
                Scan::AllDisabled(total) => return Err(Error::NoUsableCredentials(total)),
                Scan::Busy { next_expiry } => next_expiry,
            };

            if !waiting {
                waiting = true;
                self.exhaustions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("credential_pool_exhausted_total").increment(1);
                info!("all credentials busy or rate-limited, waiting for one to free up");
            }

            if shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(Error::Timeout(timeout.unwrap_or_default()));
            }

            let wake_at = match (deadline, next_expiry) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let timer = async move {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Err(Error::Cancelled),
                () = &mut notified => {}
                () = timer => {}
            }
        }
    }

    /// Return a credential to the pool and wake waiters.
    ///
    /// Unknown labels are ignored, so releasing twice is harmless.
    pub fn release(&self, label: &str) {
        self.release_held(label, None);
    }

    fn release_held(&self, label: &str, generation: Option<u64>) {
        let found = self.with_record(label, generation, |record| record.in_use = false);
        if found {
            debug!(credential = label, "credential released");
            self.changed.notify_waiters();
        } else {
            debug!(credential = label, "release ignored, credential unknown or reclaimed");
        }
    }

    /// Park a credential until `now + backoff` and clear its in-use flag.
    ///
    /// Backoffs longer than [`MAX_RATE_LIMIT`] are clamped to it.
    pub fn mark_rate_limited(&self, label: &str, backoff: Duration) {
        self.rate_limit_held(label, None, backoff);
    }

    fn rate_limit_held(&self, label: &str, generation: Option<u64>, backoff: Duration) {
        let until = Instant::now() + backoff.min(MAX_RATE_LIMIT);
        let found = self.with_record(label, generation, |record| {
            record.in_use = false;
            record.rate_limited_until = Some(until);
        });
        if found {
            metrics::counter!("credential_pool_rate_limited_total").increment(1);
            info!(
                credential = label,
                backoff_secs = backoff.as_secs_f64(),
                "credential rate-limited"
            );
            self.changed.notify_waiters();
        }
    }

    /// Remove a credential from rotation for the rest of the run.
    pub fn disable(&self, label: &str) {
        self.disable_held(label, None);
    }

    fn disable_held(&self, label: &str, generation: Option<u64>) {
        let found = self.with_record(label, generation, |record| {
            record.in_use = false;
            record.disabled = true;
        });
        if found {
            metrics::counter!("credential_pool_disabled_total").increment(1);
            warn!(credential = label, "credential disabled for this run (authentication failure)");
            self.changed.notify_waiters();
        }
    }

    /// Credentials that are neither in use, rate-limited, nor disabled right now.
    ///
    /// Observability only; `acquire` re-checks under the lock.
    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        self.lock().iter().filter(|r| r.is_available(now)).count()
    }

    /// Total credentials in the pool, in any state.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of acquire waits that began with no credential free.
    pub fn exhaustion_count(&self) -> u64 {
        self.exhaustions.load(Ordering::Relaxed)
    }

    /// Current status of one credential, or `None` if the label is unknown.
    pub fn status(&self, label: &str) -> Option<CredentialStatus> {
        let now = Instant::now();
        self.lock()
            .iter()
            .find(|r| r.credential.label == label)
            .map(|r| r.status(now))
    }

    /// Pool health summary.
    ///
    /// Status mapping: every credential available → healthy, some available
    /// or temporarily busy → degraded, none usable → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let now = Instant::now();
        let records = self.lock();

        let mut credentials = Vec::with_capacity(records.len());
        let (mut available, mut in_use, mut limited, mut disabled) = (0usize, 0usize, 0usize, 0usize);
        for record in records.iter() {
            let status = record.status(now);
            let mut entry = serde_json::json!({
                "id": record.credential.label,
                "fingerprint": record.credential.fingerprint(),
                "status": status.label(),
            });
            match status {
                CredentialStatus::Available => available += 1,
                CredentialStatus::InUse => in_use += 1,
                CredentialStatus::RateLimited { until } => {
                    limited += 1;
                    entry["rate_limit_remaining_secs"] =
                        serde_json::json!(until.saturating_duration_since(now).as_secs());
                }
                CredentialStatus::Disabled => disabled += 1,
            }
            credentials.push(entry);
        }

        let total = records.len();
        let status = if total > 0 && available == total {
            "healthy"
        } else if available + in_use + limited > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_available": available,
            "credentials_in_use": in_use,
            "credentials_rate_limited": limited,
            "credentials_disabled": disabled,
            "credentials": credentials,
        })
    }

    fn scan(&self) -> Scan {
        let now = Instant::now();
        let mut records = self.lock();

        if let Some(record) = records.iter_mut().find(|r| r.is_available(now)) {
            record.in_use = true;
            record.rate_limited_until = None;
            record.generation += 1;
            return Scan::Claimed {
                credential: record.credential.clone(),
                generation: record.generation,
            };
        }

        if records.iter().all(|r| r.disabled) {
            return Scan::AllDisabled(records.len());
        }

        let next_expiry = records
            .iter()
            .filter(|r| !r.disabled && !r.in_use)
            .filter_map(|r| r.rate_limited_until.filter(|until| *until > now))
            .min();
        Scan::Busy { next_expiry }
    }

    /// Apply `update` to the labelled record. With a `generation`, only while
    /// that claim is still the current one.
    fn with_record(
        &self,
        label: &str,
        generation: Option<u64>,
        update: impl FnOnce(&mut CredentialRecord),
    ) -> bool {
        let mut records = self.lock();
        let record = records.iter_mut().find(|r| r.credential.label == label);
        match record {
            Some(record)
                if generation.is_none_or(|g| record.in_use && record.generation == g) =>
            {
                update(record);
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CredentialRecord>> {
        // Record updates are single assignments, so a panic elsewhere while
        // holding the lock cannot leave a record half-written.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one credential.
///
/// Dropping the lease releases the credential, so it goes back to the pool on
/// every exit path: success, error, panic, or cancellation.
#[derive(Debug)]
pub struct CredentialLease {
    pool: Arc<Pool>,
    credential: Credential,
    generation: u64,
    settled: bool,
}

impl CredentialLease {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn label(&self) -> &str {
        self.credential.label()
    }

    /// Return the credential and park it for `backoff`.
    pub fn rate_limited(mut self, backoff: Duration) {
        self.pool
            .rate_limit_held(self.credential.label(), Some(self.generation), backoff);
        self.settled = true;
    }

    /// Return the credential and disable it for the rest of the run.
    pub fn disable(mut self) {
        self.pool
            .disable_held(self.credential.label(), Some(self.generation));
        self.settled = true;
    }

    /// Return the credential to the pool. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if !self.settled {
            self.pool
                .release_held(self.credential.label(), Some(self.generation));
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("credentials", &self.len())
            .field("available", &self.available_count())
            .finish()
    }
}
