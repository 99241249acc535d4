//! Per-item attempt loop: credential lease, work call, classification, retry
//!
//! One item runs through as many attempts as the backoff policy allows. Each
//! attempt borrows a credential (when a pool is bound), calls the work
//! function, and on an upstream failure lets the classifier decide:
//!
//! - capacity / unknown: release the credential, sleep the jittered backoff
//! - per-minute rate limit: park the credential for the fixed window
//! - authentication: disable the credential and try another, no attempt spent
//! - quota: fail immediately
//!
//! The lease is dropped on every path out of an attempt, so the credential is
//! always returned. Panics inside the work function are caught and recorded
//! as that item's failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use credential_pool::{Credential, Pool};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use upstream::{BackoffPolicy, RetryAction, sleep_or_cancel};

use crate::error::WorkError;
use crate::output::{OutputMux, SharedSink};

/// Upstream text returned for the simulated rate-limit response.
pub const SIMULATED_RATE_LIMIT_MESSAGE: &str = "429 Too Many Requests: rate limit exceeded (simulated)";

/// Everything a work function gets for one attempt at one item.
pub struct WorkContext {
    pub item_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Exclusive credential for this attempt, when a pool is bound
    pub credential: Option<Credential>,
    /// Line-atomic output, prefixed with `[item_id] `
    pub output: OutputMux,
    /// Fires when the run is shutting down; observing it is optional
    pub shutdown: CancellationToken,
}

/// Terminal outcome of the attempt loop, before timing is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Succeeded { attempts: u32 },
    Failed { error: String, attempts: u32 },
    Interrupted { attempts: u32 },
}

/// Shared, read-only environment for every item in one run.
pub(crate) struct RunEnv<F> {
    pub work_fn: F,
    pub pool: Option<Arc<Pool>>,
    pub acquire_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    pub sink: SharedSink,
    pub shutdown: CancellationToken,
    pub simulate_pending: AtomicBool,
}

impl<F> RunEnv<F> {
    /// Drive one item to a terminal outcome.
    pub(crate) async fn drive<T, Fut>(&self, item: Arc<T>, item_id: &str) -> ItemOutcome
    where
        F: Fn(Arc<T>, WorkContext) -> Fut,
        Fut: Future<Output = Result<(), WorkError>>,
    {
        let mut attempt: u32 = 1;
        let mut made: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                debug!(attempt, "shutdown requested before attempt started");
                return ItemOutcome::Interrupted { attempts: made };
            }

            let lease = match &self.pool {
                Some(pool) => match pool.acquire(self.acquire_timeout, &self.shutdown).await {
                    Ok(lease) => Some(lease),
                    Err(credential_pool::Error::Cancelled) => {
                        return ItemOutcome::Interrupted { attempts: made };
                    }
                    Err(e) => {
                        warn!(error = %e, "credential unavailable");
                        return ItemOutcome::Failed {
                            error: format!("credential unavailable: {e}"),
                            attempts: made,
                        };
                    }
                },
                None => None,
            };

            if self.shutdown.is_cancelled() {
                return ItemOutcome::Interrupted { attempts: made };
            }

            made += 1;
            let credential = lease.as_ref().map(|l| l.credential().clone());
            debug!(
                attempt,
                credential = credential.as_ref().map(Credential::label).unwrap_or("none"),
                "attempt started"
            );

            let result = match &credential {
                Some(c) if self.simulate_pending.swap(false, Ordering::SeqCst) => {
                    warn!(credential = c.label(), "simulating upstream rate-limit response");
                    Err(WorkError::upstream(Some(429), SIMULATED_RATE_LIMIT_MESSAGE))
                }
                _ => self.invoke(Arc::clone(&item), item_id, attempt, credential).await,
            };

            let (status, message) = match result {
                Ok(()) => return ItemOutcome::Succeeded { attempts: made },
                Err(WorkError::Failed(error)) => {
                    return ItemOutcome::Failed { error, attempts: made };
                }
                Err(WorkError::Upstream { status, message }) => (status, message),
            };

            let classification = upstream::classify(&message, status);
            let category = classification.category.label();
            metrics::counter!("workflow_upstream_errors_total", "category" => category).increment(1);
            let out_of_attempts = attempt >= self.backoff.max_attempts;

            match classification.action {
                RetryAction::Fail => {
                    warn!(category, error = %message, "terminal upstream error, not retrying");
                    return ItemOutcome::Failed {
                        error: format!("{category}: {message}"),
                        attempts: made,
                    };
                }
                RetryAction::RotateCredential => match lease {
                    Some(lease) => {
                        warn!(credential = lease.label(), "credential rejected, rotating");
                        lease.disable();
                        continue;
                    }
                    None => {
                        return ItemOutcome::Failed {
                            error: format!("{category}: {message}"),
                            attempts: made,
                        };
                    }
                },
                RetryAction::FixedWait => {
                    let wait = self.backoff.rate_limit_wait;
                    match lease {
                        Some(lease) => lease.rate_limited(wait),
                        None if !out_of_attempts => {
                            info!(attempt, wait_secs = wait.as_secs_f64(), "rate limited, waiting out window");
                            if !sleep_or_cancel(wait, &self.shutdown).await {
                                return ItemOutcome::Interrupted { attempts: made };
                            }
                        }
                        None => {}
                    }
                }
                RetryAction::Backoff => {
                    drop(lease);
                    if !out_of_attempts {
                        let delay = self.backoff.delay_for(attempt);
                        info!(
                            attempt,
                            category,
                            delay_ms = delay.as_millis() as u64,
                            "transient upstream error, backing off"
                        );
                        if !sleep_or_cancel(delay, &self.shutdown).await {
                            return ItemOutcome::Interrupted { attempts: made };
                        }
                    }
                }
            }

            if out_of_attempts {
                warn!(attempts = made, category, "retries exhausted");
                return ItemOutcome::Failed {
                    error: format!("gave up after {made} attempts: {category}: {message}"),
                    attempts: made,
                };
            }
            attempt += 1;
        }
    }

    async fn invoke<T, Fut>(
        &self,
        item: Arc<T>,
        item_id: &str,
        attempt: u32,
        credential: Option<Credential>,
    ) -> Result<(), WorkError>
    where
        F: Fn(Arc<T>, WorkContext) -> Fut,
        Fut: Future<Output = Result<(), WorkError>>,
    {
        let ctx = WorkContext {
            item_id: item_id.to_string(),
            attempt,
            credential,
            output: self.sink.mux(format!("[{item_id}] ")),
            shutdown: self.shutdown.child_token(),
        };

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.work_fn)(item, ctx))) {
            Ok(future) => future,
            Err(payload) => return Err(panicked(payload)),
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(panicked(payload)),
        }
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> WorkError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(panic = %message, "work function panicked");
    WorkError::Failed(format!("work function panicked: {message}"))
}
