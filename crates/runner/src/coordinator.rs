//! Bounded worker pool coordinator
//!
//! Fans items out across at most `max_concurrency` concurrent slots (a Tokio
//! semaphore), drives each through the attempt loop, and collects results in
//! completion order. Progress counters and checkpoints are only mutated by
//! the collecting loop, one result at a time.
//!
//! Shutdown: the coordinator's cancellation token is the single shutdown
//! flag. Items waiting for a slot, a credential, or a backoff sleep wake up
//! and are recorded as interrupted; items mid-attempt finish that attempt.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use credential_pool::Pool;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::attempt::{ItemOutcome, RunEnv, WorkContext};
use crate::error::{Error, Result, WorkError};
use crate::options::{MAX_CONCURRENCY_CAP, RunnerOptions};
use crate::outcome::{CheckpointEntry, ItemStatus, ProgressStats, RunReport, WorkflowResult};
use crate::output::SharedSink;

pub struct Coordinator {
    max_concurrency: usize,
    clamped_from: Option<usize>,
    options: RunnerOptions,
    pool: Option<Arc<Pool>>,
    sink: SharedSink,
    shutdown: CancellationToken,
    progress: Mutex<ProgressStats>,
    checkpoints: Mutex<BTreeMap<String, CheckpointEntry>>,
}

impl Coordinator {
    /// Create a coordinator with no credential pool, writing to stdout.
    ///
    /// A `max_concurrency` above [`MAX_CONCURRENCY_CAP`] is clamped with a
    /// warning. Zero is rejected.
    pub fn new(options: RunnerOptions) -> Result<Self> {
        let requested = options.max_concurrency;
        if requested == 0 {
            return Err(Error::InvalidConcurrency(requested));
        }
        let (max_concurrency, clamped_from) = if requested > MAX_CONCURRENCY_CAP {
            warn!(
                requested,
                cap = MAX_CONCURRENCY_CAP,
                "max_concurrency above hard cap, clamping"
            );
            (MAX_CONCURRENCY_CAP, Some(requested))
        } else {
            (requested, None)
        };

        Ok(Self {
            max_concurrency,
            clamped_from,
            options,
            pool: None,
            sink: SharedSink::stdout(),
            shutdown: CancellationToken::new(),
            progress: Mutex::new(ProgressStats::default()),
            checkpoints: Mutex::new(BTreeMap::new()),
        })
    }

    /// Bind a credential pool; every attempt then holds one credential.
    pub fn with_pool(mut self, pool: Arc<Pool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Send progress text and worker output to `sink` instead of stdout.
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Use an externally owned shutdown token (e.g. one wired to SIGINT).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Effective concurrency bound after clamping.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// The requested bound, if it was clamped to the cap.
    pub fn clamped_from(&self) -> Option<usize> {
        self.clamped_from
    }

    pub fn pool(&self) -> Option<&Arc<Pool>> {
        self.pool.as_ref()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request graceful shutdown. Safe to call any number of times.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            debug!("shutdown already requested");
            return;
        }
        info!("shutdown requested, letting running items finish");
        self.shutdown.cancel();
    }

    /// Snapshot of the current (or last) run's counters.
    pub fn progress(&self) -> ProgressStats {
        *lock(&self.progress)
    }

    /// Items abandoned on shutdown during the last run.
    pub fn get_checkpoints(&self) -> BTreeMap<String, CheckpointEntry> {
        lock(&self.checkpoints).clone()
    }

    /// Run `work_fn` once per item (plus retries) and wait for every item to
    /// reach a terminal state.
    ///
    /// With `dry_run`, only lists the item identifiers: the work function is
    /// never called and the credential pool is never touched.
    pub async fn execute<T, F, Fut, I>(&self, items: Vec<T>, work_fn: F, id_fn: I, dry_run: bool) -> RunReport
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WorkError>> + Send + 'static,
        I: Fn(&T) -> String,
    {
        let run_id = uuid::Uuid::new_v4().to_string();
        let total = items.len();
        *lock(&self.progress) = ProgressStats::new(total);
        lock(&self.checkpoints).clear();

        if dry_run {
            return self.list_only(run_id, &items, &id_fn);
        }

        info!(
            run_id = %run_id,
            items = total,
            max_concurrency = self.max_concurrency,
            credentials = self.pool.as_ref().map(|p| p.len()),
            "run started"
        );

        let env = Arc::new(RunEnv {
            work_fn,
            pool: self.pool.clone(),
            acquire_timeout: self.options.acquire_timeout,
            backoff: self.options.backoff.clone(),
            sink: self.sink.clone(),
            shutdown: self.shutdown.clone(),
            simulate_pending: AtomicBool::new(self.options.simulate_rate_limit),
        });
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut task_items = HashMap::with_capacity(total);

        for item in items {
            let item_id = id_fn(&item);
            let item = Arc::new(item);
            let env = Arc::clone(&env);
            let slots = Arc::clone(&slots);
            let span = info_span!("item", item_id = %item_id);
            let task_item = item_id.clone();

            let handle = tasks.spawn(
                async move {
                    let permit = tokio::select! {
                        biased;
                        () = env.shutdown.cancelled() => None,
                        permit = slots.acquire_owned() => permit.ok(),
                    };
                    let started = Instant::now();
                    let outcome = match permit {
                        Some(_permit) => env.drive(item, &item_id).await,
                        None => ItemOutcome::Interrupted { attempts: 0 },
                    };
                    let elapsed = started.elapsed();
                    match outcome {
                        ItemOutcome::Succeeded { attempts } => WorkflowResult::succeeded(item_id, elapsed, attempts),
                        ItemOutcome::Failed { error, attempts } => {
                            WorkflowResult::failed(item_id, error, elapsed, attempts)
                        }
                        ItemOutcome::Interrupted { attempts } => {
                            WorkflowResult::interrupted(item_id, elapsed, attempts)
                        }
                    }
                }
                .instrument(span),
            );
            task_items.insert(handle.id(), task_item);
        }

        let results = self.collect(tasks, task_items).await;

        let stats = self.progress();
        let summary = format!("Summary: {}", stats.summary());
        self.emit(&summary);
        info!(
            run_id = %run_id,
            succeeded = stats.succeeded(),
            failed = stats.failed,
            interrupted = stats.interrupted,
            "run finished"
        );

        RunReport {
            run_id,
            dry_run: false,
            stats,
            results,
            checkpoints: self.get_checkpoints(),
        }
    }

    /// Record each item task's result as it completes.
    ///
    /// A task that ends without a result is recorded as a failure of the item
    /// it was spawned for.
    async fn collect(
        &self,
        mut tasks: JoinSet<WorkflowResult>,
        mut task_items: HashMap<Id, String>,
    ) -> Vec<WorkflowResult> {
        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            let result = match joined {
                Ok((id, result)) => {
                    task_items.remove(&id);
                    result
                }
                Err(e) => {
                    let item_id = task_items
                        .remove(&e.id())
                        .unwrap_or_else(|| format!("task-{}", e.id()));
                    task_failure(item_id, &e)
                }
            };
            self.record(&result);
            results.push(result);
        }
        results
    }

    fn list_only<T, I>(&self, run_id: String, items: &[T], id_fn: &I) -> RunReport
    where
        I: Fn(&T) -> String,
    {
        info!(run_id = %run_id, items = items.len(), "dry run, nothing will execute");
        self.emit(&format!("[dry-run] {} item(s) would be processed:", items.len()));
        for item in items {
            self.emit(&format!("[dry-run]   {}", id_fn(item)));
        }
        RunReport {
            run_id,
            dry_run: true,
            stats: self.progress(),
            results: Vec::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    fn record(&self, result: &WorkflowResult) {
        let stats = {
            let mut progress = lock(&self.progress);
            progress.record(result.status);
            *progress
        };
        if result.status == ItemStatus::Interrupted {
            lock(&self.checkpoints).insert(result.item_id.clone(), CheckpointEntry::interrupted());
        }

        metrics::counter!("workflow_items_total", "outcome" => result.status.label()).increment(1);
        metrics::histogram!("workflow_item_duration_seconds").record(result.duration.as_secs_f64());

        let position = format!("[{}/{}]", stats.done(), stats.total);
        let line = match result.status {
            ItemStatus::Succeeded => format!(
                "{position} ok {} ({:.1}s)",
                result.item_id,
                result.duration.as_secs_f64()
            ),
            ItemStatus::Failed => format!(
                "{position} FAILED {}: {}",
                result.item_id,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            ItemStatus::Interrupted => format!("{position} interrupted {}", result.item_id),
        };
        self.emit(&line);

        match result.status {
            ItemStatus::Failed => warn!(
                item_id = %result.item_id,
                error = result.error.as_deref().unwrap_or_default(),
                "item failed"
            ),
            _ => debug!(item_id = %result.item_id, status = result.status.label(), "item finished"),
        }
    }

    fn emit(&self, line: &str) {
        if let Err(e) = self.sink.write_line(line) {
            warn!(error = %e, "failed to write progress line");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work-function panics are caught inside the task, so this only covers
/// tasks the runtime cancelled or that panicked outside the work function.
fn task_failure(item_id: String, error: &JoinError) -> WorkflowResult {
    error!(item_id = %item_id, error = %error, "item task did not complete");
    WorkflowResult::failed(item_id, format!("task aborted: {error}"), Duration::ZERO, 0)
}
