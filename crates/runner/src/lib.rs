//! Parallel execution core for workflow runs
//!
//! Runs one work function per input item across a bounded number of
//! concurrent slots. Each running item borrows an exclusive credential from a
//! shared [`credential_pool::Pool`], retries transient upstream failures with
//! jittered backoff, and writes its output through a per-item [`OutputMux`]
//! so concurrent workers never interleave partial lines.
//!
//! Per-item state machine:
//! - dry run: `pending → listed`
//! - otherwise: `pending → awaiting-credential → running → succeeded | failed | interrupted`
//!
//! A failure in one item never reaches its siblings. Shutdown is cooperative:
//! running items finish their current attempt, items that have not started
//! are recorded as interrupted and checkpointed.

pub mod attempt;
pub mod coordinator;
pub mod error;
pub mod options;
pub mod outcome;
pub mod output;

pub use attempt::WorkContext;
pub use coordinator::Coordinator;
pub use error::{Error, Result, WorkError};
pub use options::{DEFAULT_MAX_CONCURRENCY, MAX_CONCURRENCY_CAP, RunnerOptions};
pub use outcome::{CheckpointEntry, CheckpointStatus, ItemStatus, ProgressStats, RunReport, WorkflowResult};
pub use output::{MemoryBuffer, OutputMux, SharedSink};
