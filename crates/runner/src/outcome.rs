//! Per-item results, aggregate progress, and checkpoints

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Serialize, Serializer};

/// Terminal state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
    /// Abandoned because shutdown was requested before its work started
    Interrupted,
}

impl ItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Interrupted => "interrupted",
        }
    }
}

/// Outcome of one item, recorded exactly once when it reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub item_id: String,
    pub status: ItemStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Work-function attempts made, including retries
    pub attempts: u32,
}

impl WorkflowResult {
    pub fn succeeded(item_id: String, duration: Duration, attempts: u32) -> Self {
        Self {
            item_id,
            status: ItemStatus::Succeeded,
            success: true,
            error: None,
            duration,
            attempts,
        }
    }

    pub fn failed(item_id: String, error: String, duration: Duration, attempts: u32) -> Self {
        Self {
            item_id,
            status: ItemStatus::Failed,
            success: false,
            error: Some(error),
            duration,
            attempts,
        }
    }

    pub fn interrupted(item_id: String, duration: Duration, attempts: u32) -> Self {
        Self {
            item_id,
            status: ItemStatus::Interrupted,
            success: false,
            error: Some("interrupted by shutdown".to_string()),
            duration,
            attempts,
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Aggregate counters for a run. Reporting only; never used for control flow.
///
/// `completed` counts items whose work reached a terminal outcome (succeeded
/// or failed); interrupted items are counted separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub interrupted: usize,
}

impl ProgressStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.failed)
    }

    pub(crate) fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Succeeded => self.completed += 1,
            ItemStatus::Failed => {
                self.completed += 1;
                self.failed += 1;
            }
            ItemStatus::Interrupted => self.interrupted += 1,
        }
    }

    /// `done` counts every item in a terminal state.
    pub fn done(&self) -> usize {
        self.completed + self.interrupted
    }

    /// One-line summary: `4/5 succeeded, 1 failed`.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}/{} succeeded, {} failed",
            self.succeeded(),
            self.total,
            self.failed
        );
        if self.interrupted > 0 {
            line.push_str(&format!(", {} interrupted", self.interrupted));
        }
        line
    }
}

impl Serialize for ProgressStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ProgressStats", 5)?;
        s.serialize_field("total", &self.total)?;
        s.serialize_field("completed", &self.completed)?;
        s.serialize_field("succeeded", &self.succeeded())?;
        s.serialize_field("failed", &self.failed)?;
        s.serialize_field("interrupted", &self.interrupted)?;
        s.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Interrupted,
}

/// Marker that an item was abandoned on shutdown, for the caller to re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointEntry {
    pub status: CheckpointStatus,
}

impl CheckpointEntry {
    pub fn interrupted() -> Self {
        Self {
            status: CheckpointStatus::Interrupted,
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub stats: ProgressStats,
    /// In completion order, not submission order
    pub results: Vec<WorkflowResult>,
    pub checkpoints: BTreeMap<String, CheckpointEntry>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.stats.failed == 0 && self.stats.interrupted == 0
    }

    pub fn was_interrupted(&self) -> bool {
        self.stats.interrupted > 0
    }
}
