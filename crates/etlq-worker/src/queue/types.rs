//! Core types for the work queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A `(source_table, destination_table)` combination, the unit of work partitioning
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferPair {
    pub source_table: String,
    pub destination_table: String,
}

impl TransferPair {
    pub fn new(source_table: impl Into<String>, destination_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            destination_table: destination_table.into(),
        }
    }
}

impl std::fmt::Display for TransferPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] -> [{}]", self.source_table, self.destination_table)
    }
}

/// Queue item status
///
/// `WAITING -> RUNNING -> COMPLETED | FAILED`. Operators may send a FAILED
/// item back to WAITING; nothing else leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [
        QueueStatus::Waiting,
        QueueStatus::Running,
        QueueStatus::Completed,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "WAITING",
            QueueStatus::Running => "RUNNING",
            QueueStatus::Completed => "COMPLETED",
            QueueStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    /// States an item may be in immediately before moving to `self`
    pub fn predecessors(&self) -> &'static [QueueStatus] {
        match self {
            QueueStatus::Waiting => &[QueueStatus::Failed],
            QueueStatus::Running => &[QueueStatus::Waiting],
            QueueStatus::Completed | QueueStatus::Failed => &[QueueStatus::Running],
        }
    }

    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(QueueStatus::Waiting),
            "RUNNING" => Ok(QueueStatus::Running),
            "COMPLETED" => Ok(QueueStatus::Completed),
            "FAILED" => Ok(QueueStatus::Failed),
            other => Err(StoreError::decode("queue status", format!("unknown status '{}'", other))),
        }
    }
}

/// One batch of source ids (maps to the etl_queue table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub source_table: String,
    pub destination_table: String,
    /// Informational; the batch size configured when the item was enqueued
    pub batch_size: u32,
    pub start_id: i64,
    pub last_id: i64,
    pub status: QueueStatus,
    pub cluster_id: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl QueueItem {
    pub fn pair(&self) -> TransferPair {
        TransferPair::new(&self.source_table, &self.destination_table)
    }
}

/// Inclusive source-id range assigned to one cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    pub start_id: i64,
    pub last_id: i64,
    pub cluster_id: u32,
}

/// What the drain loop does after a handler failure has been recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record FAILED and move on to the next item
    #[default]
    Continue,
    /// Record FAILED and stop draining with a fatal error
    Halt,
}

/// Outcome counters of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: u64,
    pub failed: u64,
}

impl DrainReport {
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }
}

impl std::ops::AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Queue progress snapshot for one transfer pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueProgress {
    pub waiting: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueProgress {
    pub fn record(&mut self, status: QueueStatus, count: i64) {
        match status {
            QueueStatus::Waiting => self.waiting += count,
            QueueStatus::Running => self.running += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.waiting + self.running + self.completed + self.failed
    }

    pub fn is_drained(&self) -> bool {
        self.waiting == 0 && self.running == 0
    }

    /// Share of items that reached COMPLETED
    pub fn completion_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}
