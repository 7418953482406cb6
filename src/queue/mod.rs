//! Priority task queue with interchangeable backends.
//!
//! Ordering is total per backend: lower `(priority rank, enqueue time)`
//! dequeues first, FIFO within a tie. Every item sits in exactly one of
//! the five partitions (pending, running, completed, failed, skipped).

pub mod file;
pub mod memory;
#[cfg(feature = "redis-queue")]
pub mod redis;

use crate::core::error::Result;
use crate::core::task::Task;
use serde::{Deserialize, Serialize};

/// Default retry budget per queue item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queue priority, highest urgency first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Rank used in the priority score; lower dequeues earlier.
    #[must_use]
    pub fn rank(&self) -> u64 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::core::error::CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(crate::core::error::CoreError::validation(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub task: Task,
    #[serde(default)]
    pub priority: Priority,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl QueueItem {
    /// Creates a pending item enqueued now.
    #[must_use]
    pub fn new(task: Task, priority: Priority) -> Self {
        Self {
            task,
            priority,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Overrides the enqueue timestamp. Intended for tests and replay.
    #[must_use]
    pub fn with_enqueued_at(mut self, enqueued_at: i64) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }

    /// Ordering score: `rank × 10^15 + enqueuedAt`; lower is earlier.
    #[must_use]
    pub fn priority_score(&self) -> u64 {
        self.priority.rank() * 1_000_000_000_000_000 + self.enqueued_at.max(0) as u64
    }

    /// The queued task's id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

/// Partition counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl QueueStats {
    /// Total items across all partitions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.skipped
    }
}

/// Identity for a queue worker: `"<pid>-<startMillis>-<random9>"`.
#[must_use]
pub fn worker_id() -> String {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

/// The queue interface shared by every backend.
pub trait TaskQueue: Send + Sync {
    /// Adds an item to pending. Re-enqueueing a known id is an error.
    fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Pops the best pending item into running and returns it.
    fn dequeue(&self) -> Result<Option<QueueItem>>;

    /// The best pending item without moving it.
    fn peek(&self) -> Result<Option<QueueItem>>;

    /// Moves a pending item to running explicitly.
    fn mark_running(&self, task_id: &str) -> Result<bool>;

    /// Moves a running item to completed.
    fn mark_complete(&self, task_id: &str) -> Result<bool>;

    /// Records a failure: back to pending while attempts remain, else
    /// into failed.
    fn mark_failed(&self, task_id: &str) -> Result<bool>;

    /// Moves a pending or running item to skipped.
    fn mark_skipped(&self, task_id: &str) -> Result<bool>;

    /// Returns a failed or skipped item to pending with zero attempts.
    fn reset_task(&self, task_id: &str) -> Result<bool>;

    /// Removes the item wherever it is.
    fn remove(&self, task_id: &str) -> Result<bool>;

    /// True if any partition holds the id.
    fn has_task(&self, task_id: &str) -> Result<bool>;

    /// Fetches the item wherever it is.
    fn get_task(&self, task_id: &str) -> Result<Option<QueueItem>>;

    /// Pending items in dequeue order.
    fn get_pending(&self) -> Result<Vec<QueueItem>>;

    /// Running items.
    fn get_running(&self) -> Result<Vec<QueueItem>>;

    /// Completed items.
    fn get_completed(&self) -> Result<Vec<QueueItem>>;

    /// Failed items.
    fn get_failed(&self) -> Result<Vec<QueueItem>>;

    /// Skipped items.
    fn get_skipped(&self) -> Result<Vec<QueueItem>>;

    /// Partition counts.
    fn stats(&self) -> Result<QueueStats>;

    /// Empties every partition.
    fn clear(&self) -> Result<()>;

    /// Flushes and releases backend resources.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_order() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn score_orders_priority_before_time() {
        let early_low = QueueItem::new(Task::new("1", "t"), Priority::Low).with_enqueued_at(100);
        let late_critical =
            QueueItem::new(Task::new("2", "t"), Priority::Critical).with_enqueued_at(999_999);
        assert!(late_critical.priority_score() < early_low.priority_score());
    }

    #[test]
    fn score_breaks_priority_ties_by_time() {
        let first = QueueItem::new(Task::new("1", "t"), Priority::High).with_enqueued_at(100);
        let second = QueueItem::new(Task::new("2", "t"), Priority::High).with_enqueued_at(101);
        assert!(first.priority_score() < second.priority_score());
    }

    #[test]
    fn worker_ids_are_unique_enough() {
        let a = worker_id();
        let b = worker_id();
        assert_ne!(a, b);
        assert_eq!(a.split('-').count(), 3);
    }
}
