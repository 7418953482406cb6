//! In-memory queue backend: five id-keyed maps behind one mutex.

use super::{QueueItem, QueueStats, TaskQueue};
use crate::core::error::{CoreError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Partitions {
    pending: HashMap<String, QueueItem>,
    running: HashMap<String, QueueItem>,
    completed: HashMap<String, QueueItem>,
    failed: HashMap<String, QueueItem>,
    skipped: HashMap<String, QueueItem>,
    /// Insertion order, for FIFO ties at identical scores.
    insertion: HashMap<String, u64>,
    next_seq: u64,
}

impl Partitions {
    fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
            || self.running.contains_key(id)
            || self.completed.contains_key(id)
            || self.failed.contains_key(id)
            || self.skipped.contains_key(id)
    }

    fn best_pending_id(&self) -> Option<String> {
        self.pending
            .values()
            .min_by_key(|item| {
                (
                    item.priority_score(),
                    self.insertion.get(item.task_id()).copied().unwrap_or(0),
                )
            })
            .map(|item| item.task_id().to_string())
    }
}

/// Synchronous in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    partitions: Mutex<Partitions>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorted snapshot of one partition.
    fn sorted(items: &HashMap<String, QueueItem>, insertion: &HashMap<String, u64>) -> Vec<QueueItem> {
        let mut out: Vec<QueueItem> = items.values().cloned().collect();
        out.sort_by_key(|item| {
            (
                item.priority_score(),
                insertion.get(item.task_id()).copied().unwrap_or(0),
            )
        });
        out
    }
}

impl TaskQueue for MemoryQueue {
    fn enqueue(&self, item: QueueItem) -> Result<()> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let id = item.task_id().to_string();
        if parts.contains(&id) {
            return Err(CoreError::validation(format!(
                "task already queued: {id}"
            )));
        }
        let seq = parts.next_seq;
        parts.next_seq += 1;
        parts.insertion.insert(id.clone(), seq);
        parts.pending.insert(id, item);
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<QueueItem>> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let Some(id) = parts.best_pending_id() else {
            return Ok(None);
        };
        let Some(mut item) = parts.pending.remove(&id) else {
            return Ok(None);
        };
        item.started_at = Some(chrono::Utc::now().timestamp_millis());
        parts.running.insert(id, item.clone());
        Ok(Some(item))
    }

    fn peek(&self) -> Result<Option<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(parts
            .best_pending_id()
            .and_then(|id| parts.pending.get(&id).cloned()))
    }

    fn mark_running(&self, task_id: &str) -> Result<bool> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let Some(mut item) = parts.pending.remove(task_id) else {
            return Ok(false);
        };
        item.started_at = Some(chrono::Utc::now().timestamp_millis());
        parts.running.insert(task_id.to_string(), item);
        Ok(true)
    }

    fn mark_complete(&self, task_id: &str) -> Result<bool> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let Some(mut item) = parts.running.remove(task_id) else {
            return Ok(false);
        };
        item.completed_at = Some(chrono::Utc::now().timestamp_millis());
        parts.completed.insert(task_id.to_string(), item);
        Ok(true)
    }

    fn mark_failed(&self, task_id: &str) -> Result<bool> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let Some(mut item) = parts
            .running
            .remove(task_id)
            .or_else(|| parts.pending.remove(task_id))
        else {
            return Ok(false);
        };
        item.attempts += 1;
        item.started_at = None;
        if item.attempts < item.max_attempts {
            parts.pending.insert(task_id.to_string(), item);
        } else {
            item.completed_at = Some(chrono::Utc::now().timestamp_millis());
            parts.failed.insert(task_id.to_string(), item);
        }
        Ok(true)
    }

    fn mark_skipped(&self, task_id: &str) -> Result<bool> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let Some(mut item) = parts
            .pending
            .remove(task_id)
            .or_else(|| parts.running.remove(task_id))
        else {
            return Ok(false);
        };
        item.completed_at = Some(chrono::Utc::now().timestamp_millis());
        parts.skipped.insert(task_id.to_string(), item);
        Ok(true)
    }

    fn reset_task(&self, task_id: &str) -> Result<bool> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let Some(mut item) = parts
            .failed
            .remove(task_id)
            .or_else(|| parts.skipped.remove(task_id))
        else {
            return Ok(false);
        };
        item.attempts = 0;
        item.started_at = None;
        item.completed_at = None;
        parts.pending.insert(task_id.to_string(), item);
        Ok(true)
    }

    fn remove(&self, task_id: &str) -> Result<bool> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        let removed = parts.pending.remove(task_id).is_some()
            || parts.running.remove(task_id).is_some()
            || parts.completed.remove(task_id).is_some()
            || parts.failed.remove(task_id).is_some()
            || parts.skipped.remove(task_id).is_some();
        if removed {
            parts.insertion.remove(task_id);
        }
        Ok(removed)
    }

    fn has_task(&self, task_id: &str) -> Result<bool> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(parts.contains(task_id))
    }

    fn get_task(&self, task_id: &str) -> Result<Option<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(parts
            .pending
            .get(task_id)
            .or_else(|| parts.running.get(task_id))
            .or_else(|| parts.completed.get(task_id))
            .or_else(|| parts.failed.get(task_id))
            .or_else(|| parts.skipped.get(task_id))
            .cloned())
    }

    fn get_pending(&self) -> Result<Vec<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(Self::sorted(&parts.pending, &parts.insertion))
    }

    fn get_running(&self) -> Result<Vec<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(Self::sorted(&parts.running, &parts.insertion))
    }

    fn get_completed(&self) -> Result<Vec<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(Self::sorted(&parts.completed, &parts.insertion))
    }

    fn get_failed(&self) -> Result<Vec<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(Self::sorted(&parts.failed, &parts.insertion))
    }

    fn get_skipped(&self) -> Result<Vec<QueueItem>> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(Self::sorted(&parts.skipped, &parts.insertion))
    }

    fn stats(&self) -> Result<QueueStats> {
        let parts = self.partitions.lock().expect("lock poisoned");
        Ok(QueueStats {
            pending: parts.pending.len(),
            running: parts.running.len(),
            completed: parts.completed.len(),
            failed: parts.failed.len(),
            skipped: parts.skipped.len(),
        })
    }

    fn clear(&self) -> Result<()> {
        let mut parts = self.partitions.lock().expect("lock poisoned");
        *parts = Partitions::default();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Priority;
    use super::*;
    use crate::core::task::Task;

    fn item(id: &str, priority: Priority, at: i64) -> QueueItem {
        QueueItem::new(Task::new(id, format!("task {id}")), priority).with_enqueued_at(at)
    }

    #[test]
    fn dequeue_orders_by_priority_then_fifo() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("T1", Priority::Normal, 100)).unwrap();
        queue.enqueue(item("T2", Priority::High, 101)).unwrap();
        queue.enqueue(item("T3", Priority::High, 102)).unwrap();
        queue.enqueue(item("T4", Priority::Critical, 103)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue().unwrap())
            .map(|i| i.task_id().to_string())
            .collect();
        assert_eq!(order, vec!["T4", "T2", "T3", "T1"]);
    }

    #[test]
    fn dequeue_moves_to_running() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();

        let popped = queue.dequeue().unwrap().unwrap();
        assert!(popped.started_at.is_some());
        assert_eq!(queue.stats().unwrap().running, 1);
        assert_eq!(queue.stats().unwrap().pending, 0);
    }

    #[test]
    fn peek_does_not_move() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();
        assert_eq!(queue.peek().unwrap().unwrap().task_id(), "a");
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();
        assert!(queue.enqueue(item("a", Priority::High, 2)).is_err());
    }

    #[test]
    fn failure_retries_until_budget_exhausted() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(item("a", Priority::Normal, 1).with_max_attempts(2))
            .unwrap();

        queue.dequeue().unwrap().unwrap();
        queue.mark_failed("a").unwrap();
        assert_eq!(queue.stats().unwrap().pending, 1);

        queue.dequeue().unwrap().unwrap();
        queue.mark_failed("a").unwrap();
        assert_eq!(queue.stats().unwrap().failed, 1);
        assert_eq!(queue.get_task("a").unwrap().unwrap().attempts, 2);
    }

    #[test]
    fn retry_keeps_original_position() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("early", Priority::Normal, 100)).unwrap();
        queue.enqueue(item("late", Priority::Normal, 200)).unwrap();

        queue.dequeue().unwrap(); // early → running
        queue.mark_failed("early").unwrap(); // back to pending at t=100

        assert_eq!(queue.peek().unwrap().unwrap().task_id(), "early");
    }

    #[test]
    fn skip_accepts_pending_and_running() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("p", Priority::Normal, 1)).unwrap();
        queue.enqueue(item("r", Priority::Normal, 2)).unwrap();

        queue.mark_running("r").unwrap();
        assert!(queue.mark_skipped("p").unwrap());
        assert!(queue.mark_skipped("r").unwrap());
        assert_eq!(queue.stats().unwrap().skipped, 2);
        assert!(!queue.mark_skipped("nope").unwrap());
    }

    #[test]
    fn complete_requires_running() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();
        assert!(!queue.mark_complete("a").unwrap());

        queue.mark_running("a").unwrap();
        assert!(queue.mark_complete("a").unwrap());
        assert!(queue.get_task("a").unwrap().unwrap().completed_at.is_some());
    }

    #[test]
    fn reset_returns_failed_to_pending() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(item("a", Priority::Normal, 1).with_max_attempts(1))
            .unwrap();
        queue.dequeue().unwrap();
        queue.mark_failed("a").unwrap();

        assert!(queue.reset_task("a").unwrap());
        let reset = queue.get_task("a").unwrap().unwrap();
        assert_eq!(reset.attempts, 0);
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn exactly_one_partition_holds_each_id() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();
        queue.dequeue().unwrap();
        queue.mark_complete("a").unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total(), 1);
        assert!(queue.has_task("a").unwrap());
    }

    #[test]
    fn remove_and_clear() {
        let queue = MemoryQueue::new();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();
        queue.enqueue(item("b", Priority::Normal, 2)).unwrap();

        assert!(queue.remove("a").unwrap());
        assert!(!queue.has_task("a").unwrap());

        queue.clear().unwrap();
        assert_eq!(queue.stats().unwrap().total(), 0);
    }
}
