//! File-backed queue: the memory backend plus a debounced JSON
//! snapshot.
//!
//! Mutations mark the snapshot dirty; a flusher thread persists 100 ms
//! after the last mutation and at least every 5 s, never more often
//! than once per second. Snapshots are written via temp-file-rename.
//! On load, `running` items are restored as `pending` and terminal
//! partitions are rebuilt by replaying their transitions.

use super::memory::MemoryQueue;
use super::{QueueItem, QueueStats, TaskQueue};
use crate::core::error::Result;
use crate::storage::guard_unsafe_keys;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Quiet period after the last mutation before a save.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// A dirty snapshot is persisted at least this often.
const PERIODIC_SAVE: Duration = Duration::from_secs(5);

/// Floor between consecutive saves.
const MIN_SAVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    pending: Vec<QueueItem>,
    #[serde(default)]
    running: Vec<QueueItem>,
    #[serde(default)]
    completed: Vec<QueueItem>,
    #[serde(default)]
    failed: Vec<QueueItem>,
    #[serde(default)]
    skipped: Vec<QueueItem>,
}

struct DirtyState {
    dirty: bool,
    last_mutation: Instant,
    last_save: Instant,
}

struct Shared {
    inner: MemoryQueue,
    path: PathBuf,
    dirty: Mutex<DirtyState>,
    shutdown: AtomicBool,
}

impl Shared {
    fn mark_dirty(&self) {
        let mut state = self.dirty.lock().expect("lock poisoned");
        state.dirty = true;
        state.last_mutation = Instant::now();
    }

    fn save_due(&self) -> bool {
        let state = self.dirty.lock().expect("lock poisoned");
        if !state.dirty || state.last_save.elapsed() < MIN_SAVE_INTERVAL {
            return false;
        }
        state.last_mutation.elapsed() >= DEBOUNCE || state.last_save.elapsed() >= PERIODIC_SAVE
    }

    fn save(&self) -> Result<()> {
        let snapshot = Snapshot {
            pending: self.inner.get_pending()?,
            running: self.inner.get_running()?,
            completed: self.inner.get_completed()?,
            failed: self.inner.get_failed()?,
            skipped: self.inner.get_skipped()?,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        crate::storage::write_atomic(&self.path, &content)?;

        let mut state = self.dirty.lock().expect("lock poisoned");
        state.dirty = false;
        state.last_save = Instant::now();
        Ok(())
    }
}

/// Queue persisted as a JSON snapshot next to the working directory.
pub struct FileQueue {
    shared: Arc<Shared>,
    flusher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FileQueue {
    /// Opens (or creates) a file-backed queue at `path`.
    ///
    /// # Errors
    /// Propagates IO/parse failures from an existing snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = MemoryQueue::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if !content.trim().is_empty() {
                guard_unsafe_keys(&content)?;
                let snapshot: Snapshot = serde_json::from_str(&content)?;
                replay(&inner, snapshot)?;
            }
        }

        let shared = Arc::new(Shared {
            inner,
            path,
            dirty: Mutex::new(DirtyState {
                dirty: false,
                last_mutation: Instant::now(),
                last_save: Instant::now()
                    .checked_sub(MIN_SAVE_INTERVAL)
                    .unwrap_or_else(Instant::now),
            }),
            shutdown: AtomicBool::new(false),
        });

        let flusher_shared = Arc::clone(&shared);
        let flusher = std::thread::spawn(move || {
            while !flusher_shared.shutdown.load(Ordering::SeqCst) {
                if flusher_shared.save_due() {
                    let _ = flusher_shared.save();
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Forces an immediate snapshot.
    ///
    /// # Errors
    /// Propagates IO failures.
    pub fn flush(&self) -> Result<()> {
        self.shared.save()
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Rebuilds the memory backend from a snapshot by replaying the
/// transitions that put each item in its partition.
fn replay(inner: &MemoryQueue, snapshot: Snapshot) -> Result<()> {
    for item in snapshot.pending {
        inner.enqueue(item)?;
    }
    // Running items were interrupted mid-flight; they restart.
    for mut item in snapshot.running {
        item.started_at = None;
        inner.enqueue(item)?;
    }
    for item in snapshot.completed {
        let id = item.task_id().to_string();
        inner.enqueue(item)?;
        inner.mark_running(&id)?;
        inner.mark_complete(&id)?;
    }
    for mut item in snapshot.failed {
        let id = item.task_id().to_string();
        item.attempts = item.attempts.saturating_sub(1);
        inner.enqueue(item)?;
        inner.mark_running(&id)?;
        inner.mark_failed(&id)?;
    }
    for item in snapshot.skipped {
        let id = item.task_id().to_string();
        inner.enqueue(item)?;
        inner.mark_skipped(&id)?;
    }
    Ok(())
}

impl TaskQueue for FileQueue {
    fn enqueue(&self, item: QueueItem) -> Result<()> {
        self.shared.inner.enqueue(item)?;
        self.shared.mark_dirty();
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<QueueItem>> {
        let item = self.shared.inner.dequeue()?;
        if item.is_some() {
            self.shared.mark_dirty();
        }
        Ok(item)
    }

    fn peek(&self) -> Result<Option<QueueItem>> {
        self.shared.inner.peek()
    }

    fn mark_running(&self, task_id: &str) -> Result<bool> {
        let moved = self.shared.inner.mark_running(task_id)?;
        if moved {
            self.shared.mark_dirty();
        }
        Ok(moved)
    }

    fn mark_complete(&self, task_id: &str) -> Result<bool> {
        let moved = self.shared.inner.mark_complete(task_id)?;
        if moved {
            self.shared.mark_dirty();
        }
        Ok(moved)
    }

    fn mark_failed(&self, task_id: &str) -> Result<bool> {
        let moved = self.shared.inner.mark_failed(task_id)?;
        if moved {
            self.shared.mark_dirty();
        }
        Ok(moved)
    }

    fn mark_skipped(&self, task_id: &str) -> Result<bool> {
        let moved = self.shared.inner.mark_skipped(task_id)?;
        if moved {
            self.shared.mark_dirty();
        }
        Ok(moved)
    }

    fn reset_task(&self, task_id: &str) -> Result<bool> {
        let moved = self.shared.inner.reset_task(task_id)?;
        if moved {
            self.shared.mark_dirty();
        }
        Ok(moved)
    }

    fn remove(&self, task_id: &str) -> Result<bool> {
        let removed = self.shared.inner.remove(task_id)?;
        if removed {
            self.shared.mark_dirty();
        }
        Ok(removed)
    }

    fn has_task(&self, task_id: &str) -> Result<bool> {
        self.shared.inner.has_task(task_id)
    }

    fn get_task(&self, task_id: &str) -> Result<Option<QueueItem>> {
        self.shared.inner.get_task(task_id)
    }

    fn get_pending(&self) -> Result<Vec<QueueItem>> {
        self.shared.inner.get_pending()
    }

    fn get_running(&self) -> Result<Vec<QueueItem>> {
        self.shared.inner.get_running()
    }

    fn get_completed(&self) -> Result<Vec<QueueItem>> {
        self.shared.inner.get_completed()
    }

    fn get_failed(&self) -> Result<Vec<QueueItem>> {
        self.shared.inner.get_failed()
    }

    fn get_skipped(&self) -> Result<Vec<QueueItem>> {
        self.shared.inner.get_skipped()
    }

    fn stats(&self) -> Result<QueueStats> {
        self.shared.inner.stats()
    }

    fn clear(&self) -> Result<()> {
        self.shared.inner.clear()?;
        self.shared.mark_dirty();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.flusher.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
        self.shared.save()
    }
}
