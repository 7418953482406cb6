//! File-granularity advisory locks.
//!
//! A lock is a JSON file created with exclusive-create semantics under
//! `<workDir>/.ralphy/locks/`, mirrored in an in-memory table for fast
//! re-entry checks. Locks are advisory: nothing stops an external
//! process from writing the guarded path. Expired locks are evicted
//! lazily and by a periodic sweep.

use super::error::{CoreError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default lifetime of a lock before it is considered stale.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between stale-lock sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Ceiling on in-memory lock entries before eviction kicks in.
const MAX_TRACKED_LOCKS: usize = 5000;

/// Upper bound for one backoff sleep during acquisition.
const MAX_BACKOFF_MS: u64 = 5000;

/// On-disk lock payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Acquisition (or last refresh) time, epoch milliseconds.
    pub timestamp: u64,
    /// Lifetime in milliseconds; the lock is live while
    /// `now - timestamp < timeout`.
    pub timeout: u64,
    /// `"<pid>-<process-start-millis>"` of the holder.
    pub owner: String,
    /// Number of re-entrant refreshes by the owner.
    pub refresh_count: u32,
}

impl LockInfo {
    fn is_live(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) < self.timeout
    }
}

/// Normalizes a path into a logical lock name.
///
/// Relative paths are resolved against `work_dir`; separators become
/// `/`; `.` and `..` components collapse lexically (no disk access);
/// Windows names are lowercased.
#[must_use]
pub fn normalize_lock_name(path: &Path, work_dir: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    };

    let mut parts: Vec<String> = Vec::new();
    for component in absolute.components() {
        use std::path::Component;
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir => {}
            Component::Prefix(p) => parts.push(p.as_os_str().to_string_lossy().into_owned()),
            Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
        }
    }

    let name = format!("/{}", parts.join("/"));
    if cfg!(windows) {
        name.to_lowercase()
    } else {
        name
    }
}

fn lock_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(".ralphy").join("locks")
}

fn lock_file_path(work_dir: &Path, name: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    lock_dir(work_dir).join(format!("{digest}.lock"))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Default owner identity for this process.
#[must_use]
pub fn process_owner_id() -> String {
    format!("{}-{}", std::process::id(), now_ms())
}

/// Per-file advisory lock manager.
pub struct LockManager {
    owner: String,
    timeout: Duration,
    locks: Mutex<HashMap<String, LockInfo>>,
    last_cleanup: Mutex<Instant>,
}

impl LockManager {
    /// Creates a manager owned by this process.
    #[must_use]
    pub fn new() -> Self {
        Self::with_owner(process_owner_id())
    }

    /// Creates a manager with an explicit owner identity.
    #[must_use]
    pub fn with_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Sets the lock lifetime.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns this manager's owner identity.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquires the lock for `path` with default retry settings.
    ///
    /// # Errors
    /// Returns an error only on unexpected IO failures; contention after
    /// all retries yields `Ok(false)`.
    pub fn acquire(&self, path: &Path, work_dir: &Path) -> Result<bool> {
        self.acquire_with(path, work_dir, 5, false)
    }

    /// Acquires the lock with explicit retry budget and re-entrancy.
    ///
    /// Stale on-disk locks (empty, unparseable, or expired) are unlinked
    /// and retried without consuming an attempt.
    pub fn acquire_with(
        &self,
        path: &Path,
        work_dir: &Path,
        max_retries: u32,
        reentrant: bool,
    ) -> Result<bool> {
        let name = normalize_lock_name(path, work_dir);
        let file_path = lock_file_path(work_dir, &name);
        std::fs::create_dir_all(lock_dir(work_dir))?;

        let mut attempt = 0u32;
        while attempt < max_retries {
            self.maybe_cleanup(work_dir)?;

            let now = now_ms();

            // Fast path through the in-memory table.
            {
                let mut locks = self.locks.lock().expect("lock poisoned");
                if let Some(info) = locks.get_mut(&name) {
                    if info.is_live(now) {
                        if info.owner == self.owner && reentrant {
                            info.timestamp = now;
                            info.refresh_count += 1;
                            let refreshed = info.clone();
                            drop(locks);
                            self.refresh_lock_file(&file_path, &refreshed)?;
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    locks.remove(&name);
                }
            }

            let info = LockInfo {
                timestamp: now,
                timeout: self.timeout.as_millis() as u64,
                owner: self.owner.clone(),
                refresh_count: 0,
            };

            if self.try_create_lock_file(&file_path, &info)? {
                self.record(name, info);
                return Ok(true);
            }

            // Exclusive create lost the race; inspect the holder.
            if Self::holder_is_stale(&file_path, now) {
                let _ = std::fs::remove_file(&file_path);
                continue; // does not consume an attempt
            }
            std::thread::sleep(Self::backoff_delay(attempt));
            attempt += 1;
        }

        Ok(false)
    }

    /// Releases the lock for `path` if this manager owns it.
    ///
    /// # Errors
    /// Returns an error on IO failure while unlinking.
    pub fn release(&self, path: &Path, work_dir: &Path) -> Result<()> {
        let name = normalize_lock_name(path, work_dir);
        let file_path = lock_file_path(work_dir, &name);

        let owned = {
            let mut locks = self.locks.lock().expect("lock poisoned");
            match locks.get(&name) {
                Some(info) if info.owner == self.owner => {
                    locks.remove(&name);
                    true
                }
                _ => false,
            }
        };

        // Only unlink a file we can prove is ours.
        let disk_owned = owned
            || Self::read_lock_file(&file_path)
                .map(|info| info.owner == self.owner)
                .unwrap_or(false);

        if disk_owned && file_path.exists() {
            std::fs::remove_file(&file_path)?;
        }
        Ok(())
    }

    /// Acquires every path in order; on any failure, locks taken by this
    /// call are rolled back and `Ok(false)` is returned.
    ///
    /// Deadlock avoidance across callers is the caller's job; sorting the
    /// input lexicographically before calling is the canonical strategy.
    pub fn acquire_many(&self, paths: &[PathBuf], work_dir: &Path) -> Result<bool> {
        let mut seen = std::collections::HashSet::new();
        let mut unique: Vec<&PathBuf> = Vec::new();
        for path in paths {
            if seen.insert(normalize_lock_name(path, work_dir)) {
                unique.push(path);
            }
        }

        let mut acquired: Vec<&PathBuf> = Vec::new();
        for path in unique {
            match self.acquire(path, work_dir) {
                Ok(true) => acquired.push(path),
                Ok(false) => {
                    for held in acquired {
                        let _ = self.release(held, work_dir);
                    }
                    return Ok(false);
                }
                Err(err) => {
                    for held in acquired {
                        let _ = self.release(held, work_dir);
                    }
                    return Err(err);
                }
            }
        }
        Ok(true)
    }

    /// Releases every path in the set, ignoring paths not held.
    pub fn release_many(&self, paths: &[PathBuf], work_dir: &Path) -> Result<()> {
        for path in paths {
            self.release(path, work_dir)?;
        }
        Ok(())
    }

    /// True if this manager currently holds a live lock on `path`.
    #[must_use]
    pub fn holds(&self, path: &Path, work_dir: &Path) -> bool {
        let name = normalize_lock_name(path, work_dir);
        let locks = self.locks.lock().expect("lock poisoned");
        locks
            .get(&name)
            .map(|info| info.owner == self.owner && info.is_live(now_ms()))
            .unwrap_or(false)
    }

    /// Drops every in-memory lock and unlinks the owned disk files.
    pub fn clear_all(&self, work_dir: &Path) -> Result<()> {
        let names: Vec<String> = {
            let mut locks = self.locks.lock().expect("lock poisoned");
            let names = locks
                .iter()
                .filter(|(_, info)| info.owner == self.owner)
                .map(|(name, _)| name.clone())
                .collect();
            locks.clear();
            names
        };
        for name in names {
            let file_path = lock_file_path(work_dir, &name);
            if file_path.exists() {
                std::fs::remove_file(&file_path)?;
            }
        }
        Ok(())
    }

    /// Evicts expired in-memory entries and unlinks expired disk files.
    pub fn cleanup_stale(&self, work_dir: &Path) -> Result<usize> {
        let now = now_ms();
        let mut evicted = 0usize;

        {
            let mut locks = self.locks.lock().expect("lock poisoned");
            let before = locks.len();
            locks.retain(|_, info| info.is_live(now));
            evicted += before - locks.len();
        }

        let dir = lock_dir(work_dir);
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                    continue;
                }
                if Self::holder_is_stale(&path, now) {
                    let _ = std::fs::remove_file(&path);
                    evicted += 1;
                }
            }
        }

        Ok(evicted)
    }

    fn maybe_cleanup(&self, work_dir: &Path) -> Result<()> {
        let due = {
            let mut last = self.last_cleanup.lock().expect("lock poisoned");
            if last.elapsed() >= CLEANUP_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.cleanup_stale(work_dir)?;
        }
        Ok(())
    }

    fn record(&self, name: String, info: LockInfo) {
        let mut locks = self.locks.lock().expect("lock poisoned");
        if locks.len() >= MAX_TRACKED_LOCKS {
            let now = now_ms();
            locks.retain(|_, i| i.is_live(now));
        }
        if locks.len() >= MAX_TRACKED_LOCKS {
            // Still over: shed the oldest foreign locks, keep our own.
            let mut foreign: Vec<(String, u64)> = locks
                .iter()
                .filter(|(_, i)| i.owner != self.owner)
                .map(|(n, i)| (n.clone(), i.timestamp))
                .collect();
            foreign.sort_by_key(|(_, ts)| *ts);
            let excess = locks.len() + 1 - MAX_TRACKED_LOCKS;
            for (name, _) in foreign.into_iter().take(excess) {
                locks.remove(&name);
            }
        }
        locks.insert(name, info);
    }

    /// Atomic create-or-fail; `Ok(false)` means another holder won.
    fn try_create_lock_file(&self, path: &Path, info: &LockInfo) -> Result<bool> {
        use std::io::Write;
        let payload = serde_json::to_string(info)?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                file.write_all(payload.as_bytes())?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    fn refresh_lock_file(&self, path: &Path, info: &LockInfo) -> Result<()> {
        let payload = serde_json::to_string(info)?;
        std::fs::write(path, payload)?;
        Ok(())
    }

    fn read_lock_file(path: &Path) -> Option<LockInfo> {
        let content = std::fs::read_to_string(path).ok()?;
        if content.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&content).ok()
    }

    fn holder_is_stale(path: &Path, now: u64) -> bool {
        match Self::read_lock_file(path) {
            Some(info) => !info.is_live(now),
            // Empty or unparseable counts as stale.
            None => path.exists(),
        }
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let base = 2u64.saturating_pow(attempt).saturating_mul(100);
        let jitter = rand::thread_rng().gen_range(0..50);
        Duration::from_millis(base.saturating_add(jitter).min(MAX_BACKOFF_MS))
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
