//! Content-addressed per-task file cache.
//!
//! Files are stored once per content hash under
//! `<workDir>/.ralphy-hashes/<taskId>/content/<hash>[.gz]`, with a
//! sibling `<hash>.json` metadata record and a per-task index mapping
//! logical relative paths to hashes. Identical bytes are written once;
//! sibling task directories are probed so a hash already materialized
//! by another task is copied instead of recompressed.

use super::{guard_unsafe_keys, write_atomic};
use crate::core::error::{CoreError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// Files at or above this size are gzipped (level 6).
const COMPRESSION_THRESHOLD: u64 = 1024;

/// Files above this size are hashed by streaming instead of one read.
const STREAM_HASH_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Bound on one gzip/gunzip pipeline, against corrupted streams.
const PIPELINE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which unreferenced task caches are collected.
pub const DEFAULT_GC_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Name of the per-task index file.
const INDEX_FILE: &str = ".ralphy-hashes-ref.json";

/// Metadata stored next to each content blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashMetadata {
    pub original_path: String,
    pub hash: String,
    pub size: u64,
    pub mtime: i64,
    pub compressed: bool,
    pub original_size: u64,
    pub stored_at: i64,
    pub task_id: String,
}

/// Index entry for one logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    pub hash: String,
    pub hash_path: String,
    pub metadata_path: String,
}

/// The per-task index document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHashIndex {
    pub task_id: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileIndexEntry>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Aggregate statistics over one task's cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_files: usize,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    /// `1 − uniqueHashes / totalFiles`; zero for an empty store.
    pub dedup_ratio: f64,
}

/// Content-addressed cache for one task.
pub struct HashStore {
    work_dir: PathBuf,
    task_dir: PathBuf,
    task_id: String,
    index: Mutex<TaskHashIndex>,
}

impl HashStore {
    /// Opens (or creates) the cache for a task.
    ///
    /// # Errors
    /// Propagates IO failures and rejects polluted index documents.
    pub fn open(work_dir: &Path, task_id: impl Into<String>) -> Result<Self> {
        let task_id = task_id.into();
        let task_dir = store_root(work_dir).join(&task_id);
        std::fs::create_dir_all(task_dir.join("content"))?;

        let index_path = task_dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            guard_unsafe_keys(&content)?;
            serde_json::from_str(&content)?
        } else {
            let now = chrono::Utc::now().timestamp_millis();
            TaskHashIndex {
                task_id: task_id.clone(),
                files: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            }
        };

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            task_dir,
            task_id,
            index: Mutex::new(index),
        })
    }

    /// The task this store belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Adds a file snapshot, deduplicating by content.
    ///
    /// # Errors
    /// Propagates IO failures; times out on a stuck gzip pipeline.
    pub fn add_file(&self, path: &Path) -> Result<HashMetadata> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        let rel = self.relative_key(path);

        let file_meta = std::fs::metadata(&absolute)?;
        let size = file_meta.len();
        let mtime = file_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let (hash, content) = if size > STREAM_HASH_THRESHOLD {
            (stream_hash(&absolute)?, None)
        } else {
            let bytes = std::fs::read(&absolute)?;
            (digest_hex(&bytes), Some(bytes))
        };

        let compressed = size >= COMPRESSION_THRESHOLD;
        let blob_name = if compressed {
            format!("{hash}.gz")
        } else {
            hash.clone()
        };
        let blob_path = self.task_dir.join("content").join(&blob_name);
        let metadata_path = self.task_dir.join("content").join(format!("{hash}.json"));

        if !blob_path.exists() {
            if let Some(sibling) = self.probe_sibling_tasks(&blob_name) {
                std::fs::copy(sibling, &blob_path)?;
            } else {
                let bytes = match content {
                    Some(bytes) => bytes,
                    None => std::fs::read(&absolute)?,
                };
                if compressed {
                    let packed = gzip_bounded(bytes)?;
                    std::fs::write(&blob_path, packed)?;
                } else {
                    std::fs::write(&blob_path, bytes)?;
                }
            }
        }

        let metadata = HashMetadata {
            original_path: rel.clone(),
            hash: hash.clone(),
            size: std::fs::metadata(&blob_path)?.len(),
            mtime,
            compressed,
            original_size: size,
            stored_at: chrono::Utc::now().timestamp_millis(),
            task_id: self.task_id.clone(),
        };
        std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

        {
            let mut index = self.index.lock().expect("lock poisoned");
            index.files.insert(
                rel,
                FileIndexEntry {
                    hash,
                    hash_path: blob_path.to_string_lossy().into_owned(),
                    metadata_path: metadata_path.to_string_lossy().into_owned(),
                },
            );
            index.updated_at = chrono::Utc::now().timestamp_millis();
        }
        self.persist_index()?;

        Ok(metadata)
    }

    /// True if the logical path is indexed.
    #[must_use]
    pub fn has(&self, path: &Path) -> bool {
        let rel = self.relative_key(path);
        let index = self.index.lock().expect("lock poisoned");
        index.files.contains_key(&rel)
    }

    /// The stored hash for a logical path.
    #[must_use]
    pub fn get_hash(&self, path: &Path) -> Option<String> {
        let rel = self.relative_key(path);
        let index = self.index.lock().expect("lock poisoned");
        index.files.get(&rel).map(|e| e.hash.clone())
    }

    /// Recomputes the on-disk hash and compares with the stored one.
    /// Unknown paths count as changed.
    ///
    /// # Errors
    /// Propagates IO failures from re-reading the file.
    pub fn has_changed(&self, path: &Path) -> Result<bool> {
        let Some(stored) = self.get_hash(path) else {
            return Ok(true);
        };
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        let size = std::fs::metadata(&absolute)?.len();
        let current = if size > STREAM_HASH_THRESHOLD {
            stream_hash(&absolute)?
        } else {
            digest_hex(&std::fs::read(&absolute)?)
        };
        Ok(current != stored)
    }

    /// Loads content and metadata for a logical path.
    ///
    /// # Errors
    /// Returns a validation error for unknown paths and propagates IO
    /// and decompression failures.
    pub fn get(&self, path: &Path) -> Result<(Vec<u8>, HashMetadata)> {
        let rel = self.relative_key(path);
        let entry = {
            let index = self.index.lock().expect("lock poisoned");
            index.files.get(&rel).cloned()
        }
        .ok_or_else(|| CoreError::validation(format!("path not in hash store: {rel}")))?;

        let metadata_raw = std::fs::read_to_string(&entry.metadata_path)?;
        guard_unsafe_keys(&metadata_raw)?;
        let metadata: HashMetadata = serde_json::from_str(&metadata_raw)?;

        let blob = std::fs::read(&entry.hash_path)?;
        let content = if metadata.compressed {
            gunzip_bounded(blob)?
        } else {
            blob
        };
        Ok((content, metadata))
    }

    /// Aggregate statistics for this task's cache.
    ///
    /// # Errors
    /// Propagates IO failures from reading metadata records.
    pub fn stats(&self) -> Result<StoreStats> {
        let entries: Vec<FileIndexEntry> = {
            let index = self.index.lock().expect("lock poisoned");
            index.files.values().cloned().collect()
        };

        let mut unique = std::collections::HashSet::new();
        let mut total_original = 0u64;
        let mut total_compressed = 0u64;
        for entry in &entries {
            unique.insert(entry.hash.clone());
            if let Ok(raw) = std::fs::read_to_string(&entry.metadata_path) {
                if let Ok(metadata) = serde_json::from_str::<HashMetadata>(&raw) {
                    total_original += metadata.original_size;
                    total_compressed += metadata.size;
                }
            }
        }

        let total_files = entries.len();
        let dedup_ratio = if total_files == 0 {
            0.0
        } else {
            1.0 - (unique.len() as f64 / total_files as f64)
        };

        Ok(StoreStats {
            total_files,
            total_original_size: total_original,
            total_compressed_size: total_compressed,
            dedup_ratio,
        })
    }

    /// Removes this task's entire cache directory.
    ///
    /// # Errors
    /// Propagates IO failures.
    pub fn cleanup(&self) -> Result<()> {
        if self.task_dir.exists() {
            std::fs::remove_dir_all(&self.task_dir)?;
        }
        Ok(())
    }

    /// Walks every task cache under `work_dir` and removes those whose
    /// index has not been touched within `max_age`. Returns the number
    /// of task directories removed.
    ///
    /// # Errors
    /// Propagates IO failures from the directory walk.
    pub fn gc(work_dir: &Path, max_age: Duration) -> Result<usize> {
        let root = store_root(work_dir);
        if !root.exists() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now - max_age.as_millis() as i64;
        let mut removed = 0usize;

        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let index_path = entry.path().join(INDEX_FILE);
            let updated_at = std::fs::read_to_string(&index_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<TaskHashIndex>(&raw).ok())
                .map(|index| index.updated_at);

            let stale = match updated_at {
                Some(ts) => ts < cutoff,
                // No readable index: fall back to directory mtime.
                None => entry
                    .metadata()?
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| (d.as_millis() as i64) < cutoff)
                    .unwrap_or(false),
            };

            if stale {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn relative_key(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.work_dir).unwrap_or(path);
        rel.to_string_lossy().replace('\\', "/")
    }

    fn probe_sibling_tasks(&self, blob_name: &str) -> Option<PathBuf> {
        let root = store_root(&self.work_dir);
        let entries = std::fs::read_dir(root).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path == self.task_dir {
                continue;
            }
            let candidate = path.join("content").join(blob_name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn persist_index(&self) -> Result<()> {
        let content = {
            let index = self.index.lock().expect("lock poisoned");
            serde_json::to_string_pretty(&*index)?
        };
        write_atomic(&self.task_dir.join(INDEX_FILE), &content)?;
        Ok(())
    }
}

fn store_root(work_dir: &Path) -> PathBuf {
    work_dir.join(".ralphy-hashes")
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn stream_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Gzip (level 6) bounded by the pipeline timeout.
pub(crate) fn gzip_bounded(bytes: Vec<u8>) -> Result<Vec<u8>> {
    run_bounded("gzip", move || {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
        encoder.write_all(&bytes)?;
        Ok(encoder.finish()?)
    })
}

/// Gunzip bounded by the pipeline timeout.
pub(crate) fn gunzip_bounded(bytes: Vec<u8>) -> Result<Vec<u8>> {
    run_bounded("gunzip", move || {
        let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    })
}

fn run_bounded<F>(label: &str, work: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> Result<Vec<u8>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(work());
    });
    match rx.recv_timeout(PIPELINE_TIMEOUT) {
        Ok(result) => result,
        Err(_) => Err(CoreError::timeout(format!(
            "{label} pipeline exceeded {PIPELINE_TIMEOUT:?}"
        ))),
    }
}
