//! Planning cache keyed by repository fingerprint.
//!
//! The fingerprint summarizes the manifest files that define a
//! repository's shape plus the sorted set of top-level directory names.
//! Planned-file lists are only reused while the fingerprint is
//! unchanged, so edits to any manifest or top-level restructuring
//! invalidate every cached plan for that working directory.

use super::hash_store::{gunzip_bounded, gzip_bounded};
use super::guard_unsafe_keys;
use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Manifest files folded into the fingerprint.
const KEY_FILES: &[&str] = &[
    "package.json",
    "pyproject.toml",
    "Cargo.toml",
    "go.mod",
    "requirements.txt",
    "pnpm-lock.yaml",
    "package-lock.json",
    "yarn.lock",
];

/// How long a computed fingerprint is trusted in process.
const FINGERPRINT_TTL: Duration = Duration::from_secs(60);

/// Persisted cache file, gzipped JSON.
const CACHE_FILE: &str = "planning-cache.json.gz";

/// Legacy uncompressed cache file, accepted on read, deleted on save.
const LEGACY_CACHE_FILE: &str = "planning-cache.json";

/// Observed state of one key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub mtime: i64,
    pub size: u64,
    pub hash: String,
}

/// Compact summary of repository shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFingerprint {
    pub file_states: BTreeMap<String, FileState>,
    pub dir_hash: String,
    pub timestamp: i64,
}

impl RepoFingerprint {
    /// Whether two fingerprints describe the same repository shape.
    /// Timestamps are irrelevant to the comparison.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        if self.dir_hash != other.dir_hash {
            return false;
        }
        if self.file_states.len() != other.file_states.len() {
            return false;
        }
        self.file_states.iter().all(|(name, state)| {
            other
                .file_states
                .get(name)
                .map(|o| o.hash == state.hash)
                .unwrap_or(false)
        })
    }
}

/// One cached plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningCacheEntry {
    pub files: Vec<String>,
    pub timestamp: i64,
    pub repo_fingerprint: RepoFingerprint,
}

/// Cache key: `sanitize(taskId:title)`.
#[must_use]
pub fn cache_key(task_id: &str, title: &str) -> String {
    sanitize(&format!("{task_id}:{title}"))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Per-workDir planning cache with fingerprint invalidation.
pub struct PlanningCache {
    work_dir: PathBuf,
    entries: Mutex<BTreeMap<String, PlanningCacheEntry>>,
    fingerprint: Mutex<Option<(Instant, RepoFingerprint)>>,
    file_memo: Mutex<HashMap<String, FileState>>,
}

impl PlanningCache {
    /// Opens the cache for a working directory, loading the gzipped
    /// store (or its legacy uncompressed sibling).
    ///
    /// # Errors
    /// Propagates IO and parse failures; corrupt caches are rejected
    /// rather than silently emptied.
    pub fn open(work_dir: &Path) -> Result<Self> {
        let dir = work_dir.join(".ralphy");
        let gz_path = dir.join(CACHE_FILE);
        let legacy_path = dir.join(LEGACY_CACHE_FILE);

        let entries = if gz_path.exists() {
            let packed = std::fs::read(&gz_path)?;
            let raw = gunzip_bounded(packed)?;
            let content = String::from_utf8_lossy(&raw).into_owned();
            guard_unsafe_keys(&content)?;
            serde_json::from_str(&content)?
        } else if legacy_path.exists() {
            let content = std::fs::read_to_string(&legacy_path)?;
            guard_unsafe_keys(&content)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            entries: Mutex::new(entries),
            fingerprint: Mutex::new(None),
            file_memo: Mutex::new(HashMap::new()),
        })
    }

    /// Computes (or reuses, within the TTL) the repository fingerprint.
    ///
    /// # Errors
    /// Propagates IO failures reading manifests or the top-level listing.
    pub fn fingerprint(&self) -> Result<RepoFingerprint> {
        {
            let cached = self.fingerprint.lock().expect("lock poisoned");
            if let Some((at, ref fp)) = *cached {
                if at.elapsed() < FINGERPRINT_TTL {
                    return Ok(fp.clone());
                }
            }
        }

        let fp = self.compute_fingerprint()?;
        let mut cached = self.fingerprint.lock().expect("lock poisoned");
        *cached = Some((Instant::now(), fp.clone()));
        Ok(fp)
    }

    /// Drops the in-process fingerprint memo so the next call recomputes.
    pub fn invalidate_fingerprint(&self) {
        let mut cached = self.fingerprint.lock().expect("lock poisoned");
        *cached = None;
        self.file_memo.lock().expect("lock poisoned").clear();
    }

    /// Looks up a cached plan, honoring fingerprint freshness.
    ///
    /// # Errors
    /// Propagates fingerprint computation failures.
    pub fn get(&self, task_id: &str, title: &str) -> Result<Option<Vec<String>>> {
        let key = cache_key(task_id, title);
        let entry = {
            let entries = self.entries.lock().expect("lock poisoned");
            entries.get(&key).cloned()
        };
        let Some(entry) = entry else {
            return Ok(None);
        };

        let current = self.fingerprint()?;
        if entry.repo_fingerprint.matches(&current) {
            Ok(Some(entry.files))
        } else {
            Ok(None)
        }
    }

    /// Stores a plan under the current fingerprint and persists.
    ///
    /// # Errors
    /// Propagates fingerprint, serialization, and IO failures.
    pub fn put(&self, task_id: &str, title: &str, files: Vec<String>) -> Result<()> {
        let fingerprint = self.fingerprint()?;
        let key = cache_key(task_id, title);
        let entry = PlanningCacheEntry {
            files: files
                .into_iter()
                .map(|f| f.replace('\\', "/"))
                .collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            repo_fingerprint: fingerprint,
        };

        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            entries.insert(key, entry);
        }
        self.save()
    }

    /// Number of stored entries, fresh or stale.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// True if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self) -> Result<()> {
        let dir = self.work_dir.join(".ralphy");
        std::fs::create_dir_all(&dir)?;

        let content = {
            let entries = self.entries.lock().expect("lock poisoned");
            serde_json::to_string(&*entries)?
        };
        let packed = gzip_bounded(content.into_bytes())?;

        let path = dir.join(CACHE_FILE);
        let tmp = dir.join(format!("{CACHE_FILE}.tmp"));
        std::fs::write(&tmp, packed)?;
        std::fs::rename(&tmp, &path)?;

        // The legacy uncompressed file is superseded once we save.
        let legacy = dir.join(LEGACY_CACHE_FILE);
        if legacy.exists() {
            let _ = std::fs::remove_file(legacy);
        }
        Ok(())
    }

    fn compute_fingerprint(&self) -> Result<RepoFingerprint> {
        let mut file_states = BTreeMap::new();
        let mut memo = self.file_memo.lock().expect("lock poisoned");

        for name in KEY_FILES {
            let path = self.work_dir.join(name);
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let size = meta.len();

            let state = match memo.get(*name) {
                Some(cached) if cached.mtime == mtime && cached.size == size => cached.clone(),
                _ => {
                    let bytes = std::fs::read(&path)?;
                    let state = FileState {
                        mtime,
                        size,
                        hash: digest_hex(&bytes),
                    };
                    memo.insert((*name).to_string(), state.clone());
                    state
                }
            };
            file_states.insert((*name).to_string(), state);
        }

        let mut dirs: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&self.work_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        dirs.sort();

        let mut pairs: Vec<String> = file_states
            .iter()
            .map(|(name, state)| format!("{name}:{}", state.hash))
            .collect();
        pairs.extend(dirs.iter().map(|d| format!("dir:{d}")));
        pairs.sort();

        Ok(RepoFingerprint {
            file_states,
            dir_hash: digest_hex(pairs.join("\n").as_bytes()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded_dir() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        dir
    }

    #[test]
    fn sanitizes_keys() {
        assert_eq!(cache_key("1", "Add login"), "1_Add_login");
        assert_eq!(cache_key("a/b", "c:d"), "a_b_c_d");
    }

    #[test]
    fn put_then_get() {
        let dir = seeded_dir();
        let cache = PlanningCache::open(dir.path()).unwrap();

        cache
            .put("1", "Add login", vec!["src/auth.rs".into(), "src\\lib.rs".into()])
            .unwrap();

        let files = cache.get("1", "Add login").unwrap().unwrap();
        assert_eq!(files, vec!["src/auth.rs", "src/lib.rs"]);
    }

    #[test]
    fn manifest_edit_invalidates() {
        let dir = seeded_dir();
        let cache = PlanningCache::open(dir.path()).unwrap();
        cache.put("1", "t", vec!["src/a.rs".into()]).unwrap();

        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"renamed\"\n",
        )
        .unwrap();
        cache.invalidate_fingerprint();

        assert!(cache.get("1", "t").unwrap().is_none());
    }

    #[test]
    fn new_top_level_dir_invalidates() {
        let dir = seeded_dir();
        let cache = PlanningCache::open(dir.path()).unwrap();
        cache.put("1", "t", vec!["src/a.rs".into()]).unwrap();

        std::fs::create_dir(dir.path().join("benches")).unwrap();
        cache.invalidate_fingerprint();

        assert!(cache.get("1", "t").unwrap().is_none());
    }

    #[test]
    fn persists_gzipped_and_reloads() {
        let dir = seeded_dir();
        {
            let cache = PlanningCache::open(dir.path()).unwrap();
            cache.put("1", "t", vec!["src/a.rs".into()]).unwrap();
        }

        assert!(dir.path().join(".ralphy").join(CACHE_FILE).exists());

        let cache = PlanningCache::open(dir.path()).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("1", "t").unwrap().is_some());
    }

    #[test]
    fn legacy_uncompressed_cache_is_migrated() {
        let dir = seeded_dir();
        let ralphy = dir.path().join(".ralphy");
        std::fs::create_dir_all(&ralphy).unwrap();

        // Seed a legacy entry whose fingerprint cannot match.
        let legacy = r#"{"old_t":{"files":["a.rs"],"timestamp":0,"repoFingerprint":{"fileStates":{},"dirHash":"stale","timestamp":0}}}"#;
        std::fs::write(ralphy.join(LEGACY_CACHE_FILE), legacy).unwrap();

        let cache = PlanningCache::open(dir.path()).unwrap();
        assert_eq!(cache.len(), 1);

        cache.put("1", "t", vec!["src/a.rs".into()]).unwrap();
        assert!(!ralphy.join(LEGACY_CACHE_FILE).exists());
        assert!(ralphy.join(CACHE_FILE).exists());
    }

    #[test]
    fn fingerprint_is_memoized_within_ttl() {
        let dir = seeded_dir();
        let cache = PlanningCache::open(dir.path()).unwrap();

        let first = cache.fingerprint().unwrap();
        // A change without invalidation is not observed inside the TTL.
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"y\"\n").unwrap();
        let second = cache.fingerprint().unwrap();
        assert!(first.matches(&second));

        cache.invalidate_fingerprint();
        let third = cache.fingerprint().unwrap();
        assert!(!first.matches(&third));
    }
}
