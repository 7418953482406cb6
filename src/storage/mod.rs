//! Durable state: task state machine, content-addressed file cache,
//! and the planning cache.

pub mod hash_store;
pub mod planning_cache;
pub mod state;

use crate::core::error::{CoreError, ErrorCode};
use std::path::Path;

/// Errors from the durable stores.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("persisted document contains forbidden key {0:?}")]
    UnsafeKey(String),
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnsafeKey(key) => {
                Self::new(ErrorCode::Validation, format!(
                    "persisted document contains forbidden key {key:?}"
                ))
            }
            other => Self::new(ErrorCode::Unknown, other.to_string()),
        }
    }
}

/// Keys that are never honored in persisted documents. Guards the
/// dynamically-keyed maps against object-prototype corruption when the
/// same files are shared with untyped runtimes.
const UNSAFE_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Rejects persisted content carrying prototype-polluting keys.
///
/// # Errors
/// Returns [`StorageError::UnsafeKey`] naming the offending key.
pub fn guard_unsafe_keys(content: &str) -> Result<(), StorageError> {
    for key in UNSAFE_KEYS {
        let quoted = format!("\"{key}\"");
        if content.contains(&quoted) || content.contains(&format!("{key}:")) {
            return Err(StorageError::UnsafeKey((*key).to_string()));
        }
    }
    Ok(())
}

/// Atomically replaces `path` by writing a sibling temp file and
/// renaming it into place.
///
/// # Errors
/// Propagates IO failures from write or rename.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
