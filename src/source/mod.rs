//! Task source files: CSV, YAML, JSON, and Markdown checklists.
//!
//! Each format maps to the shared [`Task`] model and has a writer that
//! round-trips the fields the format can represent.

pub mod csv;
pub mod json;
pub mod markdown;
pub mod yaml;

pub(crate) use csv::{escape_if_needed as csv_escape, split_row as csv_split_row};

use crate::core::error::{CoreError, Result};
use crate::core::task::Task;
use std::path::{Path, PathBuf};

/// Supported task source formats, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Csv,
    Yaml,
    Json,
    Markdown,
}

impl SourceType {
    /// Detects the format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("csv") => Some(Self::Csv),
            Some("yaml" | "yml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            Some("md" | "markdown") => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Canonical extension for this format.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }

    /// Stable identifier used in state-file keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses source content in the given format.
///
/// # Errors
/// Returns a validation error when the content does not parse.
pub fn parse(source_type: SourceType, content: &str) -> Result<Vec<Task>> {
    match source_type {
        SourceType::Csv => csv::parse_tasks(content),
        SourceType::Yaml => yaml::parse_tasks(content),
        SourceType::Json => json::parse_tasks(content),
        SourceType::Markdown => Ok(markdown::parse_tasks(content)),
    }
}

/// Serializes tasks in the given format.
///
/// # Errors
/// Returns an error if serialization fails (YAML/JSON only).
pub fn write(source_type: SourceType, tasks: &[Task]) -> Result<String> {
    match source_type {
        SourceType::Csv => Ok(csv::write_tasks(tasks)),
        SourceType::Yaml => yaml::write_tasks(tasks),
        SourceType::Json => json::write_tasks(tasks),
        SourceType::Markdown => Ok(markdown::write_tasks(tasks)),
    }
}

/// A task source file on disk.
#[derive(Debug, Clone)]
pub struct TaskSource {
    path: PathBuf,
    source_type: SourceType,
}

impl TaskSource {
    /// Opens a source file, detecting its format from the extension.
    ///
    /// # Errors
    /// Returns a validation error for unknown extensions.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let source_type = SourceType::from_path(&path).ok_or_else(|| {
            CoreError::validation(format!(
                "unsupported task source extension: {}",
                path.display()
            ))
        })?;
        Ok(Self { path, source_type })
    }

    /// The source file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The detected format.
    #[must_use]
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// Loads and parses all tasks.
    ///
    /// # Errors
    /// Propagates IO and parse failures.
    pub fn load(&self) -> Result<Vec<Task>> {
        let content = std::fs::read_to_string(&self.path)?;
        parse(self.source_type, &content)
    }

    /// Writes tasks back in the source format.
    ///
    /// # Errors
    /// Propagates IO and serialization failures.
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        let content = write(self.source_type, tasks)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Marks one task completed in place.
    ///
    /// Markdown sources get their checkbox flipped without disturbing
    /// surrounding lines; other formats are re-serialized. The source
    /// file is held under an advisory lock for the read-modify-write,
    /// since several logical agents may finish tasks concurrently.
    ///
    /// # Errors
    /// Returns a validation error if the id is unknown.
    pub fn mark_complete(&self, id: &str) -> Result<()> {
        use fs2::FileExt;
        use std::io::{Read, Seek, Write};

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut content = String::new();
        {
            let mut reader = std::io::BufReader::new(&file);
            reader.read_to_string(&mut content)?;
        }

        let updated = if self.source_type == SourceType::Markdown {
            markdown::mark_complete(&content, id)
        } else {
            parse(self.source_type, &content).and_then(|mut tasks| {
                let task = tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| CoreError::validation(format!("unknown task id: {id}")))?;
                task.completed = true;
                write(self.source_type, &tasks)
            })
        };

        let updated = match updated {
            Ok(updated) => updated,
            Err(err) => {
                let _ = file.unlock();
                return Err(err);
            }
        };

        file.rewind()?;
        file.set_len(0)?;
        file.write_all(updated.as_bytes())?;
        let _ = file.flush();
        let _ = file.unlock();
        Ok(())
    }
}
