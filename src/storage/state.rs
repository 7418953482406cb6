//! Durable task lifecycle state.
//!
//! The state manager is the source of truth for where each task is in
//! its lifecycle. The document is persisted atomically next to the
//! working directory in the same family of formats as the task source,
//! and any entry found `running` on load is treated as a crash victim
//! and downgraded to `pending`.

use super::{guard_unsafe_keys, write_atomic};
use crate::core::error::{CoreError, Result};
use crate::core::task::Task;
use crate::source::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Schema version of the state document.
const STATE_VERSION: u32 = 1;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Deferred,
    Skipped,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Deferred => write!(f, "deferred"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "deferred" => Ok(Self::Deferred),
            "skipped" => Ok(Self::Skipped),
            other => Err(CoreError::validation(format!("unknown task state: {other}"))),
        }
    }
}

/// Where a task was (or will be) executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// One durable state entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStateEntry {
    pub id: String,
    pub title: String,
    pub state: TaskState,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_context: Option<ExecutionContext>,
}

impl TaskStateEntry {
    fn fresh(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            state: if task.completed {
                TaskState::Completed
            } else {
                TaskState::Pending
            },
            attempt_count: 0,
            last_attempt_time: None,
            error_history: Vec::new(),
            execution_context: None,
        }
    }
}

/// The persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDocument {
    version: u32,
    last_updated: String,
    tasks: BTreeMap<String, TaskStateEntry>,
}

/// Durable per-task state machine.
pub struct TaskStateManager {
    source_type: SourceType,
    source_path: String,
    state_path: PathBuf,
    entries: Mutex<BTreeMap<String, TaskStateEntry>>,
}

impl TaskStateManager {
    /// Creates a manager for one `(workDir, source)` pair. The state
    /// file lives at `<workDir>/.ralphy/task-state.<ext>`.
    #[must_use]
    pub fn new(work_dir: &Path, source_type: SourceType, source_path: impl Into<String>) -> Self {
        let state_path = work_dir
            .join(".ralphy")
            .join(format!("task-state.{}", source_type.extension()));
        Self {
            source_type,
            source_path: source_path.into(),
            state_path,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Key for a task id: `<sourceType>:<sourcePath>:<id>`.
    #[must_use]
    pub fn key_for(&self, id: &str) -> String {
        format!("{}:{}:{}", self.source_type.as_str(), self.source_path, id)
    }

    /// Merges the task list from the source with the stored document.
    ///
    /// Stored entries with no matching source task are dropped; new
    /// tasks enter as `pending`; entries caught `running` (a previous
    /// process crashed mid-task) restart as `pending` with a zeroed
    /// attempt count.
    ///
    /// # Errors
    /// Propagates IO and parse failures from the stored document.
    pub fn initialize(&self, tasks: &[Task]) -> Result<()> {
        let stored = self.load_document()?;

        let mut merged = BTreeMap::new();
        for task in tasks {
            let key = self.key_for(&task.id);
            let entry = match stored.get(&key) {
                Some(existing) => {
                    let mut entry = existing.clone();
                    if entry.state == TaskState::Running {
                        entry.state = TaskState::Pending;
                        entry.attempt_count = 0;
                    }
                    entry.title = task.title.clone();
                    entry
                }
                None => TaskStateEntry::fresh(task),
            };
            merged.insert(key, entry);
        }

        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            *entries = merged;
        }
        self.persist()
    }

    /// Loads the stored document without merging or persisting. Used by
    /// read-only consumers (status reporting) so a live run's file is
    /// left untouched.
    ///
    /// # Errors
    /// Propagates IO and parse failures.
    pub fn load(&self) -> Result<()> {
        let stored = self.load_document()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        *entries = stored;
        Ok(())
    }

    /// Atomically claims a `pending` task for execution.
    ///
    /// The only legitimate way to enter `running`. Returns true iff the
    /// entry was pending; the claim bumps the attempt count and stamps
    /// the attempt time.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn claim_task_for_execution(&self, id: &str) -> Result<bool> {
        let key = self.key_for(id);
        let claimed = {
            let mut entries = self.entries.lock().expect("lock poisoned");
            match entries.get_mut(&key) {
                Some(entry) if entry.state == TaskState::Pending => {
                    entry.state = TaskState::Running;
                    entry.attempt_count += 1;
                    entry.last_attempt_time = Some(chrono::Utc::now().timestamp_millis());
                    true
                }
                _ => false,
            }
        };
        if claimed {
            self.persist()?;
        }
        Ok(claimed)
    }

    /// Unrestricted state transition, used by the executor to report
    /// outcomes. A supplied error is appended to the entry's history.
    ///
    /// # Errors
    /// Returns a validation error for unknown ids.
    pub fn transition_state(
        &self,
        id: &str,
        state: TaskState,
        error: Option<&str>,
    ) -> Result<()> {
        let key = self.key_for(id);
        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let entry = entries
                .get_mut(&key)
                .ok_or_else(|| CoreError::validation(format!("unknown task id: {id}")))?;
            entry.state = state;
            if let Some(error) = error {
                entry.error_history.push(error.to_string());
            }
        }
        self.persist()
    }

    /// Returns a failed or skipped task to `pending` with a zeroed
    /// attempt count.
    ///
    /// # Errors
    /// Returns a validation error for unknown ids or states that cannot
    /// be reset.
    pub fn reset_task(&self, id: &str) -> Result<()> {
        let key = self.key_for(id);
        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let entry = entries
                .get_mut(&key)
                .ok_or_else(|| CoreError::validation(format!("unknown task id: {id}")))?;
            if !matches!(entry.state, TaskState::Failed | TaskState::Skipped) {
                return Err(CoreError::validation(format!(
                    "cannot reset task in state {}",
                    entry.state
                )));
            }
            entry.state = TaskState::Pending;
            entry.attempt_count = 0;
        }
        self.persist()
    }

    /// Attaches execution context (branch, worktree, sandbox) to a task.
    ///
    /// # Errors
    /// Returns a validation error for unknown ids.
    pub fn set_execution_context(&self, id: &str, context: ExecutionContext) -> Result<()> {
        let key = self.key_for(id);
        {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let entry = entries
                .get_mut(&key)
                .ok_or_else(|| CoreError::validation(format!("unknown task id: {id}")))?;
            entry.execution_context = Some(context);
        }
        self.persist()
    }

    /// Looks up one entry by task id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<TaskStateEntry> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.get(&self.key_for(id)).cloned()
    }

    /// All entries in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<TaskStateEntry> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.values().cloned().collect()
    }

    /// Ids currently in the given state.
    #[must_use]
    pub fn ids_in_state(&self, state: TaskState) -> Vec<String> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.id.clone())
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let document = {
            let entries = self.entries.lock().expect("lock poisoned");
            StateDocument {
                version: STATE_VERSION,
                last_updated: chrono::Utc::now().to_rfc3339(),
                tasks: entries.clone(),
            }
        };

        let content = match self.source_type {
            SourceType::Json => serde_json::to_string_pretty(&document)?,
            SourceType::Yaml => serde_yaml::to_string(&document)?,
            SourceType::Csv => render_csv(&document),
            SourceType::Markdown => render_markdown(&document)?,
        };
        write_atomic(&self.state_path, &content)?;
        Ok(())
    }

    fn load_document(&self) -> Result<BTreeMap<String, TaskStateEntry>> {
        if !self.state_path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.state_path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        guard_unsafe_keys(&content)?;

        let document = match self.source_type {
            SourceType::Json => serde_json::from_str::<StateDocument>(&content)?,
            SourceType::Yaml => serde_yaml::from_str::<StateDocument>(&content)?,
            SourceType::Csv => parse_csv(&content)?,
            SourceType::Markdown => parse_markdown(&content)?,
        };
        Ok(document.tasks)
    }
}

/// CSV rendition: a `version,last_updated` preamble followed by one row
/// per entry, with the error history JSON-encoded in its cell.
fn render_csv(document: &StateDocument) -> String {
    use crate::source::csv_escape;

    let mut out = String::from("version,last_updated\n");
    out.push_str(&format!(
        "{},{}\n",
        document.version,
        csv_escape(&document.last_updated)
    ));
    out.push_str("key,id,title,state,attempt_count,last_attempt_time,error_history\n");
    for (key, entry) in &document.tasks {
        let errors = serde_json::to_string(&entry.error_history).unwrap_or_else(|_| "[]".into());
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_escape(key),
            csv_escape(&entry.id),
            csv_escape(&entry.title),
            entry.state,
            entry.attempt_count,
            entry
                .last_attempt_time
                .map(|t| t.to_string())
                .unwrap_or_default(),
            csv_escape(&errors),
        ));
    }
    out
}

fn parse_csv(content: &str) -> Result<StateDocument> {
    use crate::source::csv_split_row;

    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let _preamble_header = lines.next();
    let preamble = lines
        .next()
        .ok_or_else(|| CoreError::validation("truncated CSV state file"))?;
    let preamble_fields = csv_split_row(preamble)?;
    let version = preamble_fields
        .first()
        .and_then(|v| v.parse().ok())
        .unwrap_or(STATE_VERSION);
    let last_updated = preamble_fields.get(1).cloned().unwrap_or_default();

    let _task_header = lines.next();
    let mut tasks = BTreeMap::new();
    for line in lines {
        let fields = csv_split_row(line)?;
        let get = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");
        let key = get(0).to_string();
        if key.is_empty() {
            continue;
        }
        let entry = TaskStateEntry {
            id: get(1).to_string(),
            title: get(2).to_string(),
            state: get(3).parse()?,
            attempt_count: get(4).parse().unwrap_or(0),
            last_attempt_time: get(5).parse().ok(),
            error_history: serde_json::from_str(get(6)).unwrap_or_default(),
            execution_context: None,
        };
        tasks.insert(key, entry);
    }

    Ok(StateDocument {
        version,
        last_updated,
        tasks,
    })
}

/// Markdown rendition: the YAML document inside a fenced block, so the
/// state file stays readable next to a markdown task list.
fn render_markdown(document: &StateDocument) -> Result<String> {
    let yaml = serde_yaml::to_string(document)?;
    Ok(format!("# Task State\n\n```yaml\n{yaml}```\n"))
}

fn parse_markdown(content: &str) -> Result<StateDocument> {
    let start = content
        .find("```yaml\n")
        .ok_or_else(|| CoreError::validation("markdown state file is missing its yaml block"))?;
    let body = &content[start + "```yaml\n".len()..];
    let end = body
        .find("```")
        .ok_or_else(|| CoreError::validation("unterminated yaml block in state file"))?;
    Ok(serde_yaml::from_str(&body[..end])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tasks() -> Vec<Task> {
        vec![Task::new("1", "Alpha"), Task::new("2", "Beta")]
    }

    fn manager(dir: &Path, source_type: SourceType) -> TaskStateManager {
        TaskStateManager::new(dir, source_type, "tasks.src")
    }

    #[test]
    fn initialize_creates_pending_entries() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();

        let entry = m.get("1").unwrap();
        assert_eq!(entry.state, TaskState::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert!(m.state_path().exists());
    }

    #[test]
    fn completed_source_tasks_enter_completed() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&[Task::new("1", "done already").completed(true)])
            .unwrap();
        assert_eq!(m.get("1").unwrap().state, TaskState::Completed);
    }

    #[test]
    fn claim_is_single_winner() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();

        assert!(m.claim_task_for_execution("1").unwrap());
        assert!(!m.claim_task_for_execution("1").unwrap());

        let entry = m.get("1").unwrap();
        assert_eq!(entry.state, TaskState::Running);
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_attempt_time.is_some());
    }

    #[test]
    fn transition_appends_error_history() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();

        m.claim_task_for_execution("1").unwrap();
        m.transition_state("1", TaskState::Failed, Some("engine exploded"))
            .unwrap();

        let entry = m.get("1").unwrap();
        assert_eq!(entry.state, TaskState::Failed);
        assert_eq!(entry.error_history, vec!["engine exploded".to_string()]);
    }

    #[test]
    fn reset_task_returns_to_pending() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();

        m.claim_task_for_execution("1").unwrap();
        m.transition_state("1", TaskState::Failed, Some("boom"))
            .unwrap();
        m.reset_task("1").unwrap();

        let entry = m.get("1").unwrap();
        assert_eq!(entry.state, TaskState::Pending);
        assert_eq!(entry.attempt_count, 0);
        // History survives the reset.
        assert_eq!(entry.error_history.len(), 1);
    }

    #[test]
    fn reset_rejects_live_states() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();
        assert!(m.reset_task("1").is_err());
    }

    #[test]
    fn crash_recovery_downgrades_running() {
        let dir = tempdir().unwrap();
        {
            let m = manager(dir.path(), SourceType::Json);
            m.initialize(&tasks()).unwrap();
            m.claim_task_for_execution("1").unwrap();
        }

        // A fresh process re-initializes from the same file.
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();

        let entry = m.get("1").unwrap();
        assert_eq!(entry.state, TaskState::Pending);
        assert_eq!(entry.attempt_count, 0);
    }

    #[test]
    fn unknown_stored_tasks_are_dropped() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        m.initialize(&tasks()).unwrap();
        m.initialize(&[Task::new("2", "Beta")]).unwrap();

        assert!(m.get("1").is_none());
        assert!(m.get("2").is_some());
    }

    #[test]
    fn persists_across_formats() {
        for source_type in [
            SourceType::Json,
            SourceType::Yaml,
            SourceType::Csv,
            SourceType::Markdown,
        ] {
            let dir = tempdir().unwrap();
            {
                let m = manager(dir.path(), source_type);
                m.initialize(&tasks()).unwrap();
                m.claim_task_for_execution("1").unwrap();
                m.transition_state("1", TaskState::Completed, None).unwrap();
                m.transition_state("2", TaskState::Failed, Some("err: x"))
                    .unwrap();
            }

            let m = manager(dir.path(), source_type);
            m.initialize(&tasks()).unwrap();
            assert_eq!(
                m.get("1").unwrap().state,
                TaskState::Completed,
                "format {source_type}"
            );
            let two = m.get("2").unwrap();
            assert_eq!(two.state, TaskState::Failed);
            assert_eq!(two.error_history, vec!["err: x".to_string()]);
        }
    }

    #[test]
    fn rejects_polluted_documents() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Json);
        std::fs::create_dir_all(m.state_path().parent().unwrap()).unwrap();
        std::fs::write(
            m.state_path(),
            r#"{"version":1,"lastUpdated":"now","tasks":{"__proto__":{"id":"x"}}}"#,
        )
        .unwrap();

        assert!(m.initialize(&tasks()).is_err());
    }

    #[test]
    fn execution_context_round_trips() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), SourceType::Yaml);
        m.initialize(&tasks()).unwrap();
        m.set_execution_context(
            "1",
            ExecutionContext {
                branch: Some("task/1".into()),
                worktree: Some("/tmp/wt1".into()),
                sandbox: None,
            },
        )
        .unwrap();

        let m = manager(dir.path(), SourceType::Yaml);
        m.initialize(&tasks()).unwrap();
        let ctx = m.get("1").unwrap().execution_context.unwrap();
        assert_eq!(ctx.branch.as_deref(), Some("task/1"));
    }
}
