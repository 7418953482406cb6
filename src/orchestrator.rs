//! The execution driver.
//!
//! Pulls claimed tasks through the pipeline: plan the file set, lock
//! it, drive the engine under the retry policy, snapshot results into
//! the hash store, record the state transition, release the locks. The
//! queue and the state manager are independent authorities; this
//! driver is what keeps them consistent.

use crate::adapters::planner::{PlanResult, Planner};
use crate::adapters::EngineAdapter;
use crate::core::error::Result;
use crate::core::locks::LockManager;
use crate::core::retry::{with_retry, CircuitBreaker, RetryOptions};
use crate::core::task::Task;
use crate::queue::{QueueItem, Priority, TaskQueue};
use crate::source::{SourceType, TaskSource};
use crate::storage::hash_store::HashStore;
use crate::storage::planning_cache::PlanningCache;
use crate::storage::state::{TaskState, TaskStateManager};
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of driving one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub state: TaskState,
    pub files: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Drives tasks from a source through an engine.
pub struct Orchestrator {
    work_dir: PathBuf,
    state: TaskStateManager,
    queue: Box<dyn TaskQueue>,
    locks: LockManager,
    breaker: Arc<CircuitBreaker>,
    planning_cache: PlanningCache,
    retry: RetryOptions,
}

impl Orchestrator {
    /// Creates a driver for one working directory and task source.
    ///
    /// # Errors
    /// Propagates planning-cache load failures.
    pub fn new(
        work_dir: &Path,
        source: &TaskSource,
        queue: Box<dyn TaskQueue>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let state = TaskStateManager::new(
            work_dir,
            source.source_type(),
            source.path().to_string_lossy(),
        );
        let planning_cache = PlanningCache::open(work_dir)?;
        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            state,
            queue,
            locks: LockManager::new(),
            breaker,
            planning_cache,
            retry: RetryOptions::default(),
        })
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// The state manager backing this run.
    #[must_use]
    pub fn state(&self) -> &TaskStateManager {
        &self.state
    }

    /// The queue backing this run.
    #[must_use]
    pub fn queue(&self) -> &dyn TaskQueue {
        self.queue.as_ref()
    }

    /// Loads tasks from the source, initializes durable state, and
    /// enqueues everything still pending.
    ///
    /// # Errors
    /// Propagates source and persistence failures.
    pub fn prepare(&self, source: &TaskSource) -> Result<Vec<Task>> {
        let tasks = source.load()?;
        self.state.initialize(&tasks)?;

        for task in &tasks {
            let entry = self.state.get(&task.id);
            let pending = entry
                .map(|e| e.state == TaskState::Pending)
                .unwrap_or(false);
            if pending && !self.queue.has_task(&task.id)? {
                self.queue
                    .enqueue(QueueItem::new(task.clone(), Priority::Normal))?;
            }
        }
        Ok(tasks)
    }

    /// Runs every queued task to a terminal state.
    ///
    /// Fatal errors (authentication, missing binary) abort the run;
    /// everything else marks the task failed and moves on.
    ///
    /// # Errors
    /// Returns the fatal error that aborted the run, if any.
    pub fn run_all(&self, engine: &dyn EngineAdapter, source: &TaskSource) -> Result<RunSummary> {
        engine.health_check()?;

        let mut summary = RunSummary::default();
        while let Some(item) = self.queue.dequeue()? {
            match self.run_task(engine, source, &item) {
                Ok(outcome) => {
                    summary.input_tokens += outcome.input_tokens;
                    summary.output_tokens += outcome.output_tokens;
                    match outcome.state {
                        TaskState::Completed => summary.completed += 1,
                        TaskState::Skipped => summary.skipped += 1,
                        TaskState::Failed => summary.failed += 1,
                        _ => {}
                    }
                }
                Err(err) if err.is_fatal() => {
                    self.state
                        .transition_state(item.task_id(), TaskState::Failed, Some(&err.message))?;
                    self.queue.mark_failed(item.task_id())?;
                    return Err(err);
                }
                Err(err) => {
                    let outcome = self.fail_task(&item.task, &err.message)?;
                    if outcome.state == TaskState::Failed {
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Drives one dequeued item through plan, lock, execute, snapshot,
    /// and release.
    ///
    /// # Errors
    /// Returns fatal errors for the caller to abort on; transient
    /// failures come back as a failed [`TaskOutcome`].
    pub fn run_task(
        &self,
        engine: &dyn EngineAdapter,
        source: &TaskSource,
        item: &QueueItem,
    ) -> Result<TaskOutcome> {
        let task = &item.task;

        if !self.state.claim_task_for_execution(&task.id)? {
            // Already claimed or terminal; keep queue and state agreed.
            self.queue.mark_skipped(&task.id)?;
            return Ok(TaskOutcome {
                task_id: task.id.clone(),
                state: TaskState::Skipped,
                files: Vec::new(),
                input_tokens: 0,
                output_tokens: 0,
                error: None,
            });
        }

        let plan = Planner::new(engine)
            .with_cache(&self.planning_cache)
            .plan(task, &self.work_dir, None)?;

        if let Some(message) = plan.error.clone() {
            return self.fail_task(task, &message);
        }

        // Lexicographic order keeps concurrent agents from deadlocking
        // on overlapping file sets.
        let mut lock_paths: Vec<PathBuf> = plan.files.iter().map(PathBuf::from).collect();
        lock_paths.sort();

        if !self.locks.acquire_many(&lock_paths, &self.work_dir)? {
            return self.fail_task(task, "could not acquire file locks for planned set");
        }

        let execution = with_retry(&self.breaker, &self.retry, |_attempt| {
            engine.execute(&build_execution_prompt(task, &plan), &self.work_dir)
        });

        let outcome = match execution {
            Ok(report) => {
                self.snapshot_files(&task.id, &plan.files)?;
                self.state
                    .transition_state(&task.id, TaskState::Completed, None)?;
                self.queue.mark_complete(&task.id)?;
                if source.source_type() == SourceType::Markdown {
                    source.mark_complete(&task.id)?;
                }
                Ok(TaskOutcome {
                    task_id: task.id.clone(),
                    state: TaskState::Completed,
                    files: plan.files.clone(),
                    input_tokens: report.input_tokens,
                    output_tokens: report.output_tokens,
                    error: None,
                })
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.fail_task(task, &err.message),
        };

        self.locks.release_many(&lock_paths, &self.work_dir)?;
        outcome
    }

    /// Records a failed attempt, mirroring the queue's retry budget in
    /// the durable state machine: back to pending while attempts
    /// remain, failed once exhausted.
    fn fail_task(&self, task: &Task, message: &str) -> Result<TaskOutcome> {
        self.queue.mark_failed(&task.id)?;
        let exhausted = self
            .queue
            .get_task(&task.id)?
            .map(|item| item.attempts >= item.max_attempts)
            .unwrap_or(true);
        let state = if exhausted {
            TaskState::Failed
        } else {
            TaskState::Pending
        };
        self.state.transition_state(&task.id, state, Some(message))?;
        Ok(TaskOutcome {
            task_id: task.id.clone(),
            state,
            files: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            error: Some(message.to_string()),
        })
    }

    /// Writes the planned files that exist on disk through the task's
    /// hash store.
    fn snapshot_files(&self, task_id: &str, files: &[String]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let store = HashStore::open(&self.work_dir, task_id)?;
        for file in files {
            let path = self.work_dir.join(file);
            if path.is_file() {
                store.add_file(Path::new(file))?;
            }
        }
        Ok(())
    }
}

/// The execution prompt: task, context, and the agreed plan.
#[must_use]
pub fn build_execution_prompt(task: &Task, plan: &PlanResult) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Task: {}", task.title);
    if let Some(ref body) = task.body {
        let _ = writeln!(prompt, "\nDetails: {body}");
    }
    if !plan.analysis.is_empty() {
        let _ = writeln!(prompt, "\nAnalysis:\n{}", plan.analysis);
    }
    if !plan.plan_steps.is_empty() {
        let _ = writeln!(prompt, "\nPlan:");
        for (idx, step) in plan.plan_steps.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {step}", idx + 1);
        }
    }
    if !plan.files.is_empty() {
        let _ = writeln!(prompt, "\nOnly modify these files:");
        for file in &plan.files {
            let _ = writeln!(prompt, "- {file}");
        }
    }
    prompt
}
