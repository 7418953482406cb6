//! Engine adapters.
//!
//! Adapters are the only components that talk to an execution engine
//! (Claude Code, OpenCode, Codex, or anything with the same stream
//! protocol). The adapter is purely advisory: it never writes files
//! itself.

pub mod engine;
pub mod planner;

use crate::core::error::Result;
use crate::core::events::{EngineEvent, StepAction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for an engine adapter.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the engine.
    pub name: String,
    /// Path to the engine binary.
    pub binary_path: PathBuf,
    /// Arguments passed on every invocation.
    pub args: Vec<String>,
    /// Environment overrides.
    pub env: HashMap<String, String>,
    /// Execution timeout.
    pub timeout: Duration,
    /// Optional model identifier, appended as `--model` when absent
    /// from the args.
    pub model: Option<String>,
    /// Whether the engine emits line-delimited events worth streaming.
    pub streaming: bool,
}

impl EngineConfig {
    /// Creates a config with a ten-minute default timeout.
    pub fn new(name: impl Into<String>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary_path: binary_path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: Duration::from_secs(600),
            model: None,
            streaming: true,
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Disables streaming (batch engines).
    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// The argv for one invocation, with the model flag folded in.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(ref model) = self.model {
            let has_model_flag = args
                .iter()
                .any(|a| a == "--model" || a.starts_with("--model="));
            if !has_model_flag {
                args.push("--model".to_string());
                args.push(model.clone());
            }
        }
        args
    }
}

/// One update surfaced while an engine runs.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    /// A parsed protocol event.
    Event(EngineEvent),
    /// A free-text line.
    Line(String),
    /// A recognized step transition.
    Step(StepAction),
}

/// Outcome of one engine invocation.
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub exit_code: i32,
    pub duration: Duration,
    /// Collected text output (result and text events plus free text).
    pub output: String,
    pub stderr: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Step labels in the order they were observed.
    pub steps: Vec<StepAction>,
    /// Structured error messages surfaced by the stream.
    pub errors: Vec<String>,
}

/// Trait for execution engines.
pub trait EngineAdapter: Send + Sync {
    /// The engine's name.
    fn name(&self) -> &str;

    /// Whether [`EngineAdapter::execute_streaming`] delivers incremental
    /// updates.
    fn supports_streaming(&self) -> bool;

    /// Checks the engine binary is present and runnable.
    fn health_check(&self) -> Result<()>;

    /// Runs the engine to completion with the prompt on stdin.
    fn execute(&self, prompt: &str, cwd: &Path) -> Result<EngineReport>;

    /// Runs the engine, delivering updates as output arrives.
    fn execute_streaming(
        &self,
        prompt: &str,
        cwd: &Path,
        on_update: &mut dyn FnMut(&StreamUpdate),
    ) -> Result<EngineReport>;
}

/// Scripted engine for tests: pops one canned response per call.
pub struct MockEngine {
    name: String,
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
    calls: std::sync::atomic::AtomicU32,
}

impl MockEngine {
    /// Creates a mock with no canned responses (every call errors).
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Queues a successful response.
    #[must_use]
    pub fn with_response(self, output: impl Into<String>) -> Self {
        self.responses
            .lock()
            .expect("lock poisoned")
            .push_back(Ok(output.into()));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn with_error(self, error: crate::core::error::CoreError) -> Self {
        self.responses
            .lock()
            .expect("lock poisoned")
            .push_back(Err(error));
        self
    }

    /// Number of `execute` calls made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<String> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(crate::core::error::CoreError::process(
                    "mock engine has no more responses",
                ))
            })
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineAdapter for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn execute(&self, _prompt: &str, _cwd: &Path) -> Result<EngineReport> {
        let output = self.next_response()?;
        Ok(EngineReport {
            exit_code: 0,
            output,
            ..EngineReport::default()
        })
    }

    fn execute_streaming(
        &self,
        prompt: &str,
        cwd: &Path,
        on_update: &mut dyn FnMut(&StreamUpdate),
    ) -> Result<EngineReport> {
        let report = self.execute(prompt, cwd)?;
        for line in report.output.lines() {
            on_update(&StreamUpdate::Line(line.to_string()));
        }
        Ok(report)
    }
}
