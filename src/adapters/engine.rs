//! CLI engine adapter.
//!
//! Drives an engine binary as a subprocess: prompt on stdin, one JSON
//! event per stdout line, free text tolerated. Authentication failures
//! surface as fatal errors; non-zero exits are classified from stderr
//! so the retry engine can tell transient failures from fatal ones.

use super::{EngineAdapter, EngineConfig, EngineReport, StreamUpdate};
use crate::core::command::{command_exists, CommandRunner, ExecOptions, StreamSource};
use crate::core::error::{CoreError, Result};
use crate::core::events::{
    classify_error_text, detect_auth_failure, parse_event, step_action, token_usage, EngineEvent,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Adapter for any engine spoken to over stdin/stdout.
pub struct CliEngine {
    config: EngineConfig,
    runner: Arc<CommandRunner>,
}

/// Accumulates one invocation's stream into a report.
#[derive(Default)]
struct StreamState {
    output: String,
    input_tokens: u64,
    output_tokens: u64,
    steps: Vec<crate::core::events::StepAction>,
    errors: Vec<String>,
    auth_failure: Option<String>,
}

impl StreamState {
    fn absorb_line(&mut self, line: &str) -> Option<StreamUpdate> {
        if let Some(extracted) = parse_event(line) {
            self.absorb_event(&extracted.event);
            if !extracted.remaining.trim().is_empty() {
                self.push_text(extracted.remaining.trim());
            }
            return Some(StreamUpdate::Event(extracted.event));
        }

        if let Some(error) = classify_error_text(line) {
            self.errors.push(error);
        }
        self.push_text(line);
        Some(StreamUpdate::Line(line.to_string()))
    }

    fn absorb_event(&mut self, event: &EngineEvent) {
        if let Some((input, output)) = token_usage(event) {
            self.input_tokens += input;
            self.output_tokens += output;
        }
        if let Some(message) = detect_auth_failure(event) {
            self.auth_failure = Some(message);
        }
        match event {
            EngineEvent::Text { text } => self.push_text(text),
            EngineEvent::Result {
                result: Some(result),
                ..
            } => self.push_text(result),
            EngineEvent::Error {
                message, error, ..
            } => {
                if let Some(msg) = message.clone().or_else(|| error.clone()) {
                    self.errors.push(msg);
                }
            }
            EngineEvent::ToolUse { name, command, .. } => {
                if let Some(action) =
                    step_action(name.as_deref().unwrap_or_default(), command.as_deref())
                {
                    if self.steps.last() != Some(&action) {
                        self.steps.push(action);
                    }
                }
            }
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(text);
    }
}

impl CliEngine {
    /// Creates an adapter around the given runner.
    #[must_use]
    pub fn new(config: EngineConfig, runner: Arc<CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// The adapter configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn exec_options(&self, prompt: &str, cwd: &Path) -> ExecOptions {
        let mut opts = ExecOptions::new(cwd)
            .with_stdin(prompt)
            .with_timeout(self.config.timeout);
        for (key, value) in &self.config.env {
            opts = opts.with_env(key, value);
        }
        opts
    }

    fn binary(&self) -> String {
        self.config.binary_path.to_string_lossy().into_owned()
    }

    fn finish(
        &self,
        mut state: StreamState,
        exit_code: i32,
        stderr: String,
        started: Instant,
    ) -> Result<EngineReport> {
        if let Some(message) = state.auth_failure.take() {
            return Err(CoreError::auth(message).with_context("engine", &self.config.name));
        }

        if exit_code != 0 {
            // Classify what the engine left behind so the retry engine
            // sees rate limits and connection drops for what they are.
            let detail = state
                .errors
                .last()
                .cloned()
                .or_else(|| classify_error_text(&stderr))
                .unwrap_or_else(|| {
                    let tail: String = stderr.chars().rev().take(200).collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    tail.trim().to_string()
                });
            return Err(CoreError::process(format!(
                "{} exited with code {exit_code}: {detail}",
                self.config.name
            ))
            .with_context("engine", &self.config.name));
        }

        Ok(EngineReport {
            exit_code,
            duration: started.elapsed(),
            output: state.output,
            stderr,
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            steps: state.steps,
            errors: state.errors,
        })
    }
}

impl EngineAdapter for CliEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_streaming(&self) -> bool {
        self.config.streaming
    }

    fn health_check(&self) -> Result<()> {
        let binary = self.binary();
        if command_exists(&binary) {
            Ok(())
        } else {
            Err(
                CoreError::auth(format!("{binary}: command not found or not installed"))
                    .with_context("engine", &self.config.name),
            )
        }
    }

    fn execute(&self, prompt: &str, cwd: &Path) -> Result<EngineReport> {
        let started = Instant::now();
        let output = self.runner.exec(
            &self.binary(),
            &self.config.build_args(),
            &self.exec_options(prompt, cwd),
        )?;

        let mut state = StreamState::default();
        for line in output.stdout.lines().filter(|l| !l.is_empty()) {
            state.absorb_line(line);
        }
        self.finish(state, output.exit_code, output.stderr, started)
    }

    fn execute_streaming(
        &self,
        prompt: &str,
        cwd: &Path,
        on_update: &mut dyn FnMut(&StreamUpdate),
    ) -> Result<EngineReport> {
        let started = Instant::now();
        let mut state = StreamState::default();
        let mut stderr = String::new();

        let exit_code = self.runner.exec_streaming(
            &self.binary(),
            &self.config.build_args(),
            &self.exec_options(prompt, cwd),
            |source, line| match source {
                StreamSource::Stdout => {
                    let step_count = state.steps.len();
                    if let Some(update) = state.absorb_line(line) {
                        on_update(&update);
                    }
                    if state.steps.len() > step_count {
                        if let Some(step) = state.steps.last() {
                            on_update(&StreamUpdate::Step(*step));
                        }
                    }
                }
                StreamSource::Stderr => {
                    if let Some(error) = classify_error_text(line) {
                        state.errors.push(error);
                    }
                    if !stderr.is_empty() {
                        stderr.push('\n');
                    }
                    stderr.push_str(line);
                }
            },
        )?;

        self.finish(state, exit_code, stderr, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cleanup::CleanupRegistry;
    use tempfile::tempdir;

    fn runner() -> Arc<CommandRunner> {
        Arc::new(CommandRunner::new(Arc::new(CleanupRegistry::new())))
    }

    /// A stand-in engine: cat echoes the prompt back as its output.
    fn cat_engine() -> CliEngine {
        CliEngine::new(EngineConfig::new("cat-engine", "cat"), runner())
    }

    #[test]
    fn health_check_distinguishes_missing_binaries() {
        assert!(cat_engine().health_check().is_ok());

        let missing = CliEngine::new(
            EngineConfig::new("ghost", "definitely-not-a-binary-2q9x"),
            runner(),
        );
        let err = missing.health_check().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn execute_parses_events_from_stdout() {
        let dir = tempdir().unwrap();
        let prompt = concat!(
            r#"{"type":"step_start","step":"work"}"#,
            "\n",
            r#"{"type":"tool_use","name":"read","command":"src/lib.rs"}"#,
            "\n",
            r#"{"type":"text","text":"thinking about it"}"#,
            "\n",
            r#"{"type":"result","usage":{"input_tokens":11,"output_tokens":7},"result":"all done"}"#,
            "\n",
        );

        let report = cat_engine().execute(prompt, dir.path()).unwrap();
        assert_eq!(report.input_tokens, 11);
        assert_eq!(report.output_tokens, 7);
        assert!(report.output.contains("thinking about it"));
        assert!(report.output.contains("all done"));
        assert_eq!(
            report.steps,
            vec![crate::core::events::StepAction::ReadingCode]
        );
    }

    #[test]
    fn execute_surfaces_auth_failures_as_fatal() {
        let dir = tempdir().unwrap();
        let prompt = concat!(
            r#"{"type":"error","message":"Please log in: not authenticated","is_error":true}"#,
            "\n",
        );

        let err = cat_engine().execute(prompt, dir.path()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.message.contains("not authenticated"));
    }

    #[test]
    fn streaming_delivers_updates() {
        let dir = tempdir().unwrap();
        let prompt = concat!(
            r#"{"type":"text","text":"hello"}"#,
            "\n",
            "free text line\n",
        );

        let mut lines = 0;
        let mut events = 0;
        let report = cat_engine()
            .execute_streaming(prompt, dir.path(), &mut |update| match update {
                StreamUpdate::Event(_) => events += 1,
                StreamUpdate::Line(_) => lines += 1,
                StreamUpdate::Step(_) => {}
            })
            .unwrap();

        assert_eq!(events, 1);
        assert_eq!(lines, 1);
        assert!(report.output.contains("hello"));
        assert!(report.output.contains("free text line"));
    }

    #[test]
    fn free_text_rate_limit_is_collected() {
        let dir = tempdir().unwrap();
        let prompt = "Error: rate limit exceeded, slow down\n";

        let report = cat_engine().execute(prompt, dir.path()).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Rate limit"));
    }
}
