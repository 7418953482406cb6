//! Planning: ask the engine which files a task will touch.
//!
//! The planner requests a response with `<ANALYSIS>`, `<PLAN>`,
//! `<FILES>`, and `<OPTIMIZATION>` sections, parses them, and hands the
//! file list to the caller for lock acquisition and cache prefetch. An
//! engine that short-circuits into tool invocation instead of planning
//! is asked again, up to a bounded number of re-plans.

use super::{EngineAdapter, StreamUpdate};
use crate::core::error::{CoreError, Result};
use crate::core::task::Task;
use crate::storage::planning_cache::PlanningCache;
use std::fmt::Write as FmtWrite;
use std::path::Path;
use std::time::Duration;

/// Re-plans allowed after malformed output.
const DEFAULT_MAX_REPLANS: u32 = 3;

/// Backoff ceiling for connection failures between plans.
const CONNECTION_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Result of a planning round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanResult {
    pub analysis: String,
    pub plan_steps: Vec<String>,
    /// Normalized relative paths, deduplicated in order.
    pub files: Vec<String>,
    pub optimization: String,
    /// Set when planning gave up; `files` is empty in that case.
    pub error: Option<String>,
}

/// Progress callbacks emitted while planning.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanProgress {
    Started,
    Thinking,
    Analyzing,
    Planning,
    Completed { reward: Option<f64> },
    Failed { message: String },
}

/// Plans file sets for tasks via an engine.
pub struct Planner<'a> {
    engine: &'a dyn EngineAdapter,
    cache: Option<&'a PlanningCache>,
    max_replans: u32,
    connection_backoff_base: Duration,
}

impl<'a> Planner<'a> {
    /// Creates a planner over an engine.
    #[must_use]
    pub fn new(engine: &'a dyn EngineAdapter) -> Self {
        Self {
            engine,
            cache: None,
            max_replans: DEFAULT_MAX_REPLANS,
            connection_backoff_base: Duration::from_secs(2),
        }
    }

    /// Consults and populates a planning cache.
    #[must_use]
    pub fn with_cache(mut self, cache: &'a PlanningCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Overrides the re-plan budget.
    #[must_use]
    pub fn with_max_replans(mut self, max_replans: u32) -> Self {
        self.max_replans = max_replans;
        self
    }

    /// Overrides the connection backoff base. Intended for tests.
    #[must_use]
    pub fn with_connection_backoff(mut self, base: Duration) -> Self {
        self.connection_backoff_base = base;
        self
    }

    /// Produces a plan for `task`, consulting the cache first.
    ///
    /// # Errors
    /// Propagates non-retryable engine failures. Persistent malformed
    /// output is not an error: it comes back as a [`PlanResult`] with
    /// an `error` message and no files.
    pub fn plan(
        &self,
        task: &Task,
        cwd: &Path,
        mut on_progress: Option<&mut dyn FnMut(PlanProgress)>,
    ) -> Result<PlanResult> {
        if let Some(cache) = self.cache {
            if let Some(files) = cache.get(&task.id, &task.title)? {
                emit(&mut on_progress, PlanProgress::Completed { reward: None });
                return Ok(PlanResult {
                    files,
                    ..PlanResult::default()
                });
            }
        }

        emit(&mut on_progress, PlanProgress::Started);
        let prompt = build_planning_prompt(task);

        let mut attempt = 0u32;
        loop {
            let outcome = self.run_engine(&prompt, cwd, &mut on_progress);

            let output = match outcome {
                Ok(output) => output,
                Err(err) if err.is_connection_error() && attempt + 1 < self.max_replans => {
                    std::thread::sleep(self.connection_delay(attempt));
                    attempt += 1;
                    continue;
                }
                Err(err) => {
                    emit(
                        &mut on_progress,
                        PlanProgress::Failed {
                            message: err.message.clone(),
                        },
                    );
                    return Err(err);
                }
            };

            if is_tool_use_short_circuit(&output) {
                attempt += 1;
                if attempt >= self.max_replans {
                    let message =
                        "Planning failed: engine produced a tool invocation instead of a plan"
                            .to_string();
                    emit(
                        &mut on_progress,
                        PlanProgress::Failed {
                            message: message.clone(),
                        },
                    );
                    return Ok(PlanResult {
                        error: Some(message),
                        ..PlanResult::default()
                    });
                }
                continue;
            }

            let reward = extract_reward(&output);
            let result = parse_plan_response(&output);

            if let Some(cache) = self.cache {
                cache.put(&task.id, &task.title, result.files.clone())?;
            }
            emit(&mut on_progress, PlanProgress::Completed { reward });
            return Ok(result);
        }
    }

    fn run_engine(
        &self,
        prompt: &str,
        cwd: &Path,
        on_progress: &mut Option<&mut dyn FnMut(PlanProgress)>,
    ) -> Result<String> {
        if self.engine.supports_streaming() {
            let mut seen_output = false;
            let mut seen_analysis = false;
            let mut seen_plan = false;
            let mut accumulated = String::new();

            let report = self.engine.execute_streaming(prompt, cwd, &mut |update| {
                let line = match update {
                    StreamUpdate::Line(line) => line.as_str(),
                    StreamUpdate::Event(crate::core::events::EngineEvent::Text { text }) => {
                        text.as_str()
                    }
                    _ => return,
                };
                accumulated.push_str(line);
                accumulated.push('\n');

                if !seen_output {
                    seen_output = true;
                    emit(on_progress, PlanProgress::Thinking);
                }
                if !seen_analysis && accumulated.contains("<ANALYSIS>") {
                    seen_analysis = true;
                    emit(on_progress, PlanProgress::Analyzing);
                }
                if !seen_plan && accumulated.contains("<PLAN>") {
                    seen_plan = true;
                    emit(on_progress, PlanProgress::Planning);
                }
            })?;
            Ok(report.output)
        } else {
            emit(on_progress, PlanProgress::Thinking);
            let report = self.engine.execute(prompt, cwd)?;
            Ok(report.output)
        }
    }

    fn connection_delay(&self, attempt: u32) -> Duration {
        // 2 s, 4 s, 8 s with the default base, capped at 10 s.
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.connection_backoff_base
            .saturating_mul(factor)
            .min(CONNECTION_BACKOFF_CAP)
    }
}

fn emit(on_progress: &mut Option<&mut dyn FnMut(PlanProgress)>, progress: PlanProgress) {
    if let Some(callback) = on_progress {
        callback(progress);
    }
}

/// The planning prompt: task context plus the required section tags.
#[must_use]
pub fn build_planning_prompt(task: &Task) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Plan the implementation of the following task.");
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Task: {}", task.title);
    if let Some(ref body) = task.body {
        let _ = writeln!(prompt, "Details: {body}");
    }
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "Respond with exactly four sections, each wrapped in its tag:"
    );
    let _ = writeln!(
        prompt,
        "<ANALYSIS>what the task requires and what already exists</ANALYSIS>"
    );
    let _ = writeln!(prompt, "<PLAN>numbered implementation steps</PLAN>");
    let _ = writeln!(
        prompt,
        "<FILES>one relative path per line, every file you will create or modify</FILES>"
    );
    let _ = writeln!(
        prompt,
        "<OPTIMIZATION>how to keep the change small and safe</OPTIMIZATION>"
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Do not invoke tools. Do not modify any files.");
    prompt
}

/// True when the engine skipped planning and emitted a raw `tool_use`
/// object instead.
fn is_tool_use_short_circuit(output: &str) -> bool {
    let trimmed = output.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    crate::core::events::parse_event(trimmed)
        .map(|extracted| {
            matches!(
                extracted.event,
                crate::core::events::EngineEvent::ToolUse { .. }
            )
        })
        .unwrap_or(false)
}

/// Parses the four tagged sections out of a planning response.
#[must_use]
pub fn parse_plan_response(output: &str) -> PlanResult {
    PlanResult {
        analysis: extract_section(output, "ANALYSIS").unwrap_or_default(),
        plan_steps: parse_steps(&extract_section(output, "PLAN").unwrap_or_default()),
        files: parse_file_list(&extract_section(output, "FILES").unwrap_or_default()),
        optimization: extract_section(output, "OPTIMIZATION").unwrap_or_default(),
        error: None,
    }
}

fn extract_section(output: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = output.find(&open)? + open.len();
    let end = output[start..].find(&close)? + start;
    Some(output[start..end].trim().to_string())
}

/// Cleans one `<FILES>` section: strips bullets, numbering, backticks,
/// and leading `./`, normalizes separators, and deduplicates in order.
#[must_use]
pub fn parse_file_list(section: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut files = Vec::new();

    for line in section.lines() {
        let mut entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') || entry.starts_with("//") {
            continue;
        }
        entry = strip_list_marker(entry);
        let cleaned = entry.trim_matches('`').trim();
        if cleaned.is_empty() {
            continue;
        }
        let mut path = cleaned.replace('\\', "/");
        while let Some(stripped) = path.strip_prefix("./") {
            path = stripped.to_string();
        }
        if path.is_empty() {
            continue;
        }
        if seen.insert(path.clone()) {
            files.push(path);
        }
    }
    files
}

/// Extracts ordered steps from a `<PLAN>` section.
#[must_use]
pub fn parse_steps(section: &str) -> Vec<String> {
    section
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(strip_list_marker)
        .filter(|step| !step.is_empty())
        .map(str::to_string)
        .collect()
}

/// Removes a leading bullet (`-`, `*`, `+`) or number (`1.`, `2)`).
fn strip_list_marker(line: &str) -> &str {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| trimmed.strip_prefix("+ "))
    {
        return rest.trim_start();
    }

    let digits: usize = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim_start();
        }
    }
    trimmed
}

/// Pulls the last `reward: <float>` out of streamed output.
#[must_use]
pub fn extract_reward(output: &str) -> Option<f64> {
    let lower = output.to_lowercase();
    let mut reward = None;
    let mut search_from = 0;
    while let Some(found) = lower[search_from..].find("reward:") {
        let value_start = search_from + found + "reward:".len();
        let rest = lower[value_start..].trim_start();
        let numeric: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
            .collect();
        if let Ok(value) = numeric.parse() {
            reward = Some(value);
        }
        search_from = value_start;
    }
    reward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockEngine;
    use crate::core::error::ErrorCode;

    const GOOD_RESPONSE: &str = "\
<ANALYSIS>The auth module lacks a login entry point.</ANALYSIS>
<PLAN>
1. Add the login handler
2. Wire it into the router
</PLAN>
<FILES>
- src/auth/login.rs
`src/router.rs`
./src/auth/login.rs
src\\auth\\mod.rs
</FILES>
<OPTIMIZATION>Touch only the auth module.</OPTIMIZATION>
reward: 0.85
";

    fn task() -> Task {
        Task::new("1", "Add login").with_body("Use OAuth")
    }

    #[test]
    fn parses_sections_and_cleans_files() {
        let result = parse_plan_response(GOOD_RESPONSE);
        assert!(result.analysis.contains("auth module"));
        assert_eq!(
            result.plan_steps,
            vec!["Add the login handler", "Wire it into the router"]
        );
        assert_eq!(
            result.files,
            vec!["src/auth/login.rs", "src/router.rs", "src/auth/mod.rs"]
        );
        assert!(result.optimization.contains("auth module"));
    }

    #[test]
    fn plan_returns_parsed_result() {
        let engine = MockEngine::new().with_response(GOOD_RESPONSE);
        let planner = Planner::new(&engine);

        let mut progress = Vec::new();
        let result = planner
            .plan(
                &task(),
                Path::new("/tmp"),
                Some(&mut |p| progress.push(p)),
            )
            .unwrap();

        assert_eq!(result.files.len(), 3);
        assert!(result.error.is_none());
        assert_eq!(progress.first(), Some(&PlanProgress::Started));
        assert_eq!(
            progress.last(),
            Some(&PlanProgress::Completed {
                reward: Some(0.85)
            })
        );
    }

    #[test]
    fn tool_use_output_triggers_replans_then_gives_up() {
        let tool_use = r#"{"type":"tool_use","name":"edit","input":{}}"#;
        let engine = MockEngine::new()
            .with_response(tool_use)
            .with_response(tool_use)
            .with_response(tool_use);
        let planner = Planner::new(&engine);

        let result = planner.plan(&task(), Path::new("/tmp"), None).unwrap();
        assert_eq!(engine.calls(), 3);
        assert!(result.files.is_empty());
        let error = result.error.unwrap();
        assert!(error.starts_with("Planning failed"));
        assert!(error.contains("tool"));
    }

    #[test]
    fn tool_use_then_good_response_succeeds() {
        let engine = MockEngine::new()
            .with_response(r#"{"type":"tool_use","name":"edit"}"#)
            .with_response(GOOD_RESPONSE);
        let planner = Planner::new(&engine);

        let result = planner.plan(&task(), Path::new("/tmp"), None).unwrap();
        assert_eq!(engine.calls(), 2);
        assert_eq!(result.files.len(), 3);
    }

    #[test]
    fn connection_errors_back_off_and_retry() {
        let engine = MockEngine::new()
            .with_error(CoreError::network("ECONNREFUSED"))
            .with_response(GOOD_RESPONSE);
        let planner = Planner::new(&engine).with_connection_backoff(Duration::from_millis(1));

        let result = planner.plan(&task(), Path::new("/tmp"), None).unwrap();
        assert_eq!(engine.calls(), 2);
        assert!(!result.files.is_empty());
    }

    #[test]
    fn non_connection_errors_propagate() {
        let engine = MockEngine::new().with_error(CoreError::validation("bad prompt"));
        let planner = Planner::new(&engine);

        let err = planner.plan(&task(), Path::new("/tmp"), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn cache_short_circuits_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let cache = PlanningCache::open(dir.path()).unwrap();

        let engine = MockEngine::new().with_response(GOOD_RESPONSE);
        let planner = Planner::new(&engine).with_cache(&cache);

        // First plan goes to the engine and populates the cache.
        let first = planner.plan(&task(), dir.path(), None).unwrap();
        assert_eq!(engine.calls(), 1);

        // Second plan is served from the cache.
        let second = planner.plan(&task(), dir.path(), None).unwrap();
        assert_eq!(engine.calls(), 1);
        assert_eq!(second.files, first.files);
    }

    #[test]
    fn reward_extraction() {
        assert_eq!(extract_reward("reward: 0.5"), Some(0.5));
        assert_eq!(extract_reward("Reward: 1.0 then reward: 0.25"), Some(0.25));
        assert_eq!(extract_reward("no reward here:"), None);
    }

    #[test]
    fn prompt_names_all_sections() {
        let prompt = build_planning_prompt(&task());
        for tag in ["<ANALYSIS>", "<PLAN>", "<FILES>", "<OPTIMIZATION>"] {
            assert!(prompt.contains(tag), "missing {tag}");
        }
        assert!(prompt.contains("Use OAuth"));
    }
}
