//! Engine stream event parsing.
//!
//! Engines emit one JSON object per stdout line, interleaved with free
//! text. Lines that open with `{` get bracket-balanced extraction of a
//! single complete object, which is then validated against the tagged
//! union of known event variants. Everything else is free text, still
//! scanned for error patterns.

use serde::{Deserialize, Serialize};

/// Token counts as emitted inside `step_finish` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
}

/// Token counts as emitted inside `result` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Nested part payload of a `step_finish` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPart {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tokens: Option<TokenCounts>,
}

/// One event from the engine stream.
///
/// Unknown `type` values deserialize as [`EngineEvent::Unknown`] and are
/// treated as free text downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StepStart {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        tool: Option<String>,
    },
    StepFinish {
        #[serde(default)]
        part: Option<StepPart>,
        #[serde(default)]
        tokens: Option<TokenCounts>,
    },
    Text {
        #[serde(default)]
        text: String,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    ToolUse {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        input: Option<serde_json::Value>,
    },
    Result {
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// A successfully extracted event plus whatever trailed it on the line.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub event: EngineEvent,
    pub remaining: String,
}

/// Extracts one complete JSON object from the start of `line`.
///
/// Tracks string literals and escapes so braces inside strings do not
/// unbalance the scan. Returns the object slice and the remainder.
#[must_use]
pub fn extract_json_object(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (idx, c) in trimmed.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = idx + c.len_utf8();
                    return Some((&trimmed[..end], &trimmed[end..]));
                }
            }
            _ => {}
        }
    }

    None
}

/// Parses one stream line into an event, if it carries one.
///
/// Returns `None` for free text, incomplete objects, and objects that do
/// not parse as JSON at all. Objects with an unrecognized `type` come
/// back as [`EngineEvent::Unknown`].
#[must_use]
pub fn parse_event(line: &str) -> Option<Extracted> {
    let (object, remaining) = extract_json_object(line)?;
    let event: EngineEvent = serde_json::from_str(object).ok()?;
    Some(Extracted {
        event,
        remaining: remaining.to_string(),
    })
}

/// Pulls authoritative token counts out of an event.
///
/// `result.usage` wins, then `step_finish.part.tokens`, then
/// `step_finish.tokens`.
#[must_use]
pub fn token_usage(event: &EngineEvent) -> Option<(u64, u64)> {
    match event {
        EngineEvent::Result {
            usage: Some(usage), ..
        } => Some((usage.input_tokens, usage.output_tokens)),
        EngineEvent::StepFinish { part, tokens } => part
            .as_ref()
            .and_then(|p| p.tokens)
            .or(*tokens)
            .map(|t| (t.input, t.output)),
        _ => None,
    }
}

/// Human-facing step labels derived from tool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepAction {
    ReadingCode,
    WritingTests,
    Implementing,
    Linting,
    Testing,
    Staging,
    Committing,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadingCode => write!(f, "Reading code"),
            Self::WritingTests => write!(f, "Writing tests"),
            Self::Implementing => write!(f, "Implementing"),
            Self::Linting => write!(f, "Linting"),
            Self::Testing => write!(f, "Testing"),
            Self::Staging => write!(f, "Staging"),
            Self::Committing => write!(f, "Committing"),
        }
    }
}

/// Maps a tool name and optional command string to a step label.
#[must_use]
pub fn step_action(tool: &str, command: Option<&str>) -> Option<StepAction> {
    let tool = tool.to_lowercase();
    let command = command.map(str::to_lowercase).unwrap_or_default();

    if command.contains("git commit") {
        return Some(StepAction::Committing);
    }
    if command.contains("git add") {
        return Some(StepAction::Staging);
    }
    if ["lint", "eslint", "clippy", "ruff"]
        .iter()
        .any(|p| command.contains(p))
    {
        return Some(StepAction::Linting);
    }
    if ["test", "pytest", "jest", "vitest"]
        .iter()
        .any(|p| command.contains(p))
    {
        return Some(StepAction::Testing);
    }

    match tool.as_str() {
        "read" | "grep" | "glob" | "search" | "ls" => Some(StepAction::ReadingCode),
        "write" | "edit" | "multiedit" | "patch" => {
            if command.contains("test") || command.contains("spec") {
                Some(StepAction::WritingTests)
            } else {
                Some(StepAction::Implementing)
            }
        }
        "bash" | "shell" => {
            if command.is_empty() {
                None
            } else {
                Some(StepAction::Implementing)
            }
        }
        _ => None,
    }
}

/// Classifies a free-text line as a structured error message, if it
/// matches one of the known failure shapes.
#[must_use]
pub fn classify_error_text(line: &str) -> Option<String> {
    let lower = line.to_lowercase();

    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("quota")
    {
        return Some(format!("Rate limit exceeded: {}", line.trim()));
    }
    if lower.contains("econnrefused")
        || lower.contains("econnreset")
        || lower.contains("connection refused")
        || lower.contains("socket hang up")
        || lower.contains("unable to connect")
    {
        return Some(format!("Connection error: {}", line.trim()));
    }
    if lower.contains("model not found") || lower.contains("unknown model") {
        return Some(format!("Model not found: {}", line.trim()));
    }

    None
}

/// Keywords that mark an error event as an authentication failure.
const AUTH_KEYWORDS: &[&str] = &[
    "not authenticated",
    "authentication",
    "unauthorized",
    "log in",
    "login",
    "api key",
    "token expired",
    "credentials",
];

/// Extracts an authentication failure from an event, if present.
///
/// Fires on `type == "error"` events, on results flagged `is_error`, and
/// on the explicit `error == "authentication_failed"` marker, whenever
/// the carried message matches the auth keyword set.
#[must_use]
pub fn detect_auth_failure(event: &EngineEvent) -> Option<String> {
    let message = match event {
        EngineEvent::Error {
            message,
            error,
            is_error,
        } => {
            if error.as_deref() == Some("authentication_failed") {
                return Some(
                    message
                        .clone()
                        .unwrap_or_else(|| "authentication failed".to_string()),
                );
            }
            if *is_error || message.is_some() || error.is_some() {
                message.clone().or_else(|| error.clone())
            } else {
                None
            }
        }
        EngineEvent::Result {
            is_error: true,
            result,
            error,
            ..
        } => {
            if error.as_deref() == Some("authentication_failed") {
                return Some(
                    result
                        .clone()
                        .unwrap_or_else(|| "authentication failed".to_string()),
                );
            }
            result.clone().or_else(|| error.clone())
        }
        _ => None,
    }?;

    let lower = message.to_lowercase();
    AUTH_KEYWORDS
        .iter()
        .any(|k| lower.contains(k))
        .then_some(message)
}
