//! Structured error types and retry classification.
//!
//! Every failure in the orchestrator is normalized into a [`CoreError`]
//! carrying a code, a message, and free-form context. The classifier
//! decides whether a failure is worth retrying or must abort the chain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error code for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Caller-supplied input violates a contract.
    Validation,
    /// A bounded wait was exceeded.
    Timeout,
    /// A subprocess exited abnormally.
    Process,
    /// Connection-level failure.
    Network,
    /// Explicit rate-limit response.
    RateLimit,
    /// Authentication failure or missing binary. Never retried.
    Auth,
    /// A raw string was thrown somewhere and normalized here.
    StringError,
    /// Anything we could not classify.
    Unknown,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "VALIDATION"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Process => write!(f, "PROCESS"),
            Self::Network => write!(f, "NETWORK"),
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::StringError => write!(f, "STRING_ERROR"),
            Self::Unknown => write!(f, "UNKNOWN_ERROR"),
        }
    }
}

/// Uniform error value used across the execution kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreError {
    /// Classification code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Additional context key-value pairs (original stack, command, path).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl CoreError {
    /// Creates a new error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Creates a process error.
    #[must_use]
    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Process, message)
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimit, message)
    }

    /// Creates an authentication/fatal error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Auth, message)
    }

    /// Creates an unclassified error.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Normalizes an arbitrary error, keeping its message and original
    /// rendering in context.
    #[must_use]
    pub fn normalize(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string()).with_context("original", format!("{err:?}"))
    }

    /// True if this error is worth retrying. Fatal patterns always win.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        if self.is_fatal() {
            return false;
        }
        matches!(
            self.code,
            ErrorCode::Timeout | ErrorCode::Process | ErrorCode::Network | ErrorCode::RateLimit
        ) || matches_retryable_message(&self.message)
    }

    /// True if this error must never be retried and aborts the chain.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.code == ErrorCode::Auth || matches_fatal_message(&self.message)
    }

    /// True if this error looks like a connection-level failure. The
    /// circuit breaker only counts these toward opening.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        if self.code == ErrorCode::Network {
            return true;
        }
        let lower = self.message.to_lowercase();
        CONNECTION_PATTERNS.iter().any(|p| lower.contains(p))
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => ErrorCode::Network,
            _ => ErrorCode::Unknown,
        };
        Self::new(code, err.to_string()).with_context("kind", format!("{:?}", err.kind()))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string()).with_context("source", "serde_json")
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string()).with_context("source", "serde_yaml")
    }
}

impl From<String> for CoreError {
    fn from(message: String) -> Self {
        Self::new(ErrorCode::StringError, message)
    }
}

impl From<&str> for CoreError {
    fn from(message: &str) -> Self {
        Self::new(ErrorCode::StringError, message.to_string())
    }
}

/// Result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Message fragments that mark an error as retryable.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "connection refused",
    "network",
    "rate limit",
    "too many requests",
    "temporary failure",
    "try again",
    "econnrefused",
    "econnreset",
    "socket hang up",
    "fetch failed",
    "unable to connect",
];

/// Message fragments that mark an error as fatal, overriding retryability.
const FATAL_PATTERNS: &[&str] = &[
    "not authenticated",
    "authentication failed",
    "invalid token",
    "invalid api key",
    "unauthorized",
    "401",
    "403",
    "command not found",
    "not installed",
    "not recognized",
];

/// Fragments counted by the circuit breaker as connection failures.
const CONNECTION_PATTERNS: &[&str] = &[
    "connection refused",
    "econnrefused",
    "econnreset",
    "socket hang up",
    "unable to connect",
    "network",
    "fetch failed",
];

fn matches_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

fn matches_fatal_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    FATAL_PATTERNS.iter().any(|p| lower.contains(p))
}
