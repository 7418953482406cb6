//! CLI output formatting (table, JSON, YAML).

use crate::core::error::CoreError;
use comfy_table::{Cell, Table};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-readable JSON format.
    Json,
    /// Machine-readable YAML format.
    Yaml,
}

/// Structured CLI response envelope.
#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

/// Structured error output.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for ErrorOutput {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.code.to_string(),
            message: err.message.clone(),
        }
    }
}

impl<T: Serialize> CliResponse<T> {
    /// Creates a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(err: &CoreError) -> CliResponse<()> {
        CliResponse {
            success: false,
            data: None,
            error: Some(ErrorOutput::from(err)),
        }
    }
}

/// Prints data in the selected format.
pub fn output<T: Serialize>(data: &T, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&CliResponse::success(data)) {
                println!("{json}");
            }
        }
        OutputFormat::Yaml => {
            if let Ok(yaml) = serde_yaml::to_string(&CliResponse::success(data)) {
                print!("{yaml}");
            }
        }
        OutputFormat::Table => {
            if let Ok(json) = serde_json::to_string_pretty(data) {
                println!("{json}");
            }
        }
    }
}

/// Prints an error in the selected format.
pub fn output_error(err: &CoreError, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&CliResponse::<()>::error(err)) {
                eprintln!("{json}");
            }
        }
        OutputFormat::Yaml => {
            if let Ok(yaml) = serde_yaml::to_string(&CliResponse::<()>::error(err)) {
                eprint!("{yaml}");
            }
        }
        OutputFormat::Table => {
            eprintln!("Error: {err}");
        }
    }
}

/// Helper to create a table with headers.
#[must_use]
pub fn create_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_header(headers.iter().map(|h| Cell::new(*h)));
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope() {
        let response = CliResponse::success(42);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("42"));
    }

    #[test]
    fn error_envelope() {
        let err = CoreError::validation("bad flag");
        let response = CliResponse::<()>::error(&err);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("VALIDATION"));
    }
}
