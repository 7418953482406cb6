//! JSON task sources: a bare array or a `{"tasks": [...]}` wrapper.
//!
//! Field aliases are accepted on read (`parallel_group`/`parallelGroup`,
//! `description`/`body`); the writer emits the snake_case names.

use crate::core::error::{CoreError, Result};
use crate::core::task::Task;
use serde_json::{json, Value};

/// Parses a JSON task document.
///
/// # Errors
/// Returns a validation error when the top level is neither an array
/// nor an object with a `tasks` array.
pub fn parse_tasks(content: &str) -> Result<Vec<Task>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(content)?;

    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("tasks")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| CoreError::validation("JSON object is missing a tasks array"))?,
        _ => {
            return Err(CoreError::validation(
                "JSON task source must be an array or an object with tasks",
            ))
        }
    };

    let mut tasks = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let id = match item.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => (idx + 1).to_string(),
        };
        let title = item
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let completed = item
            .get("completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let parallel_group = item
            .get("parallel_group")
            .or_else(|| item.get("parallelGroup"))
            .and_then(Value::as_u64)
            .map(|g| g as u32);
        let body = item
            .get("description")
            .or_else(|| item.get("body"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut task = Task::new(id, title).completed(completed);
        task.parallel_group = parallel_group;
        task.body = body;
        tasks.push(task);
    }

    Ok(tasks)
}

/// Serializes tasks as `{"tasks": [...]}` with canonical field names.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn write_tasks(tasks: &[Task]) -> Result<String> {
    let items: Vec<Value> = tasks
        .iter()
        .map(|task| {
            let mut obj = json!({
                "id": task.id,
                "title": task.title,
                "completed": task.completed,
            });
            if let Some(group) = task.parallel_group {
                obj["parallel_group"] = json!(group);
            }
            if let Some(ref body) = task.body {
                obj["description"] = json!(body);
            }
            obj
        })
        .collect();

    Ok(serde_json::to_string_pretty(&json!({ "tasks": items }))?)
}
