//! YAML task sources: a top-level `tasks:` list.
//!
//! Ids default to the 1-based list index when absent.

use crate::core::error::Result;
use crate::core::task::Task;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct YamlDoc {
    #[serde(default)]
    tasks: Vec<YamlTask>,
}

#[derive(Debug, Serialize, Deserialize)]
struct YamlTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<serde_yaml::Value>,
    title: String,
    #[serde(default)]
    completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel_group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn id_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses a YAML task document.
///
/// # Errors
/// Returns an error when the document is not valid YAML.
pub fn parse_tasks(content: &str) -> Result<Vec<Task>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: YamlDoc = serde_yaml::from_str(content)?;

    Ok(doc
        .tasks
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let id = item
                .id
                .as_ref()
                .and_then(id_to_string)
                .unwrap_or_else(|| (idx + 1).to_string());
            let mut task = Task::new(id, item.title).completed(item.completed);
            task.parallel_group = item.parallel_group;
            task.body = item.description.filter(|d| !d.is_empty());
            task
        })
        .collect())
}

/// Serializes tasks as a YAML document. Ids are positional and omitted.
///
/// # Errors
/// Returns an error if YAML serialization fails.
pub fn write_tasks(tasks: &[Task]) -> Result<String> {
    let doc = YamlDoc {
        tasks: tasks
            .iter()
            .map(|task| YamlTask {
                id: None,
                title: task.title.clone(),
                completed: task.completed,
                parallel_group: task.parallel_group,
                description: task.body.clone(),
            })
            .collect(),
    };
    Ok(serde_yaml::to_string(&doc)?)
}
