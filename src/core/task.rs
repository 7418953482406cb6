//! The task model shared by sources, queue, and state manager.

use serde::{Deserialize, Serialize};

/// A unit of work pulled from a task source.
///
/// Identity is `id`; the core treats it as opaque. Tasks in the same
/// `parallel_group` may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<u32>,
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    /// Creates a pending task.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: None,
            parallel_group: None,
            completed: false,
        }
    }

    /// Sets the task body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    /// Sets the parallel group.
    #[must_use]
    pub fn with_parallel_group(mut self, group: u32) -> Self {
        self.parallel_group = Some(group);
        self
    }

    /// Marks the task completed.
    #[must_use]
    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }
}
