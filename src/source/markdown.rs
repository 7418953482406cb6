//! Markdown checklist sources.
//!
//! Only lines shaped `- [ ] Title` (pending) or `- [x] Title`
//! (complete, case-insensitive) are tasks; everything else is
//! preserved untouched. The file line number, 1-based, is the id.

use crate::core::error::{CoreError, Result};
use crate::core::task::Task;

/// A checklist line split into its checkbox state and title.
fn parse_line(line: &str) -> Option<(bool, &str)> {
    let rest = line.strip_prefix("- [")?;
    let mut chars = rest.chars();
    let state = chars.next()?;
    let completed = match state {
        ' ' => false,
        'x' | 'X' => true,
        _ => return None,
    };
    let rest = chars.as_str().strip_prefix("] ")?;
    if rest.is_empty() {
        return None;
    }
    Some((completed, rest))
}

/// Parses every checklist line into a task keyed by line number.
#[must_use]
pub fn parse_tasks(content: &str) -> Vec<Task> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            parse_line(line).map(|(completed, title)| {
                Task::new((idx + 1).to_string(), title).completed(completed)
            })
        })
        .collect()
}

/// Serializes tasks as a checklist, one line per task.
#[must_use]
pub fn write_tasks(tasks: &[Task]) -> String {
    let mut out = String::new();
    for task in tasks {
        let mark = if task.completed { 'x' } else { ' ' };
        out.push_str(&format!("- [{mark}] {}\n", task.title));
    }
    out
}

/// Flips the checkbox of the task whose id is the given line number.
///
/// # Errors
/// Returns a validation error if the id is not a checklist line.
pub fn mark_complete(content: &str, id: &str) -> Result<String> {
    let line_number: usize = id
        .parse()
        .map_err(|_| CoreError::validation(format!("markdown task id must be a line number: {id}")))?;

    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if idx + 1 == line_number {
            let Some((_, title)) = parse_line(line) else {
                return Err(CoreError::validation(format!(
                    "line {line_number} is not a task"
                )));
            };
            lines.push(format!("- [x] {title}"));
            found = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !found {
        return Err(CoreError::validation(format!(
            "no such line: {line_number}"
        )));
    }

    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Number of unchecked tasks.
#[must_use]
pub fn count_remaining(content: &str) -> usize {
    content
        .lines()
        .filter_map(parse_line)
        .filter(|(completed, _)| !completed)
        .count()
}

/// Number of checked tasks.
#[must_use]
pub fn count_completed(content: &str) -> usize {
    content
        .lines()
        .filter_map(parse_line)
        .filter(|(completed, _)| *completed)
        .count()
}
