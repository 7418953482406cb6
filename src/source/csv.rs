//! CSV task sources.
//!
//! Dialect: header row `id,title,done,group,desc`; fields quoted with
//! `"` when they contain separators, inner quotes doubled. `done`
//! accepts `0/1/true/false` case-insensitively. The writer always
//! quotes a non-empty description and quotes the title only when it
//! needs escaping, which reproduces hand-written files byte for byte.

use crate::core::error::{CoreError, Result};
use crate::core::task::Task;

/// Parses CSV content into tasks.
///
/// # Errors
/// Returns a validation error on rows with unbalanced quotes.
pub fn parse_tasks(content: &str) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());

    // Header row is required but not interpreted.
    let Some(_header) = lines.next() else {
        return Ok(tasks);
    };

    for line in lines {
        let fields = split_row(line)?;
        let get = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");

        let id = get(0).trim().to_string();
        if id.is_empty() {
            continue;
        }
        let title = get(1).to_string();
        let done = parse_done(get(2));
        let group: u32 = get(3).trim().parse().unwrap_or(0);
        let desc = get(4).to_string();

        let mut task = Task::new(id, title).completed(done).with_body(desc);
        if group > 0 {
            task.parallel_group = Some(group);
        }
        tasks.push(task);
    }

    Ok(tasks)
}

/// Serializes tasks as CSV with the canonical header.
#[must_use]
pub fn write_tasks(tasks: &[Task]) -> String {
    let mut out = String::from("id,title,done,group,desc\n");
    for task in tasks {
        let done = u8::from(task.completed);
        let group = task.parallel_group.unwrap_or(0);
        let desc = task.body.as_deref().unwrap_or("");
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            escape_if_needed(&task.id),
            escape_if_needed(&task.title),
            done,
            group,
            escape_nonempty(desc),
        ));
    }
    out
}

fn parse_done(field: &str) -> bool {
    matches!(field.trim().to_lowercase().as_str(), "1" | "true")
}

/// Quote only when the field would otherwise break the row.
pub(crate) fn escape_if_needed(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Descriptions are quoted whenever present; an absent one stays bare.
fn escape_nonempty(field: &str) -> String {
    if field.is_empty() {
        String::new()
    } else {
        format!("\"{}\"", field.replace('"', "\"\""))
    }
}

pub(crate) fn split_row(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        current.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => current.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => {
                    fields.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
    }

    if in_quotes {
        return Err(
            CoreError::validation("unbalanced quotes in CSV row").with_context("row", line)
        );
    }
    fields.push(current);
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "id,title,done,group,desc\n1,Add login,0,1,\"Use OAuth\"\n2,\"Fix, bug\",1,0,\n";

    #[test]
    fn parses_sample() {
        let tasks = parse_tasks(SAMPLE).unwrap();
        assert_eq!(tasks.len(), 2);

        assert_eq!(tasks[0].id, "1");
        assert_eq!(tasks[0].title, "Add login");
        assert!(!tasks[0].completed);
        assert_eq!(tasks[0].parallel_group, Some(1));
        assert_eq!(tasks[0].body.as_deref(), Some("Use OAuth"));

        assert_eq!(tasks[1].id, "2");
        assert_eq!(tasks[1].title, "Fix, bug");
        assert!(tasks[1].completed);
        assert_eq!(tasks[1].parallel_group, None);
        assert!(tasks[1].body.is_none());
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let tasks = parse_tasks(SAMPLE).unwrap();
        assert_eq!(write_tasks(&tasks), SAMPLE);
    }

    #[test]
    fn done_accepts_true_false() {
        let content = "id,title,done,group,desc\n1,A,TRUE,0,\n2,B,False,0,\n";
        let tasks = parse_tasks(content).unwrap();
        assert!(tasks[0].completed);
        assert!(!tasks[1].completed);
    }

    #[test]
    fn missing_fields_default() {
        let content = "id,title,done,group,desc\n1,Only title\n";
        let tasks = parse_tasks(content).unwrap();
        assert_eq!(tasks[0].title, "Only title");
        assert!(!tasks[0].completed);
        assert_eq!(tasks[0].parallel_group, None);
        assert!(tasks[0].body.is_none());
    }

    #[test]
    fn doubled_quotes_unescape() {
        let content = "id,title,done,group,desc\n1,\"Say \"\"hi\"\"\",0,0,\n";
        let tasks = parse_tasks(content).unwrap();
        assert_eq!(tasks[0].title, "Say \"hi\"");
    }

    #[test]
    fn unbalanced_quotes_error() {
        let content = "id,title,done,group,desc\n1,\"broken,0,0,\n";
        assert!(parse_tasks(content).is_err());
    }

    #[test]
    fn empty_content_yields_no_tasks() {
        assert!(parse_tasks("").unwrap().is_empty());
        assert!(parse_tasks("id,title,done,group,desc\n").unwrap().is_empty());
    }

    #[test]
    fn writer_quotes_titles_with_commas() {
        let tasks = vec![Task::new("9", "a, b").completed(false)];
        let out = write_tasks(&tasks);
        assert!(out.contains("\"a, b\""));
    }

    proptest::proptest! {
        #[test]
        fn titles_survive_quoting(title in "[A-Za-z0-9 ,\"'.:-]{0,40}") {
            let tasks = vec![Task::new("1", title.clone())];
            let written = write_tasks(&tasks);
            let parsed = parse_tasks(&written).unwrap();
            proptest::prop_assert_eq!(&parsed[0].title, &title);
        }
    }
}
