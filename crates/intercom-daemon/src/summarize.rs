//! One-line summaries of tool inputs for the mission feedback log.
//!
//! Keyed by the tool name the child agent reports. Every summary fits on
//! one line and is capped at 120 characters.

use std::path::Path;

use serde_json::Value;

/// Hard cap on a summary line.
pub const MAX_SUMMARY_CHARS: usize = 120;

/// Summarise a tool invocation's input to one line.
///
/// File tools show the trailing path components, shell tools the first
/// line of the command, search tools their pattern. Unknown tools fall
/// back to a generic label.
pub fn summarize(tool: &str, input: &Value) -> String {
    let detail = match tool {
        "Read" | "Edit" | "Write" | "NotebookEdit" => input
            .get("file_path")
            .and_then(Value::as_str)
            .map(short_path)
            .unwrap_or_default(),
        "Bash" => first_line(str_field(input, "command"), 80),
        "Grep" | "Glob" => str_field(input, "pattern").to_string(),
        "Agent" | "Task" => {
            let desc = str_field(input, "description");
            if desc.is_empty() {
                truncate(str_field(input, "prompt"), 60)
            } else {
                desc.to_string()
            }
        }
        "Skill" => str_field(input, "skill").to_string(),
        "WebSearch" | "WebFetch" => {
            let q = str_field(input, "query");
            truncate(if q.is_empty() { str_field(input, "url") } else { q }, 60)
        }
        _ => String::new(),
    };

    let summary = if detail.is_empty() {
        tool.to_string()
    } else {
        detail
    };
    truncate(&summary, MAX_SUMMARY_CHARS)
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Last two components of a path, enough to recognise the file.
fn short_path(path: &str) -> String {
    let p = Path::new(path);
    let parts: Vec<&str> = p
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    match parts.as_slice() {
        [] => path.to_string(),
        [one] => (*one).to_string(),
        [.., a, b] => format!("{a}/{b}"),
    }
}

fn first_line(s: &str, max: usize) -> String {
    truncate(s.lines().next().unwrap_or(""), max)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
