//! Renders trajectory data as an indented, YAML-like document.
//!
//! Mapping keys print as `key:`, sequence items as `- `, multi-line strings
//! as `|` blocks with every line kept. Unicode is written as-is and nothing
//! is truncated.

use serde_json::Value;

use super::types::{TrajectoryDocument, TrajectorySource};
use crate::runner::process::ProcessOutcome;

/// Source label used when only the captured streams were available.
pub const RAW_OUTPUT_SOURCE: &str = "raw output";

/// Body written when the run produced no output at all.
pub const EMPTY_BODY: &str = "(no output captured)";

const INDENT: usize = 2;

/// Formats the richest available source for a run.
///
/// Structured session data wins. Otherwise stdout is rendered as a sequence
/// of events when every non-empty line is JSON, else as plain text blocks.
pub fn format_trajectory(
    agent: &str,
    source: Option<&TrajectorySource>,
    outcome: &ProcessOutcome,
) -> TrajectoryDocument {
    let (label, structured, body) = match source {
        Some(source) => (source.label.clone(), true, render(&source.value)),
        None => (RAW_OUTPUT_SOURCE.to_string(), false, render_raw(outcome)),
    };

    let body = if body.trim().is_empty() {
        EMPTY_BODY.to_string()
    } else {
        body
    };

    let mut text = String::new();
    text.push_str("# cakit trajectory\n");
    text.push_str(&format!("agent: {}\n", agent));
    text.push_str(&format!("source: {}\n\n", label));
    text.push_str(&body);
    if !text.ends_with('\n') {
        text.push('\n');
    }

    TrajectoryDocument {
        source: label,
        structured,
        text,
    }
}

/// Renders any JSON value.
pub fn render(value: &Value) -> String {
    let mut lines = Vec::new();
    match value {
        Value::Object(map) if !map.is_empty() => render_map(map, 0, &mut lines),
        Value::Array(items) if !items.is_empty() => render_seq(items, 0, &mut lines),
        Value::String(text) if text.contains('\n') => block_lines(text, 0, &mut lines),
        other => lines.push(scalar(other)),
    }
    lines.join("\n")
}

fn render_raw(outcome: &ProcessOutcome) -> String {
    if let Some(events) = json_lines(&outcome.stdout) {
        return render(&Value::Array(events));
    }
    let mut lines = Vec::new();
    for (key, text) in [("stdout", &outcome.stdout), ("stderr", &outcome.stderr)] {
        if text.trim().is_empty() {
            continue;
        }
        lines.push(format!("{}: |", key));
        block_lines(text, INDENT, &mut lines);
    }
    lines.join("\n")
}

/// Parses text as JSON lines. Every non-empty line must be JSON.
pub fn json_lines(text: &str) -> Option<Vec<Value>> {
    let mut values = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        values.push(serde_json::from_str::<Value>(line).ok()?);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn pad(indent: usize) -> String {
    " ".repeat(indent)
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if s.is_empty() => "\"\"".to_string(),
        Value::String(s) => s.clone(),
        Value::Object(_) => "{}".to_string(),
        Value::Array(_) => "[]".to_string(),
    }
}

fn block_lines(text: &str, indent: usize, out: &mut Vec<String>) {
    let text = text.strip_suffix('\n').unwrap_or(text);
    let prefix = pad(indent);
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            out.push(String::new());
        } else {
            out.push(format!("{}{}", prefix, line));
        }
    }
}

fn render_map(map: &serde_json::Map<String, Value>, indent: usize, out: &mut Vec<String>) {
    let prefix = pad(indent);
    for (key, value) in map {
        match value {
            Value::Object(child) if !child.is_empty() => {
                out.push(format!("{}{}:", prefix, key));
                render_map(child, indent + INDENT, out);
            }
            Value::Array(items) if !items.is_empty() => {
                out.push(format!("{}{}:", prefix, key));
                render_seq(items, indent + INDENT, out);
            }
            Value::String(text) if text.contains('\n') => {
                out.push(format!("{}{}: |", prefix, key));
                block_lines(text, indent + INDENT, out);
            }
            other => out.push(format!("{}{}: {}", prefix, key, scalar(other))),
        }
    }
}

fn render_seq(items: &[Value], indent: usize, out: &mut Vec<String>) {
    let prefix = pad(indent);
    for item in items {
        match item {
            Value::Object(child) if !child.is_empty() => {
                // the first key shares the line with the dash
                let start = out.len();
                render_map(child, indent + INDENT, out);
                if let Some(first) = out.get_mut(start) {
                    *first = format!("{}- {}", prefix, &first[indent + INDENT..]);
                }
            }
            Value::Array(child) if !child.is_empty() => {
                out.push(format!("{}-", prefix));
                render_seq(child, indent + INDENT, out);
            }
            Value::String(text) if text.contains('\n') => {
                out.push(format!("{}- |", prefix));
                block_lines(text, indent + INDENT, out);
            }
            other => out.push(format!("{}- {}", prefix, scalar(other))),
        }
    }
}
