//! Strict accessors for decoded JSON payloads.
//!
//! Every accessor reads exactly one named field and reports a precise
//! reason when it is missing or has the wrong type. There are no aliases.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Result of a strict field read. The error is a human-readable reason.
pub type Field<T> = Result<T, String>;

/// Reads `key` from an object.
pub fn get<'a>(value: &'a Value, key: &str) -> Field<&'a Value> {
    value
        .as_object()
        .ok_or_else(|| format!("expected an object holding '{}'", key))?
        .get(key)
        .ok_or_else(|| format!("missing field '{}'", key))
}

/// Follows a path of object keys.
pub fn at<'a>(value: &'a Value, path: &[&str]) -> Field<&'a Value> {
    let mut current = value;
    for (depth, key) in path.iter().enumerate() {
        current = get(current, key).map_err(|_| format!("missing field '{}'", path[..=depth].join(".")))?;
    }
    Ok(current)
}

pub fn object<'a>(value: &'a Value, key: &str) -> Field<&'a Map<String, Value>> {
    get(value, key)?
        .as_object()
        .ok_or_else(|| format!("field '{}' is not an object", key))
}

pub fn array<'a>(value: &'a Value, key: &str) -> Field<&'a Vec<Value>> {
    get(value, key)?
        .as_array()
        .ok_or_else(|| format!("field '{}' is not a list", key))
}

pub fn string<'a>(value: &'a Value, key: &str) -> Field<&'a str> {
    get(value, key)?
        .as_str()
        .ok_or_else(|| format!("field '{}' is not a string", key))
}

/// A non-negative integer field. Booleans and fractions are rejected.
pub fn uint(value: &Value, key: &str) -> Field<u64> {
    as_uint(get(value, key)?).ok_or_else(|| format!("field '{}' is not a non-negative integer", key))
}

/// A numeric field.
pub fn number(value: &Value, key: &str) -> Field<f64> {
    get(value, key)?
        .as_f64()
        .ok_or_else(|| format!("field '{}' is not a number", key))
}

pub fn as_uint(value: &Value) -> Option<u64> {
    value.as_u64()
}

/// An optional string field: absent or null is `None`, other types are errors.
pub fn opt_string<'a>(value: &'a Value, key: &str) -> Field<Option<&'a str>> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(format!("field '{}' is not a string", key)),
    }
}

/// A non-blank string, trimmed.
pub fn non_blank(value: &Value, key: &str) -> Field<String> {
    let text = string(value, key)?.trim();
    if text.is_empty() {
        Err(format!("field '{}' is empty", key))
    } else {
        Ok(text.to_string())
    }
}

/// The `type` field of an event, if it is a string.
pub fn event_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Parses every line of `text` that holds a JSON object.
///
/// Lines that are not JSON are skipped: agents interleave log text with
/// their event stream.
pub fn json_objects(text: &str) -> Vec<Value> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
        .collect()
}

/// Parses stdout that must be a single JSON object.
///
/// Leading log lines are tolerated: when the whole text is not JSON the
/// last line that parses as an object is used.
pub fn terminal_object(text: &str) -> Field<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("stdout is empty".to_string());
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    json_objects(trimmed)
        .pop()
        .ok_or_else(|| "stdout does not contain a JSON object".to_string())
}

pub fn read_json(path: &Path) -> Field<Value> {
    let text = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid JSON in {}: {}", path.display(), e))
}

/// Reads a JSONL file. Every non-empty line must be a JSON value.
pub fn read_json_lines(path: &Path) -> Field<Vec<Value>> {
    let text = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut values = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = serde_json::from_str(line)
            .map_err(|e| format!("invalid JSON on line {} of {}: {}", index + 1, path.display(), e))?;
        values.push(value);
    }
    Ok(values)
}

/// Compiles a constant pattern on first use.
pub fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_reads() {
        let value = json!({"usage": {"prompt_tokens": 12, "flag": true, "neg": -1, "frac": 1.5}, "name": "x"});
        assert_eq!(uint(at(&value, &["usage"]).unwrap(), "prompt_tokens"), Ok(12));
        assert!(uint(&value["usage"], "flag").is_err());
        assert!(uint(&value["usage"], "neg").is_err());
        assert!(uint(&value["usage"], "frac").is_err());
        assert_eq!(
            at(&value, &["usage", "completion_tokens"]).unwrap_err(),
            "missing field 'usage.completion_tokens'"
        );
        assert_eq!(string(&value, "name"), Ok("x"));
        assert_eq!(opt_string(&value, "absent"), Ok(None));
        assert!(opt_string(&value, "usage").is_err());
    }

    #[test]
    fn test_json_objects_skip_noise() {
        let text = "starting...\n{\"type\":\"a\"}\n[1,2]\n{broken\n{\"type\":\"b\"}\n";
        let events = json_objects(text);
        assert_eq!(events.len(), 2);
        assert_eq!(event_type(&events[1]), Some("b"));
    }

    #[test]
    fn test_terminal_object() {
        assert_eq!(terminal_object("{\"a\":1}\n").unwrap()["a"], 1);
        assert_eq!(terminal_object("warning: x\n{\"a\":2}").unwrap()["a"], 2);
        assert!(terminal_object("   ").is_err());
        assert!(terminal_object("no json").is_err());
    }
}
