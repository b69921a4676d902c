//! Work units: input key lists and per-unit query rendering
//!
//! Supports:
//! - Plain text or CSV with one key per line (first column, `#` comments)
//! - CSV with a header naming the key column (`key`, `domain`, `ip`, or the configured unit id field)
//! - JSON arrays of strings, arrays of objects, or `{"keys": [...]}`
//!
//! Duplicate keys (after sanitization) keep their first occurrence.

use crate::completion::sanitize_key;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

/// Column names recognized as the key column in headed CSV files
const KEY_COLUMNS: &[&str] = &["key", "domain", "ip", "query", "name"];

/// Lifecycle of one unit within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in progress",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One key to harvest together with its rendered query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkUnit {
    pub key: String,
    pub query: String,
    pub status: UnitStatus,
}

impl WorkUnit {
    pub fn new(key: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            query: query.into(),
            status: UnitStatus::Pending,
        }
    }
}

/// Per-unit query text with `{key}` and `{key_lower}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    template: String,
}

impl QueryTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, key: &str) -> String {
        self.template
            .replace("{key_lower}", &key.to_lowercase())
            .replace("{key}", key)
    }
}

/// Input format for key files
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputFormat {
    /// One key per line, or CSV
    Lines,
    Json,
}

impl InputFormat {
    /// Detect format from file extension; anything but `.json` is line based
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("json") => Self::Json,
            _ => Self::Lines,
        }
    }
}

/// Parse the key list from a file
pub fn parse_key_file(path: &Path, key_column: &str) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;

    let keys = match InputFormat::from_path(path) {
        InputFormat::Lines => parse_line_keys(&content, key_column)?,
        InputFormat::Json => parse_json_keys(&content, key_column)?,
    };

    Ok(dedupe_keys(keys))
}

/// Keys from plain text or CSV content
pub fn parse_line_keys(content: &str, key_column: &str) -> Result<Vec<String>> {
    let content = content.trim_start_matches('\u{feff}');
    let first_line = match content.lines().find(|l| !l.trim().is_empty()) {
        Some(line) => line,
        None => return Ok(Vec::new()),
    };

    let header_idx = first_line
        .split(',')
        .map(|h| h.trim().trim_matches('"').to_lowercase())
        .position(|h| h == key_column.to_lowercase() || KEY_COLUMNS.contains(&h.as_str()));

    let mut keys = Vec::new();

    if let Some(idx) = header_idx {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());

        for result in reader.records() {
            let record = result.context("Failed to parse CSV record")?;
            if let Some(key) = record.get(idx).map(str::trim).filter(|k| !k.is_empty()) {
                keys.push(key.to_string());
            }
        }
    } else {
        for line in content.lines() {
            let key = line.split(',').next().unwrap_or(line).trim().trim_matches('"');
            if key.is_empty() || key.starts_with('#') {
                continue;
            }
            keys.push(key.to_string());
        }
    }

    Ok(keys)
}

/// Keys from JSON content
pub fn parse_json_keys(content: &str, key_column: &str) -> Result<Vec<String>> {
    let value: Value = serde_json::from_str(content).context("Failed to parse JSON content")?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("keys") {
            Some(Value::Array(items)) => items,
            Some(_) => bail!("'keys' field must be an array"),
            None => bail!("JSON object must have a 'keys' array field"),
        },
        _ => bail!("JSON must be an array of keys or an object with a 'keys' field"),
    };

    let keys = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => std::iter::once(key_column)
                .chain(KEY_COLUMNS.iter().copied())
                .find_map(|col| obj.get(col).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|k| !k.is_empty())
        .collect();

    Ok(keys)
}

/// Drop keys whose sanitized form was already seen, keeping input order
pub fn dedupe_keys(keys: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|k| seen.insert(sanitize_key(k)))
        .collect()
}
