//! Nested JSON records to flat, string-valued rows

use crate::config::ExportConfig;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One flattened record: dotted key to cell text, sorted by key
pub type FlatRow = BTreeMap<String, String>;

/// Flattening rules shared by every row of an export
#[derive(Debug, Clone)]
pub struct FlattenNormalizer {
    separator: String,
    elided_suffixes: Vec<String>,
    truncated_suffixes: Vec<String>,
    max_cell_chars: usize,
    truncation_marker: String,
}

impl Default for FlattenNormalizer {
    fn default() -> Self {
        Self::from_config(&ExportConfig::default())
    }
}

impl FlattenNormalizer {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            separator: config.list_separator.clone(),
            elided_suffixes: config.elided_suffixes.clone(),
            truncated_suffixes: config.truncated_suffixes.clone(),
            max_cell_chars: config.max_cell_chars,
            truncation_marker: config.truncation_marker.clone(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Flatten one record. A non-object top-level value lands under `value`.
    pub fn flatten(&self, record: &Value) -> FlatRow {
        let mut row = FlatRow::new();
        match record {
            Value::Object(_) => self.flatten_into(record, "", &mut row),
            other => self.flatten_into(other, "value", &mut row),
        }
        row
    }

    fn flatten_into(&self, value: &Value, key: &str, row: &mut FlatRow) {
        if !key.is_empty() && has_suffix(key, &self.elided_suffixes) {
            return;
        }

        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let child = if key.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", key, k)
                    };
                    self.flatten_into(v, &child, row);
                }
            }
            Value::Array(items) => {
                let nested = items.iter().any(|v| v.is_object() || v.is_array());
                let (cell, count) = if nested {
                    (clean_text(&canonical_json(value)), items.len())
                } else {
                    let parts: Vec<String> = items
                        .iter()
                        .filter(|v| !v.is_null())
                        .map(clean_scalar)
                        .collect();
                    let count = parts.len();
                    (clean_text(&parts.join(&self.separator)), count)
                };
                self.put(row, key, cell);
                row.insert(format!("{}_count", key), count.to_string());
            }
            scalar => self.put(row, key, clean_scalar(scalar)),
        }
    }

    fn put(&self, row: &mut FlatRow, key: &str, cell: String) {
        let cell = if has_suffix(key, &self.truncated_suffixes) {
            self.truncate(cell)
        } else {
            cell
        };
        row.insert(key.to_string(), cell);
    }

    fn truncate(&self, cell: String) -> String {
        if cell.chars().count() <= self.max_cell_chars {
            return cell;
        }
        let mut cut: String = cell.chars().take(self.max_cell_chars).collect();
        cut.push_str(&self.truncation_marker);
        cut
    }
}

/// `key` equals `suffix` or ends with `.suffix`
fn has_suffix(key: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|s| {
        key == s
            || key
                .strip_suffix(s.as_str())
                .map_or(false, |head| head.ends_with('.'))
    })
}

/// Compact JSON with object keys sorted
pub fn canonical_json(value: &Value) -> String {
    // serde_json::Map is a BTreeMap unless preserve_order is enabled
    value.to_string()
}

fn clean_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => clean_text(s),
        nested => clean_text(&canonical_json(nested)),
    }
}

/// Newlines and tabs become spaces; surrounding whitespace and quotes are trimmed
pub fn clean_text(text: &str) -> String {
    let text = text
        .replace("\r\n", " ")
        .replace(['\n', '\r', '\t'], " ");
    text.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string()
}

/// Sorted union of the keys of all rows
pub fn column_superset<'a>(rows: impl IntoIterator<Item = &'a FlatRow>) -> Vec<String> {
    rows.into_iter()
        .flat_map(|r| r.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
