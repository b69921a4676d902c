//! Completed-unit detection from persisted output files
//!
//! A unit is complete when a marker file `<prefix>_<sanitized-key>_<YYYYMMDD>.json`
//! exists in the output directory. The index is built once per run and
//! answers which keys still need fetching.

use crate::decode::read_document;
use crate::units::{QueryTemplate, UnitStatus, WorkUnit};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Filesystem-safe form of a key: lowercase, spaces and slashes become `_`
pub fn sanitize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(' ', "_").replace('/', "_")
}

/// Fields recovered from a marker file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerName {
    pub sanitized_key: String,
    pub date: NaiveDate,
    /// Written by an older pipeline under a `tmp_` prefix
    pub legacy_tmp: bool,
}

/// Encodes and decodes completion marker file names
#[derive(Debug, Clone)]
pub struct NamingConvention {
    prefix: String,
    pattern: Regex,
}

impl NamingConvention {
    pub fn new(prefix: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(
            r"^(tmp_)?{}_(.+)_(\d{{8}})\.json$",
            regex::escape(prefix)
        ))
        .with_context(|| format!("Invalid output prefix: {}", prefix))?;

        Ok(Self {
            prefix: prefix.to_string(),
            pattern,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Marker file name for `key` dated `date_stamp` (`YYYYMMDD`)
    pub fn file_name(&self, key: &str, date_stamp: &str) -> String {
        format!("{}_{}_{}.json", self.prefix, sanitize_key(key), date_stamp)
    }

    /// Parse a file name; foreign names and invalid dates give `None`
    pub fn parse(&self, file_name: &str) -> Option<MarkerName> {
        let caps = self.pattern.captures(file_name)?;
        let date = NaiveDate::parse_from_str(caps.get(3)?.as_str(), "%Y%m%d").ok()?;

        Some(MarkerName {
            sanitized_key: caps.get(2)?.as_str().to_string(),
            date,
            legacy_tmp: caps.get(1).is_some(),
        })
    }
}

/// Which completed units get fetched again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RescanPolicy {
    #[default]
    SkipCompleted,
    /// Refetch keys whose newest marker is not from today
    RescanStale,
    RescanAll,
}

/// What the index knows about one completed key
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedUnit {
    pub latest_date: NaiveDate,
    pub files: Vec<PathBuf>,
    /// Key as stored inside the file, when the scan read file contents
    pub original_key: Option<String>,
}

/// Set of completed keys, by sanitized key
#[derive(Debug, Clone, Default)]
pub struct CompletionIndex {
    completed: BTreeMap<String, CompletedUnit>,
}

impl CompletionIndex {
    /// Index marker names in `dir`; a missing directory is an empty index
    pub fn scan(dir: &Path, naming: &NamingConvention) -> Result<Self> {
        Self::scan_with(dir, naming, None)
    }

    /// Like [`scan`](Self::scan), but each marker must parse and carry `unit_id_field`
    pub fn scan_verified(dir: &Path, naming: &NamingConvention, unit_id_field: &str) -> Result<Self> {
        Self::scan_with(dir, naming, Some(unit_id_field))
    }

    fn scan_with(dir: &Path, naming: &NamingConvention, verify_field: Option<&str>) -> Result<Self> {
        let mut index = Self::default();
        if !dir.exists() {
            return Ok(index);
        }

        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to scan output directory: {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(marker) = naming.parse(&file_name) else {
                continue;
            };

            let original_key = match verify_field {
                Some(field) => match verified_key(&entry.path(), field) {
                    Some(key) => Some(key),
                    None => {
                        warn!("Ignoring marker without '{}': {}", field, file_name);
                        continue;
                    }
                },
                None => None,
            };

            index.insert(marker, entry.path(), original_key);
        }

        debug!("Completion index: {} completed keys in {}", index.len(), dir.display());
        Ok(index)
    }

    fn insert(&mut self, marker: MarkerName, path: PathBuf, original_key: Option<String>) {
        let unit = self
            .completed
            .entry(marker.sanitized_key)
            .or_insert_with(|| CompletedUnit {
                latest_date: marker.date,
                files: Vec::new(),
                original_key: None,
            });

        unit.latest_date = unit.latest_date.max(marker.date);
        unit.files.push(path);
        unit.files.sort();
        if unit.original_key.is_none() {
            unit.original_key = original_key;
        }
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.completed.contains_key(&sanitize_key(key))
    }

    pub fn get(&self, key: &str) -> Option<&CompletedUnit> {
        self.completed.get(&sanitize_key(key))
    }

    /// Sanitized keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.completed.keys().map(String::as_str)
    }

    /// Whether `key` needs fetching under `policy`
    pub fn needs_fetch(&self, key: &str, policy: RescanPolicy, today: NaiveDate) -> bool {
        match (policy, self.get(key)) {
            (_, None) => true,
            (RescanPolicy::RescanAll, Some(_)) => true,
            (RescanPolicy::RescanStale, Some(unit)) => unit.latest_date != today,
            (RescanPolicy::SkipCompleted, Some(_)) => false,
        }
    }

    /// Keys still to fetch, in input order, without sanitized duplicates
    pub fn remaining(&self, keys: &[String], policy: RescanPolicy, today: NaiveDate) -> Vec<String> {
        let mut seen = HashSet::new();
        keys.iter()
            .filter(|k| seen.insert(sanitize_key(k)))
            .filter(|k| self.needs_fetch(k, policy, today))
            .cloned()
            .collect()
    }

    /// Work unit arena for a run: completed keys are `Done`, the rest `Pending`
    pub fn plan(
        &self,
        keys: &[String],
        template: &QueryTemplate,
        policy: RescanPolicy,
        today: NaiveDate,
    ) -> Vec<WorkUnit> {
        let mut seen = HashSet::new();
        keys.iter()
            .filter(|k| seen.insert(sanitize_key(k)))
            .map(|key| {
                let mut unit = WorkUnit::new(key.clone(), template.render(key));
                if !self.needs_fetch(key, policy, today) {
                    unit.status = UnitStatus::Done;
                }
                unit
            })
            .collect()
    }
}

fn verified_key(path: &Path, field: &str) -> Option<String> {
    let doc = read_document(path).into_value()?;
    match doc.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
