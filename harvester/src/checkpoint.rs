// checkpoint.rs - Per-query partial progress for resumable pagination
//
// Every fetched page is stored under its page number so that an interrupted
// walk can restart and request only the pages it does not have yet. Files are
// replaced atomically, so a kill at any moment leaves either the previous or
// the new checkpoint on disk.

use crate::completion::sanitize_key;
use crate::util::{ensure_directory, write_json_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current checkpoint format version - bump when making breaking changes
pub const CHECKPOINT_VERSION: u32 = 1;

/// Suffix of checkpoint files inside the checkpoint directory
pub const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMeta {
    pub version: u32,
    /// Unit key or query name this checkpoint belongs to
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial progress of one paginated query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub query: String,
    pub total_pages: Option<u32>,
    pub pages_done: BTreeSet<u32>,
    pub results_by_page: BTreeMap<u32, Vec<Value>>,
    pub meta: CheckpointMeta,
}

impl Checkpoint {
    pub fn new(label: &str, query: &str) -> Self {
        let now = Utc::now();
        Self {
            query: query.to_string(),
            total_pages: None,
            pages_done: BTreeSet::new(),
            results_by_page: BTreeMap::new(),
            meta: CheckpointMeta {
                version: CHECKPOINT_VERSION,
                label: label.to_string(),
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Record a fetched page. The known page total only ever grows.
    pub fn record_page(&mut self, page: u32, results: Vec<Value>, total_pages: Option<u32>) {
        if let Some(total) = total_pages {
            self.total_pages = Some(self.total_pages.map_or(total, |known| known.max(total)));
        }
        self.pages_done.insert(page);
        self.results_by_page.insert(page, results);
    }

    /// Pages still to fetch, ascending. Before the total is known only page 1 is missing.
    pub fn missing_pages(&self) -> Vec<u32> {
        match self.total_pages {
            Some(total) => (1..=total).filter(|p| !self.pages_done.contains(p)).collect(),
            None if self.pages_done.contains(&1) => Vec::new(),
            None => vec![1],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_pages.is_some() && self.missing_pages().is_empty()
    }

    pub fn results_count(&self) -> usize {
        self.results_by_page.values().map(Vec::len).sum()
    }

    /// All stored records concatenated in page order
    pub fn results(&self) -> Vec<Value> {
        self.results_by_page.values().flatten().cloned().collect()
    }

    /// Final output document body:
    /// `{query, total_pages, pages_done, results_count, results, exported_at}`
    pub fn consolidate(&self) -> Map<String, Value> {
        let results = self.results();
        let mut doc = Map::new();
        doc.insert("query".into(), Value::String(self.query.clone()));
        doc.insert(
            "total_pages".into(),
            Value::from(self.total_pages.unwrap_or(self.pages_done.len() as u32)),
        );
        doc.insert(
            "pages_done".into(),
            Value::Array(self.pages_done.iter().map(|p| Value::from(*p)).collect()),
        );
        doc.insert("results_count".into(), Value::from(results.len()));
        doc.insert("results".into(), Value::Array(results));
        doc.insert(
            "exported_at".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        doc
    }
}

/// Directory of checkpoint files, one per unit or named query
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checkpoint file path for a unit key or query name
    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", sanitize_key(label), CHECKPOINT_SUFFIX))
    }

    /// Load the checkpoint for `label` if it belongs to `query`.
    ///
    /// A checkpoint that cannot be parsed, has another version, or was written
    /// for a different query is deleted and reported as absent.
    pub fn load(&self, label: &str, query: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(label);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;

        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(cp) => cp,
            Err(e) => {
                warn!("Discarding unreadable checkpoint {}: {}", path.display(), e);
                self.remove_file(&path)?;
                return Ok(None);
            }
        };

        if checkpoint.meta.version != CHECKPOINT_VERSION {
            warn!(
                "Discarding checkpoint {} with version {} (current {})",
                path.display(),
                checkpoint.meta.version,
                CHECKPOINT_VERSION
            );
            self.remove_file(&path)?;
            return Ok(None);
        }

        if checkpoint.query != query {
            warn!(
                "Discarding checkpoint {}: stored query {:?} differs from {:?}",
                path.display(),
                checkpoint.query,
                query
            );
            self.remove_file(&path)?;
            return Ok(None);
        }

        debug!(
            "Loaded checkpoint {} ({} pages done, total {:?})",
            path.display(),
            checkpoint.pages_done.len(),
            checkpoint.total_pages
        );
        Ok(Some(checkpoint))
    }

    /// Stored checkpoint for the same query, or a fresh one
    pub fn load_or_new(&self, label: &str, query: &str) -> Result<Checkpoint> {
        Ok(self
            .load(label, query)?
            .unwrap_or_else(|| Checkpoint::new(label, query)))
    }

    /// Atomically persist a checkpoint under its label
    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        ensure_directory(&self.dir)?;
        checkpoint.meta.updated_at = Utc::now();
        let path = self.path_for(&checkpoint.meta.label);
        write_json_atomic(&path, checkpoint)
            .with_context(|| format!("Failed to save checkpoint: {}", path.display()))?;
        debug!(
            "Saved checkpoint {} ({}/{} pages)",
            path.display(),
            checkpoint.pages_done.len(),
            checkpoint
                .total_pages
                .map_or_else(|| "?".to_string(), |t| t.to_string())
        );
        Ok(())
    }

    /// Delete the checkpoint for `label` if present
    pub fn delete(&self, label: &str) -> Result<()> {
        self.remove_file(&self.path_for(label))
    }

    /// Sanitized labels of all checkpoints currently on disk
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut labels = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list checkpoints in {}", self.dir.display()))?
        {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(label) = name.strip_suffix(CHECKPOINT_SUFFIX) {
                if !label.starts_with('.') {
                    labels.push(label.to_string());
                }
            }
        }
        labels.sort();
        Ok(labels)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to delete checkpoint: {}", path.display()))?;
        }
        Ok(())
    }
}
