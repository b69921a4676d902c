//! Keyed merge and deduplication of records from several sources
//!
//! Records are keyed by a normalized IPv4 address, domain, or CVE id. When
//! two records share a key one of them wins as a whole; fields are never
//! mixed between records.

use crate::decode::{extract_ipv4s, normalize_ipv4, read_document, results_of, FieldAliases, FETCHED_AT};
use crate::manifest::glob_to_regex;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, warn};

static CVE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^CVE-\d{4}-\d{4,}$").unwrap());

/// Kind of key a merge is performed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Ipv4,
    Domain,
    CveId,
}

impl KeyKind {
    /// Canonical key form, or `None` when the raw value is not a valid key
    pub fn normalize(&self, raw: &str) -> Option<String> {
        match self {
            KeyKind::Ipv4 => normalize_ipv4(raw),
            KeyKind::Domain => normalize_domain(raw),
            KeyKind::CveId => normalize_cve_id(raw),
        }
    }

    /// Sort keys in their natural order (numeric for IPv4)
    pub fn sort(&self, keys: &mut [String]) {
        match self {
            KeyKind::Ipv4 => keys.sort_by_key(|k| k.parse::<Ipv4Addr>().map(u32::from).unwrap_or(u32::MAX)),
            _ => keys.sort(),
        }
    }
}

/// Lowercase, trailing dots stripped, syntax checked
pub fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().trim_end_matches('.').to_lowercase();
    let domain = domain.strip_prefix("*.").unwrap_or(&domain).to_string();

    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return None;
    }

    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });

    labels_ok.then_some(domain)
}

/// Uppercase `CVE-YYYY-NNNN+`
pub fn normalize_cve_id(raw: &str) -> Option<String> {
    let id = raw.trim().to_uppercase();
    CVE_ID_RE.is_match(&id).then_some(id)
}

/// Which of two records with the same key is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// The record seen later replaces the earlier one
    #[default]
    LastWriteWins,
    /// The record with the later `fetched_at` wins; ties fall back to last write,
    /// a missing timestamp loses against a present one
    LatestFetchedAt,
}

/// A record with its normalized key and provenance
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub key: String,
    pub source: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub record: Value,
}

/// What happened to an offered record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    Inserted,
    Replaced,
    KeptExisting,
    /// No valid key could be found
    Rejected,
}

pub struct MergeDeduplicator {
    kind: KeyKind,
    policy: MergePolicy,
    key_aliases: FieldAliases,
    records: BTreeMap<String, KeyedRecord>,
    rejected: usize,
}

impl MergeDeduplicator {
    pub fn new(kind: KeyKind, policy: MergePolicy, key_aliases: FieldAliases) -> Self {
        Self {
            kind,
            policy,
            key_aliases,
            records: BTreeMap::new(),
            rejected: 0,
        }
    }

    /// Offer one record from `source`
    pub fn offer(&mut self, source: &str, record: Value) -> MergeDecision {
        let Some(key) = self
            .key_aliases
            .lookup_str(&record)
            .and_then(|raw| self.kind.normalize(raw))
        else {
            self.rejected += 1;
            return MergeDecision::Rejected;
        };

        let incoming = KeyedRecord {
            key: key.clone(),
            source: source.to_string(),
            fetched_at: fetched_at_of(&record),
            record,
        };

        let decision = match self.records.get(&key) {
            None => MergeDecision::Inserted,
            Some(existing) if self.incoming_wins(existing, &incoming) => MergeDecision::Replaced,
            Some(_) => return MergeDecision::KeptExisting,
        };
        self.records.insert(key, incoming);
        decision
    }

    fn incoming_wins(&self, existing: &KeyedRecord, incoming: &KeyedRecord) -> bool {
        match self.policy {
            MergePolicy::LastWriteWins => true,
            MergePolicy::LatestFetchedAt => match (existing.fetched_at, incoming.fetched_at) {
                (Some(old), Some(new)) => new >= old,
                (Some(_), None) => false,
                (None, _) => true,
            },
        }
    }

    /// Offer every record of every source, in order
    pub fn merge_sources<I>(&mut self, sources: I)
    where
        I: IntoIterator<Item = (String, Vec<Value>)>,
    {
        for (source, records) in sources {
            for record in records {
                self.offer(&source, record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn get(&self, key: &str) -> Option<&KeyedRecord> {
        self.kind.normalize(key).and_then(|k| self.records.get(&k))
    }

    /// Current winners, in lexical key order
    pub fn records(&self) -> impl Iterator<Item = &KeyedRecord> {
        self.records.values()
    }

    /// Deduplicated records in natural key order
    pub fn into_records(self) -> Vec<KeyedRecord> {
        let mut keys: Vec<String> = self.records.keys().cloned().collect();
        self.kind.sort(&mut keys);
        let mut records = self.records;
        keys.into_iter().filter_map(|k| records.remove(&k)).collect()
    }
}

fn fetched_at_of(record: &Value) -> Option<DateTime<Utc>> {
    FETCHED_AT
        .lookup_str(record)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Union of key sets from several sources
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeySetMerge {
    /// All distinct keys in natural order
    pub combined: Vec<String>,
    /// Distinct valid keys contributed by each source
    pub per_source: BTreeMap<String, usize>,
    /// Keys found in exactly one source, per source
    pub exclusive: BTreeMap<String, usize>,
    pub rejected: usize,
}

/// Union keys from named sources, counting per-source and exclusive keys
pub fn merge_key_sets(kind: KeyKind, sources: &[(String, Vec<String>)]) -> KeySetMerge {
    let mut owners: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    let mut result = KeySetMerge::default();

    for (source, keys) in sources {
        let mut distinct = BTreeSet::new();
        for raw in keys {
            match kind.normalize(raw) {
                Some(key) => {
                    distinct.insert(key.clone());
                    owners.entry(key).or_default().insert(source.as_str());
                }
                None => result.rejected += 1,
            }
        }
        *result.per_source.entry(source.clone()).or_default() += distinct.len();
        result.exclusive.entry(source.clone()).or_default();
    }

    for owner_set in owners.values() {
        if owner_set.len() == 1 {
            if let Some(only) = owner_set.iter().next() {
                *result.exclusive.entry(only.to_string()).or_default() += 1;
            }
        }
    }

    result.combined = owners.into_keys().collect();
    kind.sort(&mut result.combined);
    result
}

/// IPv4 addresses from a source: a directory of harvest outputs (filtered by
/// `glob`), a JSON/JSONL document, or a plain list with one address per line.
pub fn read_ipv4_source(path: &Path, glob: &str) -> Result<Vec<String>> {
    let mut found = BTreeSet::new();

    if path.is_dir() {
        let pattern = glob_to_regex(glob)?;
        let mut files: Vec<_> = fs::read_dir(path)
            .with_context(|| format!("Failed to list {}", path.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| pattern.is_match(&n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        for file in files {
            match read_document(&file).into_value() {
                Some(doc) => ipv4s_in_document(&doc, &mut found),
                None => warn!("Skipping unparseable source file {}", file.display()),
            }
        }
    } else {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match crate::decode::parse_document(&text).into_value() {
            Some(doc) => ipv4s_in_document(&doc, &mut found),
            None => {
                for line in text.lines() {
                    if let Some(ip) = normalize_ipv4(line.split(',').next().unwrap_or(line)) {
                        found.insert(ip);
                    }
                }
            }
        }
    }

    debug!("{}: {} distinct IPv4 addresses", path.display(), found.len());
    Ok(found.into_iter().collect())
}

fn ipv4s_in_document(doc: &Value, found: &mut BTreeSet<String>) {
    let records = results_of(doc);
    if records.is_empty() {
        found.extend(extract_ipv4s(doc));
    } else {
        for record in records {
            found.extend(extract_ipv4s(record));
        }
    }
}
