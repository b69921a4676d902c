//! Domain list normalization and known-domain matching
//!
//! Matching runs in two tiers: exact equality, then a suffix match anchored on
//! a label boundary. No public-suffix list is consulted, so an index entry
//! such as `co.uk` matches every host below it.

use crate::decode::read_document;
use crate::merge::normalize_domain;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Split a free-form domain cell on whitespace, `;`, `|` and `,`
pub fn split_to_domains(raw: &str) -> Vec<&str> {
    raw.split(|c: char| c.is_whitespace() || matches!(c, ';' | '|' | ','))
        .map(|s| s.trim().trim_matches('"'))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Normalized, de-duplicated, sorted domains from a free-form cell
pub fn normalize_fqdns(raw: &str) -> Vec<String> {
    split_to_domains(raw)
        .into_iter()
        .filter_map(normalize_domain)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Which tier produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    Suffix,
}

/// Set of known organizational domains
#[derive(Debug, Clone, Default)]
pub struct KnownDomainIndex {
    domains: BTreeSet<String>,
}

impl KnownDomainIndex {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .filter_map(|d| normalize_domain(d.as_ref()))
                .collect(),
        }
    }

    /// Load every domain-looking value from the files in `dirs`.
    ///
    /// JSON/JSONL files contribute string values anywhere in the document,
    /// other files contribute their whitespace/`;`/`,` separated tokens.
    pub fn load_dirs(dirs: &[impl AsRef<Path>]) -> Result<Self> {
        let mut index = Self::default();

        for dir in dirs {
            let dir = dir.as_ref();
            if !dir.is_dir() {
                warn!("Known-domain directory not found: {}", dir.display());
                continue;
            }

            let mut files: Vec<_> = fs::read_dir(dir)
                .with_context(|| format!("Failed to list {}", dir.display()))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            files.sort();

            for file in files {
                index.load_file(&file)?;
            }
        }

        debug!("Known-domain index: {} domains", index.len());
        Ok(index)
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let is_json = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("jsonl")
        );

        if is_json {
            if let Some(doc) = read_document(path).into_value() {
                collect_strings(&doc, &mut |s| self.insert(s));
                return Ok(());
            }
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for token in split_to_domains(&text) {
            self.insert(token);
        }
        Ok(())
    }

    pub fn insert(&mut self, raw: &str) -> bool {
        match normalize_domain(raw) {
            Some(domain) => self.domains.insert(domain),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Known domain matched by `host`, with the tier that matched
    pub fn match_host(&self, host: &str) -> Option<(String, MatchTier)> {
        let host = normalize_domain(host)?;

        if self.domains.contains(&host) {
            return Some((host, MatchTier::Exact));
        }

        // Walk parent domains from the most specific one
        let mut rest = host.as_str();
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            if self.domains.contains(rest) {
                return Some((rest.to_string(), MatchTier::Suffix));
            }
        }

        None
    }

    pub fn matches(&self, host: &str) -> bool {
        self.match_host(host).is_some()
    }

    /// Sorted distinct known domains matched by any of `hosts`
    pub fn match_all<'a>(&self, hosts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        hosts
            .into_iter()
            .filter_map(|h| self.match_host(h).map(|(d, _)| d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn collect_strings(value: &Value, sink: &mut impl FnMut(&str) -> bool) {
    match value {
        Value::String(s) => {
            for token in split_to_domains(s) {
                sink(token);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, sink)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, sink)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_to_domains() {
        assert_eq!(
            split_to_domains("a.com; b.com|c.com , d.com\te.com"),
            vec!["a.com", "b.com", "c.com", "d.com", "e.com"]
        );
    }

    #[test]
    fn test_normalize_fqdns() {
        assert_eq!(
            normalize_fqdns("WWW.Example.com.;www.example.com junk example.org"),
            vec!["example.org", "www.example.com"]
        );
    }

    #[test]
    fn test_exact_then_suffix_match() {
        let index = KnownDomainIndex::new(["example.com", "Vendor.io"]);

        assert_eq!(index.match_host("example.com"), Some(("example.com".into(), MatchTier::Exact)));
        assert_eq!(
            index.match_host("api.eu.vendor.io"),
            Some(("vendor.io".into(), MatchTier::Suffix))
        );
        assert!(index.match_host("other.net").is_none());
    }

    /// Regression test: suffix matches must start at a label boundary
    #[test]
    fn test_suffix_requires_label_boundary() {
        let index = KnownDomainIndex::new(["example.com"]);
        assert!(!index.matches("notexample.com"));
        assert!(!index.matches("example.com.evil.net"));
        assert!(index.matches("sub.example.com"));
    }

    /// Without a public-suffix list a shared suffix entry matches everything below it
    #[test]
    fn test_public_suffix_entries_are_not_special() {
        let index = KnownDomainIndex::new(["co.uk"]);
        assert!(index.matches("anything.co.uk"));
    }

    #[test]
    fn test_match_all_sorted_distinct() {
        let index = KnownDomainIndex::new(["b.com", "a.com"]);
        assert_eq!(
            index.match_all(["x.b.com", "a.com", "y.b.com", "z.org"]),
            vec!["a.com", "b.com"]
        );
    }

    #[test]
    fn test_load_dirs_json_and_text() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("domains.txt"), "acme.com\nbeta.io, gamma.net\n").unwrap();
        fs::write(
            tmp.path().join("vendors.json"),
            r#"{"vendors": [{"domain": "delta.org"}, {"domain": "not a domain"}]}"#,
        )
        .unwrap();

        let index = KnownDomainIndex::load_dirs(&[tmp.path()]).unwrap();
        assert_eq!(index.len(), 4);
        assert!(index.matches("www.delta.org"));
    }
}
