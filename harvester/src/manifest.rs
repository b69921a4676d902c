//! Input-set fingerprints used to skip needless export rebuilds
//!
//! The fingerprint is the SHA-256 of the compact, key-sorted JSON encoding of
//! the name-sorted `{name, size, mtime}` list of matching files.

use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Whole seconds since the Unix epoch
    pub mtime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFingerprint {
    pub sha256: String,
    pub file_count: usize,
    pub files: Vec<FileEntry>,
}

impl ManifestFingerprint {
    /// Fingerprint of the files in `dir` whose names match `glob`
    pub fn compute(dir: &Path, glob: &str) -> Result<Self> {
        let pattern = glob_to_regex(glob)?;
        let mut files = Vec::new();

        if dir.exists() {
            for entry in fs::read_dir(dir)
                .with_context(|| format!("Failed to list {}", dir.display()))?
            {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !pattern.is_match(&name) {
                    continue;
                }

                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }

                let modified = metadata
                    .modified()
                    .with_context(|| format!("No modification time for {}", name))?;

                files.push(FileEntry {
                    name,
                    size: metadata.len(),
                    mtime: DateTime::<Utc>::from(modified).timestamp(),
                });
            }
        }

        Self::from_entries(files)
    }

    /// Fingerprint of an explicit entry list (sorted by name before hashing)
    pub fn from_entries(mut files: Vec<FileEntry>) -> Result<Self> {
        files.sort_by(|a, b| a.name.cmp(&b.name));

        // serde_json objects are key-sorted without the preserve_order feature
        let canonical = serde_json::to_string(&serde_json::to_value(&files)?)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());

        Ok(Self {
            sha256: format!("{:x}", hasher.finalize()),
            file_count: files.len(),
            files,
        })
    }

    /// Whether `new` differs from the previously saved fingerprint
    pub fn changed(old: Option<&ManifestFingerprint>, new: &ManifestFingerprint) -> bool {
        match old {
            Some(old) => old.sha256 != new.sha256,
            None => true,
        }
    }

    /// Previously saved manifest; unreadable files count as absent
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring unreadable manifest {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
            .with_context(|| format!("Failed to save manifest: {}", path.display()))?;
        debug!("Saved manifest {} ({} files)", path.display(), self.file_count);
        Ok(())
    }

    /// Paths of the fingerprinted files inside `dir`
    pub fn paths_in(&self, dir: &Path) -> Vec<PathBuf> {
        self.files.iter().map(|f| dir.join(&f.name)).collect()
    }
}

/// Translate a file-name glob (`*`, `?`) into an anchored regex
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).with_context(|| format!("Invalid glob: {}", glob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn set_mtime(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("harvest_*_*.json").unwrap();
        assert!(re.is_match("harvest_a.com_20240101.json"));
        assert!(!re.is_match("harvest_all.csv"));
        assert!(!re.is_match("xharvest_a_b.json"));

        let re = glob_to_regex("file?.txt").unwrap();
        assert!(re.is_match("file1.txt"));
        assert!(!re.is_match("file12.txt"));
    }

    #[test]
    fn test_fingerprint_independent_of_listing_order() {
        let a = FileEntry { name: "a.json".into(), size: 1, mtime: 10 };
        let b = FileEntry { name: "b.json".into(), size: 2, mtime: 20 };

        let first = ManifestFingerprint::from_entries(vec![a.clone(), b.clone()]).unwrap();
        let second = ManifestFingerprint::from_entries(vec![b, a]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.sha256.len(), 64);
        assert!(!ManifestFingerprint::changed(Some(&first), &second));
        assert!(ManifestFingerprint::changed(None, &second));
    }

    #[test]
    fn test_mtime_change_changes_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvest_a_20240101.json");
        fs::write(&path, "{}").unwrap();
        fs::write(tmp.path().join("ignored.txt"), "x").unwrap();
        set_mtime(&path, 1_700_000_000);

        let before = ManifestFingerprint::compute(tmp.path(), "harvest_*.json").unwrap();
        assert_eq!(before.file_count, 1);
        assert_eq!(before.files[0].mtime, 1_700_000_000);

        let again = ManifestFingerprint::compute(tmp.path(), "harvest_*.json").unwrap();
        assert!(!ManifestFingerprint::changed(Some(&before), &again));

        set_mtime(&path, 1_700_000_100);
        let after = ManifestFingerprint::compute(tmp.path(), "harvest_*.json").unwrap();
        assert!(ManifestFingerprint::changed(Some(&before), &after));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let manifest_path = tmp.path().join("export").join("_manifest.json");

        let fp = ManifestFingerprint::compute(tmp.path(), "*.json").unwrap();
        assert_eq!(fp.file_count, 0);
        fp.save(&manifest_path).unwrap();
        assert_eq!(ManifestFingerprint::load(&manifest_path), Some(fp));

        fs::write(&manifest_path, "garbage").unwrap();
        assert!(ManifestFingerprint::load(&manifest_path).is_none());
    }
}
