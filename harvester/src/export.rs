//! Canonical CSV export of harvested output files
//!
//! Every output file matching the export glob is read with the lenient
//! decoder, its records flattened, and all rows written to one CSV with a
//! UTF-8 BOM, every field quoted, `\n` line endings, and a sorted header.
//! The rebuild is skipped when the input fingerprint has not changed.

use crate::completion::NamingConvention;
use crate::config::HarvestConfig;
use crate::decode::{read_document, results_of, ParsedDocument};
use crate::domain_utils::{normalize_fqdns, KnownDomainIndex};
use crate::flatten::{column_superset, FlatRow, FlattenNormalizer};
use crate::manifest::ManifestFingerprint;
use crate::util::write_atomic;
use anyhow::{bail, Context, Result};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Rows collected from a set of output files
#[derive(Debug, Default)]
pub struct CollectedRows {
    pub rows: Vec<FlatRow>,
    pub files_read: usize,
    pub files_skipped: usize,
}

/// Turns output documents into flat rows with traceability columns
pub struct RowBuilder<'a> {
    normalizer: &'a FlattenNormalizer,
    naming: &'a NamingConvention,
    unit_id_field: &'a str,
    known_domains: Option<&'a KnownDomainIndex>,
}

impl<'a> RowBuilder<'a> {
    pub fn new(
        normalizer: &'a FlattenNormalizer,
        naming: &'a NamingConvention,
        unit_id_field: &'a str,
        known_domains: Option<&'a KnownDomainIndex>,
    ) -> Self {
        Self {
            normalizer,
            naming,
            unit_id_field,
            known_domains,
        }
    }

    /// Rows for every object record in `files`, in the given order
    pub fn collect(&self, files: &[PathBuf]) -> CollectedRows {
        let mut collected = CollectedRows::default();

        for path in files {
            match read_document(path) {
                ParsedDocument::Parsed(_, doc) => {
                    collected.files_read += 1;
                    collected.rows.extend(self.rows_for(path, &doc));
                }
                ParsedDocument::Unparseable(errors) => {
                    collected.files_skipped += 1;
                    warn!("Skipping {}: {}", path.display(), errors.join("; "));
                }
            }
        }

        collected
    }

    fn rows_for(&self, path: &Path, doc: &Value) -> Vec<FlatRow> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let marker = self.naming.parse(&file_name);

        let source_key = doc
            .get(self.unit_id_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| marker.as_ref().map(|m| m.sanitized_key.clone()))
            .unwrap_or_default();
        let scan_date = marker
            .as_ref()
            .map(|m| m.date.format("%Y%m%d").to_string())
            .unwrap_or_default();

        results_of(doc)
            .iter()
            .filter(|r| r.is_object())
            .map(|record| {
                let mut row = self.normalizer.flatten(record);
                self.apply_fqdns(record, &mut row);
                row.insert("source_file".to_string(), file_name.clone());
                row.insert("source_key".to_string(), source_key.clone());
                row.insert("scan_date".to_string(), scan_date.clone());
                row
            })
            .collect()
    }

    /// Rewrite `fqdns` as a normalized list and add known-domain match columns
    fn apply_fqdns(&self, record: &Value, row: &mut FlatRow) {
        let raw = match record.get("fqdns") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(";"),
            _ => String::new(),
        };
        let fqdns = normalize_fqdns(&raw);

        if record.get("fqdns").is_some() {
            row.insert("fqdns".to_string(), fqdns.join(self.normalizer.separator()));
            row.insert("fqdns_count".to_string(), fqdns.len().to_string());
        }

        if let Some(index) = self.known_domains {
            let matches = index.match_all(fqdns.iter().map(String::as_str));
            row.insert(
                "known_domain_hit".to_string(),
                if matches.is_empty() { "0" } else { "1" }.to_string(),
            );
            row.insert("known_domain_match".to_string(), matches.join(";"));
        }
    }
}

/// Size of a written CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvStats {
    pub rows: usize,
    pub columns: usize,
}

/// Render rows as canonical CSV bytes (BOM, quote-all, `\n`, sorted header)
pub fn render_canonical_csv(rows: &[FlatRow]) -> Result<(Vec<u8>, CsvStats)> {
    let headers = column_superset(rows);

    let mut buffer = UTF8_BOM.to_vec();
    {
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(&mut buffer);

        writer.write_record(&headers)?;
        for row in rows {
            writer.write_record(headers.iter().map(|h| row.get(h).map_or("", String::as_str)))?;
        }
        writer.flush()?;
    }

    Ok((
        buffer,
        CsvStats {
            rows: rows.len(),
            columns: headers.len(),
        },
    ))
}

/// Atomically replace `path` with the canonical CSV of `rows`.
/// With no rows the existing file is left untouched and an error is returned.
pub fn write_canonical_csv(rows: &[FlatRow], path: &Path) -> Result<CsvStats> {
    if rows.is_empty() {
        bail!("No rows collected; not writing {}", path.display());
    }

    let (bytes, stats) = render_canonical_csv(rows)?;
    write_atomic(path, &bytes)
        .with_context(|| format!("Failed to write CSV: {}", path.display()))?;

    info!(
        "Wrote {} rows x {} columns to {}",
        stats.rows,
        stats.columns,
        path.display()
    );
    Ok(stats)
}

/// Result of a manifest-gated export
#[derive(Debug, Clone, PartialEq)]
pub enum ExportOutcome {
    Unchanged {
        file_count: usize,
    },
    Rebuilt {
        stats: CsvStats,
        file_count: usize,
        files_skipped: usize,
    },
}

/// Rebuild the combined CSV when the output set changed (or `force` is set).
/// The manifest is saved only after the CSV has been replaced.
pub fn rebuild_if_changed(
    config: &HarvestConfig,
    known_domains: Option<&KnownDomainIndex>,
    force: bool,
) -> Result<ExportOutcome> {
    let output_dir = &config.output.output_dir;
    let fingerprint = ManifestFingerprint::compute(output_dir, &config.export.file_glob)?;
    let previous = ManifestFingerprint::load(&config.export.manifest_path);

    if !force && !ManifestFingerprint::changed(previous.as_ref(), &fingerprint) {
        info!(
            "Dataset unchanged ({} files), skipping rebuild",
            fingerprint.file_count
        );
        return Ok(ExportOutcome::Unchanged {
            file_count: fingerprint.file_count,
        });
    }

    if fingerprint.file_count == 0 {
        bail!(
            "No files matching '{}' in {}",
            config.export.file_glob,
            output_dir.display()
        );
    }

    let normalizer = FlattenNormalizer::from_config(&config.export);
    let naming = NamingConvention::new(&config.output.prefix)?;
    let builder = RowBuilder::new(
        &normalizer,
        &naming,
        &config.output.unit_id_field,
        known_domains,
    );

    let collected = builder.collect(&fingerprint.paths_in(output_dir));
    debug!(
        "Collected {} rows from {} files ({} skipped)",
        collected.rows.len(),
        collected.files_read,
        collected.files_skipped
    );

    let stats = write_canonical_csv(&collected.rows, &config.export.csv_path)?;
    fingerprint.save(&config.export.manifest_path)?;

    Ok(ExportOutcome::Rebuilt {
        stats,
        file_count: fingerprint.file_count,
        files_skipped: collected.files_skipped,
    })
}

pub fn print_export_summary(outcome: &ExportOutcome, csv_path: &Path) {
    match outcome {
        ExportOutcome::Unchanged { file_count } => {
            println!("Dataset unchanged ({} files); {} is up to date.", file_count, csv_path.display());
        }
        ExportOutcome::Rebuilt {
            stats,
            file_count,
            files_skipped,
        } => {
            println!("\n=== Export Summary ===");
            println!("Files read:    {}", file_count - files_skipped);
            if *files_skipped > 0 {
                println!("Files skipped: {}", files_skipped);
            }
            println!("Rows:          {}", stats.rows);
            println!("Columns:       {}", stats.columns);
            println!("Output:        {}", csv_path.display());
        }
    }
}
