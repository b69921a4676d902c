//! CVE enrichment from the NVD API
//!
//! CVE ids are pulled from an exported CSV column, looked up one at a time
//! against NVD, and cached in a JSONL store (one record per CVE, sorted by id)
//! with a flat summary CSV next to it. Cached records are only fetched again
//! when a refresh bucket says they are stale.

use crate::config::{NvdConfig, RefreshConfig};
use crate::decode::CVE_ID;
use crate::fetcher::{FetchRequest, JsonFetch};
use crate::merge::{KeyKind, MergeDeduplicator, MergePolicy};
use crate::util::{utc_now_iso, write_atomic};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

static CVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bCVE-\d{4}-\d{4,7}\b").unwrap());

/// File names written next to the input CSV
pub const CVE_IDS_FILE: &str = "cve_ids.txt";
pub const CVE_STORE_FILE: &str = "cve_details_nvd.jsonl";
pub const CVE_SUMMARY_FILE: &str = "cve_details_nvd.csv";

/// Distinct upper-cased CVE ids mentioned anywhere in `text`
pub fn extract_cve_ids(text: &str) -> BTreeSet<String> {
    CVE_RE
        .find_iter(text)
        .map(|m| m.as_str().to_uppercase())
        .collect()
}

/// Distinct CVE ids from one column of a CSV file, sorted
pub fn extract_cves_from_csv(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV: {}", path.display()))?;

    let headers = reader.headers().context("Failed to read CSV headers")?.clone();
    let Some(idx) = headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}') == column)
    else {
        bail!(
            "Column '{}' not found in {}. Available columns: {}",
            column,
            path.display(),
            headers.iter().collect::<Vec<_>>().join(", ")
        );
    };

    let mut found = BTreeSet::new();
    for record in reader.records() {
        let record = record.context("Failed to parse CSV record")?;
        if let Some(cell) = record.get(idx) {
            found.extend(extract_cve_ids(cell));
        }
    }

    Ok(found.into_iter().collect())
}

/// CVSS v3.1 and v4.0 headline values of one NVD response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CvssSummary {
    #[serde(rename = "v31_baseScore")]
    pub v31_base_score: Option<f64>,
    #[serde(rename = "v31_baseSeverity")]
    pub v31_base_severity: Option<String>,
    #[serde(rename = "v31_vectorString")]
    pub v31_vector_string: Option<String>,
    #[serde(rename = "v40_baseScore")]
    pub v40_base_score: Option<f64>,
    #[serde(rename = "v40_baseSeverity")]
    pub v40_base_severity: Option<String>,
    #[serde(rename = "v40_vectorString")]
    pub v40_vector_string: Option<String>,
}

impl CvssSummary {
    /// Prefer the `Primary` metric of each version, else the first one
    pub fn from_nvd(nvd: &Value) -> Self {
        let mut out = Self::default();
        let Some(metrics) = nvd.pointer("/vulnerabilities/0/cve/metrics") else {
            return out;
        };

        if let Some(m) = pick_metric(metrics.get("cvssMetricV31")) {
            let (score, severity, vector) = metric_fields(m);
            out.v31_base_score = score;
            out.v31_base_severity = severity;
            out.v31_vector_string = vector;
        }

        if let Some(m) = pick_metric(metrics.get("cvssMetricV40")) {
            let (score, severity, vector) = metric_fields(m);
            out.v40_base_score = score;
            out.v40_base_severity = severity;
            out.v40_vector_string = vector;
        }

        out
    }
}

fn pick_metric(list: Option<&Value>) -> Option<&Value> {
    let items = list?.as_array()?;
    items
        .iter()
        .find(|m| m.get("type").and_then(Value::as_str) == Some("Primary"))
        .or_else(|| items.iter().find(|m| m.is_object()))
}

fn metric_fields(metric: &Value) -> (Option<f64>, Option<String>, Option<String>) {
    let data = metric.get("cvssData");
    let score = data.and_then(|d| d.get("baseScore")).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    let severity = data
        .and_then(|d| d.get("baseSeverity"))
        .or_else(|| metric.get("baseSeverity"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let vector = data
        .and_then(|d| d.get("vectorString"))
        .and_then(Value::as_str)
        .map(str::to_string);
    (score, severity, vector)
}

/// One cached NVD lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
    pub cve_id: String,
    pub fetched_at: String,
    pub cvss: CvssSummary,
    pub nvd: Value,
}

impl CveRecord {
    pub fn from_response(cve_id: &str, nvd: Value) -> Self {
        Self {
            cve_id: cve_id.to_string(),
            fetched_at: utc_now_iso(),
            cvss: CvssSummary::from_nvd(&nvd),
            nvd,
        }
    }
}

/// Why a cached record is fetched again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReason {
    OlderThanWeek,
    OlderThanMonth,
    MissingField(String),
}

/// Independent staleness buckets; any enabled bucket that matches triggers a refresh
#[derive(Debug, Clone, Default)]
pub struct RefreshPolicy {
    pub older_than_week: bool,
    pub older_than_month: bool,
    pub missing_required_field: bool,
    pub required_fields: Vec<String>,
}

impl RefreshPolicy {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            older_than_week: config.older_than_week,
            older_than_month: config.older_than_month,
            missing_required_field: config.missing_required_field,
            required_fields: config.required_fields.clone(),
        }
    }

    /// First matching bucket for `record`, if any. A missing or unreadable
    /// `fetched_at` counts as old.
    pub fn refresh_reason(&self, record: &Value, now: DateTime<Utc>) -> Option<RefreshReason> {
        if self.missing_required_field {
            if let Some(field) = self
                .required_fields
                .iter()
                .find(|f| !has_field(record, f))
            {
                return Some(RefreshReason::MissingField(field.clone()));
            }
        }

        let age = record
            .get("fetched_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| now.signed_duration_since(t.with_timezone(&Utc)));
        let older_than = |limit: ChronoDuration| age.map_or(true, |a| a > limit);

        if self.older_than_week && older_than(ChronoDuration::days(7)) {
            return Some(RefreshReason::OlderThanWeek);
        }
        if self.older_than_month && older_than(ChronoDuration::days(30)) {
            return Some(RefreshReason::OlderThanMonth);
        }
        None
    }
}

/// Dotted path present with a non-null, non-empty value
fn has_field(record: &Value, dotted: &str) -> bool {
    let mut current = record;
    for part in dotted.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    match current {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    }
}

/// JSONL record store plus its summary CSV
#[derive(Debug, Clone)]
pub struct CveStore {
    jsonl_path: PathBuf,
    csv_path: PathBuf,
}

impl CveStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            jsonl_path: dir.join(CVE_STORE_FILE),
            csv_path: dir.join(CVE_SUMMARY_FILE),
        }
    }

    pub fn jsonl_path(&self) -> &Path {
        &self.jsonl_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Cached records keyed by CVE id. Malformed lines are skipped; when an id
    /// appears twice the record with the later `fetched_at` wins.
    pub fn load(&self) -> Result<MergeDeduplicator> {
        let mut records = MergeDeduplicator::new(KeyKind::CveId, MergePolicy::LatestFetchedAt, CVE_ID);
        if !self.jsonl_path.exists() {
            return Ok(records);
        }

        let text = fs::read_to_string(&self.jsonl_path)
            .with_context(|| format!("Failed to read {}", self.jsonl_path.display()))?;

        let mut skipped = 0usize;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    records.offer("store", value);
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 || records.rejected() > 0 {
            warn!(
                "{}: skipped {} malformed lines and {} records without a CVE id",
                self.jsonl_path.display(),
                skipped,
                records.rejected()
            );
        }
        Ok(records)
    }

    /// Atomically rewrite the JSONL store and summary CSV
    pub fn save(&self, records: &MergeDeduplicator) -> Result<()> {
        let mut jsonl = String::new();
        for record in records.records() {
            jsonl.push_str(&serde_json::to_string(&record.record)?);
            jsonl.push('\n');
        }
        write_atomic(&self.jsonl_path, jsonl.as_bytes())?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in records.records() {
            writer.serialize(CveSummaryRow::from_record(&record.key, &record.record))?;
        }
        let bytes = writer.into_inner().context("Failed to finish CVE summary CSV")?;
        write_atomic(&self.csv_path, &bytes)?;

        debug!("Saved {} CVE records to {}", records.len(), self.jsonl_path.display());
        Ok(())
    }
}

/// One line of the CVE summary CSV
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CveSummaryRow {
    pub cve_id: String,
    pub published: Option<String>,
    #[serde(rename = "lastModified")]
    pub last_modified: Option<String>,
    #[serde(rename = "cvss_v31_baseScore")]
    pub v31_base_score: Option<f64>,
    #[serde(rename = "cvss_v31_baseSeverity")]
    pub v31_base_severity: Option<String>,
    #[serde(rename = "cvss_v31_vectorString")]
    pub v31_vector_string: Option<String>,
    #[serde(rename = "cvss_v40_baseScore")]
    pub v40_base_score: Option<f64>,
    #[serde(rename = "cvss_v40_baseSeverity")]
    pub v40_base_severity: Option<String>,
    #[serde(rename = "cvss_v40_vectorString")]
    pub v40_vector_string: Option<String>,
    pub description_en: Option<String>,
}

impl CveSummaryRow {
    pub fn from_record(cve_id: &str, record: &Value) -> Self {
        let cve = record
            .pointer("/nvd/vulnerabilities/0/cve")
            .cloned()
            .unwrap_or(Value::Null);
        let cvss: CvssSummary = record
            .get("cvss")
            .cloned()
            .and_then(|c| serde_json::from_value(c).ok())
            .unwrap_or_default();

        let text = |key: &str| cve.get(key).and_then(Value::as_str).map(str::to_string);

        let descriptions = cve
            .get("descriptions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let description_of = |d: &Value| {
            d.get("value")
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let description_en = descriptions
            .iter()
            .filter(|d| d.get("lang").and_then(Value::as_str) == Some("en"))
            .find_map(description_of)
            .or_else(|| descriptions.iter().find_map(description_of));

        Self {
            cve_id: cve_id.to_string(),
            published: text("published"),
            last_modified: text("lastModified"),
            v31_base_score: cvss.v31_base_score,
            v31_base_severity: cvss.v31_base_severity,
            v31_vector_string: cvss.v31_vector_string,
            v40_base_score: cvss.v40_base_score,
            v40_base_severity: cvss.v40_base_severity,
            v40_vector_string: cvss.v40_vector_string,
            description_en,
        }
    }
}

/// Which ids a lookup run will fetch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CvePlan {
    pub to_fetch: Vec<String>,
    pub new_ids: usize,
    pub refreshed: usize,
    pub cached: usize,
    /// Ids in the store that the current input no longer mentions (kept)
    pub extra_in_store: usize,
}

/// New ids plus cached ids that need a refresh (or every id with `refresh_all`)
pub fn plan_lookups(
    ids: &[String],
    store: &MergeDeduplicator,
    policy: &RefreshPolicy,
    refresh_all: bool,
    now: DateTime<Utc>,
) -> CvePlan {
    let mut plan = CvePlan::default();
    let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();

    for id in ids {
        match store.get(id) {
            None => {
                plan.new_ids += 1;
                plan.to_fetch.push(id.clone());
            }
            Some(cached) => {
                plan.cached += 1;
                let reason = policy.refresh_reason(&cached.record, now);
                if refresh_all || reason.is_some() {
                    if let Some(reason) = reason {
                        debug!("{} needs refresh: {:?}", id, reason);
                    }
                    plan.refreshed += 1;
                    plan.to_fetch.push(id.clone());
                }
            }
        }
    }

    plan.extra_in_store = store
        .records()
        .filter(|r| !wanted.contains(r.key.as_str()))
        .count();
    plan
}

/// Outcome of a lookup run
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CveRunSummary {
    pub fetched: usize,
    pub failed: Vec<String>,
    pub total_records: usize,
    pub interrupted: bool,
}

/// Single-record NVD request for `cve_id`
pub fn nvd_request(config: &NvdConfig, cve_id: &str, api_key: Option<&str>) -> FetchRequest {
    let mut request = FetchRequest::get(config.endpoint.clone());
    request.payload = Some(json!({ "cveId": cve_id }));
    match api_key {
        Some(key) => request.with_header("apiKey", key),
        None => request,
    }
}

/// Fetch each id in order, replacing cached records with fresh ones and
/// rewriting the store every `checkpoint_every` fetches and at the end.
pub async fn fetch_cves<F: JsonFetch>(
    fetcher: &F,
    config: &NvdConfig,
    api_key: Option<&str>,
    ids: &[String],
    store: &CveStore,
    records: &mut MergeDeduplicator,
    interrupt: &AtomicBool,
) -> Result<CveRunSummary> {
    let mut summary = CveRunSummary::default();
    let delay = Duration::from_millis(config.request_delay_ms);

    for (idx, cve_id) in ids.iter().enumerate() {
        if interrupt.load(Ordering::SeqCst) {
            warn!("Interrupted after {} of {} CVE lookups", idx, ids.len());
            summary.interrupted = true;
            break;
        }
        if idx > 0 && !delay.is_zero() {
            sleep(delay).await;
        }

        info!("({}/{}) querying {}", idx + 1, ids.len(), cve_id);
        match fetcher.fetch(&nvd_request(config, cve_id, api_key)).await {
            Ok(nvd) => {
                let record = CveRecord::from_response(cve_id, nvd);
                records.offer("nvd", serde_json::to_value(&record)?);
                summary.fetched += 1;
            }
            Err(failure) => {
                warn!("{}: {}", cve_id, failure);
                summary.failed.push(cve_id.clone());
            }
        }

        if config.checkpoint_every > 0 && summary.fetched > 0 && (idx + 1) % config.checkpoint_every == 0 {
            store.save(records)?;
            info!("Checkpoint: {} CVE records written", records.len());
        }
    }

    store.save(records)?;
    summary.total_records = records.len();
    Ok(summary)
}

/// Write the extracted id list (one per line)
pub fn write_id_list(path: &Path, ids: &[String]) -> Result<()> {
    let mut text = ids.join("\n");
    if !ids.is_empty() {
        text.push('\n');
    }
    write_atomic(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedFetcher;
    use tempfile::TempDir;

    fn nvd_payload(id: &str) -> Value {
        json!({
            "vulnerabilities": [{
                "cve": {
                    "id": id,
                    "published": "2024-01-02T03:04:05.000",
                    "lastModified": "2024-02-01T00:00:00.000",
                    "descriptions": [
                        {"lang": "es", "value": "descripcion"},
                        {"lang": "en", "value": "An issue"}
                    ],
                    "metrics": {
                        "cvssMetricV31": [
                            {"type": "Secondary", "cvssData": {"baseScore": 5.0, "baseSeverity": "MEDIUM"}},
                            {"type": "Primary", "cvssData": {"baseScore": 9.8, "baseSeverity": "CRITICAL", "vectorString": "CVSS:3.1/AV:N"}}
                        ]
                    }
                }
            }]
        })
    }

    fn test_config(endpoint: &str) -> NvdConfig {
        NvdConfig {
            endpoint: endpoint.to_string(),
            request_delay_ms: 0,
            checkpoint_every: 1,
            ..NvdConfig::default()
        }
    }

    #[test]
    fn test_extract_cve_ids() {
        let ids = extract_cve_ids("cve-2021-44228;CVE-2021-44228 CVE-2023-1234567 CVE-99-1");
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["CVE-2021-44228", "CVE-2023-1234567"]
        );
    }

    #[test]
    fn test_extract_cves_from_csv_column() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("all.csv");
        fs::write(
            &path,
            "\u{feff}\"ip\",\"service.cves\"\n\"1.1.1.1\",\"CVE-2024-0002;CVE-2024-0001\"\n\"2.2.2.2\",\"\"\n",
        )
        .unwrap();

        let ids = extract_cves_from_csv(&path, "service.cves").unwrap();
        assert_eq!(ids, vec!["CVE-2024-0001", "CVE-2024-0002"]);
        assert!(extract_cves_from_csv(&path, "missing").is_err());
    }

    #[test]
    fn test_cvss_prefers_primary_metric() {
        let cvss = CvssSummary::from_nvd(&nvd_payload("CVE-2024-0001"));
        assert_eq!(cvss.v31_base_score, Some(9.8));
        assert_eq!(cvss.v31_base_severity.as_deref(), Some("CRITICAL"));
        assert_eq!(cvss.v40_base_score, None);
        assert_eq!(CvssSummary::from_nvd(&json!({})), CvssSummary::default());
    }

    #[test]
    fn test_refresh_buckets() {
        let now = DateTime::parse_from_rfc3339("2024-06-30T00:00:00Z").unwrap().with_timezone(&Utc);
        let ten_days_old = json!({"cve_id": "CVE-2024-0001", "fetched_at": "2024-06-20T00:00:00Z", "nvd": {}});

        let week = RefreshPolicy { older_than_week: true, ..RefreshPolicy::default() };
        assert_eq!(week.refresh_reason(&ten_days_old, now), Some(RefreshReason::OlderThanWeek));

        let month = RefreshPolicy { older_than_month: true, ..RefreshPolicy::default() };
        assert_eq!(month.refresh_reason(&ten_days_old, now), None);

        let required = RefreshPolicy {
            missing_required_field: true,
            required_fields: vec!["cve_id".into(), "nvd.vulnerabilities".into()],
            ..RefreshPolicy::default()
        };
        assert_eq!(
            required.refresh_reason(&ten_days_old, now),
            Some(RefreshReason::MissingField("nvd.vulnerabilities".into()))
        );

        assert_eq!(RefreshPolicy::default().refresh_reason(&ten_days_old, now), None);
    }

    #[test]
    fn test_plan_lookups() {
        let now = Utc::now();
        let mut store = MergeDeduplicator::new(KeyKind::CveId, MergePolicy::LatestFetchedAt, CVE_ID);
        store.offer("store", json!({"cve_id": "CVE-2024-0001", "fetched_at": utc_now_iso(), "nvd": {"vulnerabilities": [1]}}));
        store.offer("store", json!({"cve_id": "CVE-2020-0001", "fetched_at": "2020-01-01T00:00:00Z"}));
        store.offer("store", json!({"cve_id": "CVE-2019-0001", "fetched_at": utc_now_iso()}));

        let ids = vec!["CVE-2024-0001".to_string(), "CVE-2020-0001".to_string(), "CVE-2024-0009".to_string()];
        let policy = RefreshPolicy { older_than_month: true, ..RefreshPolicy::default() };

        let plan = plan_lookups(&ids, &store, &policy, false, now);
        assert_eq!(plan.to_fetch, vec!["CVE-2020-0001", "CVE-2024-0009"]);
        assert_eq!(plan.new_ids, 1);
        assert_eq!(plan.cached, 2);
        assert_eq!(plan.refreshed, 1);
        assert_eq!(plan.extra_in_store, 1);

        let all = plan_lookups(&ids, &store, &policy, true, now);
        assert_eq!(all.to_fetch.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_cves_writes_sorted_store() {
        let tmp = TempDir::new().unwrap();
        let store = CveStore::new(tmp.path());
        let config = test_config("http://nvd.test/cves");

        let fetcher = ScriptedFetcher::new()
            .url("http://nvd.test/cves?cveId=CVE-2024-0002", nvd_payload("CVE-2024-0002"))
            .url("http://nvd.test/cves?cveId=CVE-2024-0001", nvd_payload("CVE-2024-0001"));

        let mut records = store.load().unwrap();
        let ids = vec![
            "CVE-2024-0002".to_string(),
            "CVE-2024-0001".to_string(),
            "CVE-2024-0404".to_string(),
        ];
        let interrupt = AtomicBool::new(false);

        let summary = fetch_cves(&fetcher, &config, None, &ids, &store, &mut records, &interrupt)
            .await
            .unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.failed, vec!["CVE-2024-0404"]);
        assert_eq!(summary.total_records, 2);

        let jsonl = fs::read_to_string(store.jsonl_path()).unwrap();
        let ids_in_file: Vec<String> = jsonl
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["cve_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids_in_file, vec!["CVE-2024-0001", "CVE-2024-0002"]);

        let csv_text = fs::read_to_string(store.csv_path()).unwrap();
        assert!(csv_text.starts_with("cve_id,published,lastModified,cvss_v31_baseScore"));
        assert!(csv_text.contains("An issue"));

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_cves_stops_on_interrupt() {
        let tmp = TempDir::new().unwrap();
        let store = CveStore::new(tmp.path());
        let fetcher = ScriptedFetcher::new();
        let mut records = store.load().unwrap();
        let interrupt = AtomicBool::new(true);

        let summary = fetch_cves(
            &fetcher,
            &test_config("http://nvd.test/cves"),
            None,
            &["CVE-2024-0001".to_string()],
            &store,
            &mut records,
            &interrupt,
        )
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.fetched, 0);
        assert!(fetcher.requested_urls().is_empty());
    }

    #[test]
    fn test_load_skips_malformed_lines_and_keeps_newest() {
        let tmp = TempDir::new().unwrap();
        let store = CveStore::new(tmp.path());
        fs::write(
            store.jsonl_path(),
            concat!(
                "{\"cve_id\": \"CVE-2024-0001\", \"fetched_at\": \"2024-05-01T00:00:00Z\", \"v\": 2}\n",
                "not json\n",
                "{\"cve_id\": \"CVE-2024-0001\", \"fetched_at\": \"2024-01-01T00:00:00Z\", \"v\": 1}\n",
                "{\"vulnerabilities\": [{\"cve\": {\"id\": \"cve-2023-9999\"}}]}\n"
            ),
        )
        .unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.get("CVE-2024-0001").unwrap().record["v"], json!(2));
        assert!(records.get("CVE-2023-9999").is_some());
    }
}
