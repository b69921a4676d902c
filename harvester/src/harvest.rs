//! The harvest loop
//!
//! For each remaining work unit: load or create its checkpoint, walk the
//! missing pages (saving after every page), then write the completion marker
//! atomically and drop the checkpoint. A failed walk leaves the checkpoint in
//! place so the next run picks up at the first missing page.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::completion::{CompletionIndex, NamingConvention, RescanPolicy};
use crate::config::HarvestConfig;
use crate::decode::read_document;
use crate::fetcher::JsonFetch;
use crate::logger::{HarvestLogger, OutcomeStatus, RunLog, RunSummary};
use crate::pagination::{PaginationWalker, RequestTemplate, WalkOutcome};
use crate::units::{QueryTemplate, UnitStatus, WorkUnit};
use crate::util::{ensure_directory, today_stamp, utc_now_iso, write_json_atomic};
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How one unit (or named query) ended
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Done {
        records: usize,
        total_pages: u32,
        output: PathBuf,
    },
    /// Walk stopped early; the checkpoint holds `records` so far
    Failed { records: usize, reason: String },
    /// Interrupt flag was raised between pages
    Interrupted { records: usize },
}

pub struct HarvestEngine<F: JsonFetch> {
    fetcher: F,
    config: HarvestConfig,
    template: RequestTemplate,
    naming: NamingConvention,
    checkpoints: CheckpointStore,
    logger: HarvestLogger,
    run_log: Option<RunLog>,
    interrupt: Arc<AtomicBool>,
}

impl<F: JsonFetch> HarvestEngine<F> {
    pub fn new(
        config: &HarvestConfig,
        fetcher: F,
        api_key: Option<&str>,
        logger: HarvestLogger,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Self {
            fetcher,
            template: RequestTemplate::from_config(&config.api, api_key),
            naming: NamingConvention::new(&config.output.prefix)?,
            checkpoints: CheckpointStore::new(config.output.checkpoint_dir()),
            config: config.clone(),
            logger,
            run_log: None,
            interrupt,
        })
    }

    /// Record every unit outcome in `run_log`
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn log_outcome(&mut self, key: &str, status: OutcomeStatus, count: usize) -> Result<()> {
        if let Some(log) = self.run_log.as_mut() {
            log.record(key, status, count)?;
        }
        Ok(())
    }

    /// Harvest every key not yet completed under `policy`
    pub async fn run(&mut self, keys: &[String], policy: RescanPolicy) -> Result<RunSummary> {
        let output_dir = self.config.output.output_dir.clone();
        ensure_directory(&output_dir)?;
        self.logger.record_output_dir(&output_dir);

        let index = CompletionIndex::scan(&output_dir, &self.naming)?;
        let template = QueryTemplate::new(self.config.api.query_template.clone());
        let mut units = index.plan(keys, &template, policy, Utc::now().date_naive());

        let mut summary = RunSummary::default();
        for unit in units.iter().filter(|u| u.status == UnitStatus::Done) {
            summary.skipped += 1;
            self.logger.log_skip(&unit.key);
            self.log_outcome(&unit.key, OutcomeStatus::SkipExists, 0)?;
        }

        let pending = units.iter().filter(|u| u.status == UnitStatus::Pending).count();
        info!(
            "{} unit(s): {} already complete, {} to fetch",
            units.len(),
            summary.skipped,
            pending
        );
        self.logger.start_progress(pending as u64);

        let mut fetched = 0usize;
        for unit in units.iter_mut().filter(|u| u.status == UnitStatus::Pending) {
            if self.interrupted() {
                summary.interrupted = true;
                break;
            }

            if fetched > 0 {
                self.throttle(fetched).await;
            }

            unit.status = UnitStatus::InProgress;
            self.logger.update_progress(&unit.key);

            // Planned despite a marker: a rescan must not reuse old pages
            let rescan = index.contains(&unit.key);
            match self.harvest(&unit.key, &unit.query, rescan).await? {
                UnitOutcome::Done {
                    records,
                    total_pages,
                    ..
                } => {
                    unit.status = UnitStatus::Done;
                    summary.ok += 1;
                    summary.records += records;
                    self.logger.log_unit_ok(&unit.key, records, total_pages);
                    self.log_outcome(&unit.key, OutcomeStatus::Ok, records)?;
                }
                UnitOutcome::Failed { records, reason } => {
                    unit.status = UnitStatus::Failed;
                    summary.failed += 1;
                    summary.failed_keys.push(unit.key.clone());
                    self.logger.log_unit_failed(&unit.key, &reason);
                    self.log_outcome(&unit.key, OutcomeStatus::Fail, records)?;
                }
                UnitOutcome::Interrupted { records } => {
                    unit.status = UnitStatus::Pending;
                    summary.interrupted = true;
                    info!("Interrupted during {} with {} record(s) checkpointed", unit.key, records);
                    break;
                }
            }

            fetched += 1;
            self.logger.advance_progress();
        }

        self.logger.finish_progress();
        Ok(summary)
    }

    /// Pause before the next unit; longer after every full batch
    async fn throttle(&self, fetched: usize) {
        let throttle = &self.config.throttle;
        if throttle.batch_size > 0 && fetched % throttle.batch_size == 0 {
            debug!("Batch of {} done, sleeping {:?}", throttle.batch_size, throttle.batch_sleep());
            sleep(throttle.batch_sleep()).await;
        } else if !throttle.inter_unit_delay().is_zero() {
            sleep(throttle.inter_unit_delay()).await;
        }
    }

    /// Harvest one standalone paginated query into `<prefix>_<name>_<date>.json`
    pub async fn run_query(&mut self, name: &str, query: &str) -> Result<UnitOutcome> {
        ensure_directory(&self.config.output.output_dir)?;
        let outcome = self.harvest(name, query, false).await?;
        match &outcome {
            UnitOutcome::Done { records, .. } => {
                self.log_outcome(name, OutcomeStatus::Ok, *records)?
            }
            UnitOutcome::Failed { records, .. } => {
                self.log_outcome(name, OutcomeStatus::Fail, *records)?
            }
            UnitOutcome::Interrupted { .. } => {}
        }
        Ok(outcome)
    }

    /// Resume or start `label`, walk its missing pages, and write the marker.
    ///
    /// With `fresh` set, or when the stored checkpoint is already complete,
    /// the checkpoint is discarded and every page is fetched again.
    async fn harvest(&self, label: &str, query: &str, fresh: bool) -> Result<UnitOutcome> {
        let mut checkpoint = self.checkpoints.load_or_new(label, query)?;
        if fresh || checkpoint.is_complete() {
            if !checkpoint.pages_done.is_empty() {
                debug!("{}: discarding checkpoint with {} page(s)", label, checkpoint.pages_done.len());
            }
            self.checkpoints.delete(label)?;
            checkpoint = Checkpoint::new(label, query);
        }
        self.logger.log_unit_start(label, checkpoint.pages_done.len());

        let mut walker = PaginationWalker::resume_from(
            &self.fetcher,
            &self.template,
            &checkpoint,
            self.config.throttle.inter_page_delay(),
        );

        loop {
            if self.interrupted() {
                return Ok(UnitOutcome::Interrupted {
                    records: checkpoint.results_count(),
                });
            }
            let Some(page) = walker.next_page().await else {
                break;
            };
            checkpoint.record_page(page.page, page.results, Some(page.total_pages));
            self.checkpoints.save(&mut checkpoint)?;
            self.logger.record_page();
            self.logger.record_checkpoint();
        }

        if let WalkOutcome::Partial { failure, .. } = walker.outcome() {
            warn!(
                "{}: stopped with {} of {:?} pages; checkpoint kept",
                label,
                checkpoint.pages_done.len(),
                checkpoint.total_pages
            );
            return Ok(UnitOutcome::Failed {
                records: checkpoint.results_count(),
                reason: failure.to_string(),
            });
        }

        let output = self.write_marker(label, &checkpoint)?;
        if !self.config.output.retain_checkpoints {
            self.checkpoints.delete(label)?;
        }

        Ok(UnitOutcome::Done {
            records: checkpoint.results_count(),
            total_pages: checkpoint.total_pages.unwrap_or(1),
            output,
        })
    }

    fn write_marker(&self, key: &str, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let mut doc = checkpoint.consolidate();
        doc.insert(
            self.config.output.unit_id_field.clone(),
            Value::String(key.to_string()),
        );
        doc.insert("fetched_at".into(), Value::String(utc_now_iso()));

        let path = self
            .config
            .output
            .output_dir
            .join(self.naming.file_name(key, &today_stamp()));
        write_json_atomic(&path, &Value::Object(doc))?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

/// Offline view of where a set of keys stands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub total: usize,
    pub completed: usize,
    pub remaining: Vec<String>,
    /// `(key, pages done, known total)` for remaining keys with a checkpoint
    pub partial: Vec<(String, usize, Option<u32>)>,
}

/// Completion and checkpoint state for `keys`, read from disk only
pub fn status_report(
    config: &HarvestConfig,
    keys: &[String],
    policy: RescanPolicy,
    today: NaiveDate,
) -> Result<StatusReport> {
    let naming = NamingConvention::new(&config.output.prefix)?;
    let index = CompletionIndex::scan(&config.output.output_dir, &naming)?;
    let template = QueryTemplate::new(config.api.query_template.clone());
    let store = CheckpointStore::new(config.output.checkpoint_dir());

    let units: Vec<WorkUnit> = index.plan(keys, &template, policy, today);
    let mut report = StatusReport {
        total: units.len(),
        ..Default::default()
    };

    for unit in units {
        if unit.status == UnitStatus::Done {
            report.completed += 1;
            continue;
        }

        // Read without the store's discard-on-mismatch so status stays side-effect free
        let stored = read_document(&store.path_for(&unit.key))
            .into_value()
            .and_then(|v| serde_json::from_value::<Checkpoint>(v).ok())
            .filter(|cp| cp.query == unit.query);
        if let Some(cp) = stored {
            report
                .partial
                .push((unit.key.clone(), cp.pages_done.len(), cp.total_pages));
        }
        report.remaining.push(unit.key);
    }

    Ok(report)
}

pub fn print_status(report: &StatusReport) {
    println!("\n=== Harvest Status ===");
    println!("Keys:      {}", report.total);
    println!("Completed: {}", report.completed);
    println!("Remaining: {}", report.remaining.len());
    for (key, done, total) in &report.partial {
        let total = total.map_or_else(|| "?".to_string(), |t| t.to_string());
        println!("  {} - checkpoint at {}/{} pages", key, done, total);
    }
}
