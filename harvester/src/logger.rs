use crate::util::{ensure_directory, today_stamp, utc_now_iso};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum VerbosityLevel {
    Silent = 0,    // Progress bar and final summary only
    Summary = 1,   // Per-unit outcomes (default)
    Detailed = 2,  // Pages, checkpoints, warnings
    Debug = 3,     // Everything
}

impl VerbosityLevel {
    pub fn from_verbose_count(count: u8) -> Self {
        match count {
            0 => VerbosityLevel::Summary,
            1 => VerbosityLevel::Detailed,
            2.. => VerbosityLevel::Debug,
        }
    }

    /// Default `tracing` filter directive for this level
    pub fn filter_directive(&self) -> &'static str {
        match self {
            VerbosityLevel::Silent => "warn",
            VerbosityLevel::Summary => "info",
            VerbosityLevel::Detailed => "debug",
            VerbosityLevel::Debug => "trace",
        }
    }
}

/// User-facing progress output for a harvest run
#[derive(Clone)]
pub struct HarvestLogger {
    verbosity: VerbosityLevel,
    progress_bar: Arc<Mutex<Option<ProgressBar>>>,
    metadata: Arc<Mutex<RunMetadata>>,
}

#[derive(Default, Clone)]
struct RunMetadata {
    started: Option<Instant>,
    finished: Option<Instant>,
    units_total: usize,
    pages_fetched: usize,
    checkpoints_saved: usize,
    output_dir: String,
}

impl HarvestLogger {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            progress_bar: Arc::new(Mutex::new(None)),
            metadata: Arc::new(Mutex::new(RunMetadata::default())),
        }
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        self.verbosity
    }

    pub fn info(&self, message: &str) {
        if self.verbosity >= VerbosityLevel::Summary {
            self.print_message("INFO", message);
        }
    }

    /// Errors are shown at every verbosity
    pub fn error(&self, message: &str) {
        self.print_message("ERROR", message);
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity >= VerbosityLevel::Debug {
            self.print_message("DEBUG", message);
        }
    }

    fn print_message(&self, level: &str, message: &str) {
        let msg = format!("[{}] {}: {}", chrono::Local::now().format("%H:%M:%S%.3f"), level, message);

        // Route through a visible progress bar so the bar stays pinned;
        // a hidden bar (no terminal) would swallow the line
        if let Ok(guard) = self.progress_bar.lock() {
            if let Some(pb) = guard.as_ref().filter(|pb| !pb.is_hidden()) {
                pb.println(msg);
                return;
            }
        }
        eprintln!("{}", msg);
    }

    pub fn start_progress(&self, total_units: u64) {
        let pb = if self.verbosity == VerbosityLevel::Debug {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total_units)
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb.set_message("Starting...");

        if let Ok(mut guard) = self.progress_bar.lock() {
            *guard = Some(pb);
        }
        if let Ok(mut meta) = self.metadata.lock() {
            meta.started = Some(Instant::now());
            meta.units_total = total_units as usize;
        }
    }

    pub fn update_progress(&self, message: &str) {
        if let Ok(guard) = self.progress_bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.set_message(message.to_string());
            }
        }
    }

    pub fn advance_progress(&self) {
        if let Ok(guard) = self.progress_bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.inc(1);
            }
        }
    }

    pub fn finish_progress(&self) {
        if let Ok(mut guard) = self.progress_bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
        if let Ok(mut meta) = self.metadata.lock() {
            meta.finished = Some(Instant::now());
        }
    }

    pub fn record_page(&self) {
        if let Ok(mut meta) = self.metadata.lock() {
            meta.pages_fetched += 1;
        }
    }

    pub fn record_checkpoint(&self) {
        if let Ok(mut meta) = self.metadata.lock() {
            meta.checkpoints_saved += 1;
        }
    }

    pub fn record_output_dir(&self, dir: &Path) {
        if let Ok(mut meta) = self.metadata.lock() {
            meta.output_dir = dir.display().to_string();
        }
    }

    pub fn log_unit_start(&self, key: &str, resumed_pages: usize) {
        if resumed_pages > 0 {
            self.info(&format!("{}: resuming with {} page(s) from checkpoint", key, resumed_pages));
        } else {
            self.debug(&format!("{}: starting fresh", key));
        }
    }

    pub fn log_unit_ok(&self, key: &str, records: usize, pages: u32) {
        self.info(&format!("{}: OK ({} records, {} pages)", key, records, pages));
    }

    pub fn log_unit_failed(&self, key: &str, reason: &str) {
        self.error(&format!("{}: FAIL ({})", key, reason));
    }

    pub fn log_skip(&self, key: &str) {
        self.debug(&format!("{}: already complete, skipping", key));
    }

    /// Always printed, regardless of verbosity
    pub fn print_final_summary(&self, summary: &RunSummary) {
        let meta = self.metadata.lock().map(|m| m.clone()).unwrap_or_default();

        print!("\x1b[2K\r");
        let _ = io::stdout().flush();

        println!("\n=== HARVEST SUMMARY ===");
        if let (Some(start), Some(end)) = (meta.started, meta.finished) {
            println!("Duration: {:.2}s", end.duration_since(start).as_secs_f64());
        }
        println!("Units: {}", meta.units_total);
        println!("OK: {}", summary.ok);
        println!("Failed: {}", summary.failed);
        println!("Skipped (already complete): {}", summary.skipped);
        println!("Records fetched: {}", summary.records);
        println!("Pages fetched: {}", meta.pages_fetched);
        if !meta.output_dir.is_empty() {
            println!("Output: {}", meta.output_dir);
        }
        println!("=======================\n");

        if summary.interrupted {
            println!("Interrupted. Progress is checkpointed; run again to resume.");
        }
        if !summary.failed_keys.is_empty() {
            println!("Failed keys (eligible on next run): {}", summary.failed_keys.join(", "));
        }
    }
}

/// Counters for one harvest run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records: usize,
    pub failed_keys: Vec<String>,
    pub interrupted: bool,
}

/// Unit outcome recorded in the run log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Ok,
    Fail,
    SkipExists,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeStatus::Ok => "OK",
            OutcomeStatus::Fail => "FAIL",
            OutcomeStatus::SkipExists => "SKIP_EXISTS",
        };
        f.write_str(s)
    }
}

const RUN_LOG_HEADER: [&str; 4] = ["key", "status", "result_count", "timestamp_utc"];

/// Append-only outcome CSV: `key,status,result_count,timestamp_utc`
pub struct RunLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl RunLog {
    /// Daily log file `<log_dir>/<prefix>_log_<YYYYMMDD>.csv`
    pub fn open_daily(log_dir: &Path, prefix: &str) -> Result<Self> {
        Self::open(&log_dir.join(format!("{}_log_{}.csv", prefix, today_stamp())))
    }

    /// Open for appending; the header is written only to a new or empty file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }
        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open run log: {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record(RUN_LOG_HEADER)?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it immediately
    pub fn record(&mut self, key: &str, status: OutcomeStatus, result_count: usize) -> Result<()> {
        self.writer.write_record([
            key,
            &status.to_string(),
            &result_count.to_string(),
            &utc_now_iso(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}
