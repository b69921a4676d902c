use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harvester::cli::{Cli, Commands};
use harvester::completion::RescanPolicy;
use harvester::config::{self, HarvestConfig};
use harvester::cve::{self, CveStore, RefreshPolicy, CVE_IDS_FILE};
use harvester::domain_utils::KnownDomainIndex;
use harvester::export;
use harvester::fetcher::RateLimitedFetcher;
use harvester::harvest::{self, HarvestEngine, UnitOutcome};
use harvester::logger::{HarvestLogger, RunLog, VerbosityLevel};
use harvester::merge::{self, KeyKind};
use harvester::units::parse_key_file;
use harvester::util::write_atomic;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::CONFIG_PATH));

    // Handle --init first (before any other processing)
    if cli.init {
        match HarvestConfig::create_default_config(&config_path) {
            Ok(path) => {
                println!("Created default configuration file at: {}", path.display());
                println!("Edit this file to customize settings, then run harvester again.");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Failed to create configuration file: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = cli.validate() {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(2);
    }

    let verbosity = VerbosityLevel::from_verbose_count(cli.verbose);
    init_tracing(verbosity);

    let config = match HarvestConfig::load_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(config::ConfigError::FileNotFound(path)) => {
            eprintln!("Configuration file not found at: {}", path.display());
            eprintln!("Run with --init to create a default configuration file.");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Credentials are checked before any request is built
    let api_key = if cli.needs_api_credentials() {
        match config.api.auth.resolve_api_key() {
            Ok(key) => Some(key),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            eprintln!("\nSecond interrupt, exiting immediately.");
            std::process::exit(130);
        }
        eprintln!("\nInterrupt received. Stopping after the current page (Ctrl+C again to force).");
    })
    .unwrap_or_else(|e| {
        eprintln!("Warning: Failed to set Ctrl-C handler: {}", e);
    });

    let logger = HarvestLogger::new(verbosity);

    let Some(command) = cli.command else {
        return Ok(());
    };

    match command {
        Commands::Harvest {
            input,
            key_column,
            rescan_stale,
            rescan_all,
        } => {
            let keys = parse_key_file(&input, &key_column)?;
            info!("Loaded {} key(s) from {}", keys.len(), input.display());

            let fetcher = RateLimitedFetcher::new(&config.api, &config.retry)?;
            let run_log = RunLog::open_daily(&config.output.log_dir, &config.output.prefix)?;
            let mut engine = HarvestEngine::new(
                &config,
                fetcher,
                api_key.as_deref(),
                logger.clone(),
                Arc::clone(&interrupt),
            )?
            .with_run_log(run_log);

            let policy = Commands::rescan_policy(rescan_stale, rescan_all);
            let summary = engine.run(&keys, policy).await?;
            logger.print_final_summary(&summary);

            if summary.interrupted {
                std::process::exit(130);
            }
        }

        Commands::Query { query, name } => {
            let fetcher = RateLimitedFetcher::new(&config.api, &config.retry)?;
            let run_log = RunLog::open_daily(&config.output.log_dir, &config.output.prefix)?;
            let mut engine = HarvestEngine::new(
                &config,
                fetcher,
                api_key.as_deref(),
                logger.clone(),
                Arc::clone(&interrupt),
            )?
            .with_run_log(run_log);

            match engine.run_query(&name, &query).await? {
                UnitOutcome::Done {
                    records,
                    total_pages,
                    output,
                } => {
                    println!(
                        "{}: {} records from {} page(s) written to {}",
                        name,
                        records,
                        total_pages,
                        output.display()
                    );
                }
                UnitOutcome::Failed { records, reason } => {
                    eprintln!(
                        "{}: stopped with {} records checkpointed ({}). Run again to resume.",
                        name, records, reason
                    );
                    std::process::exit(1);
                }
                UnitOutcome::Interrupted { records } => {
                    eprintln!("{}: interrupted with {} records checkpointed.", name, records);
                    std::process::exit(130);
                }
            }
        }

        Commands::Export {
            force,
            known_domains,
        } => {
            let index = if known_domains.is_empty() {
                None
            } else {
                let index = KnownDomainIndex::load_dirs(&known_domains)?;
                info!("Loaded {} known domain(s)", index.len());
                Some(index)
            };

            let outcome = export::rebuild_if_changed(&config, index.as_ref(), force)?;
            export::print_export_summary(&outcome, &config.export.csv_path);
        }

        Commands::CollectIps {
            source,
            output,
            glob,
        } => {
            collect_ips(&source, &output, &glob)?;
        }

        Commands::Cves {
            input,
            column,
            store_dir,
            refresh_all,
        } => {
            let store_dir = store_dir.unwrap_or_else(|| {
                input
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."))
            });
            lookup_cves(&config, &input, &column, &store_dir, refresh_all, &interrupt).await?;
        }

        Commands::Status { input, key_column } => {
            let keys = parse_key_file(&input, &key_column)?;
            let report = harvest::status_report(
                &config,
                &keys,
                RescanPolicy::SkipCompleted,
                Utc::now().date_naive(),
            )?;
            harvest::print_status(&report);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the `-v` count
fn init_tracing(verbosity: VerbosityLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("harvester={}", verbosity.filter_directive())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn collect_ips(sources: &[PathBuf], output: &Path, glob: &str) -> Result<()> {
    let mut per_source = Vec::with_capacity(sources.len());
    for source in sources {
        let ips = merge::read_ipv4_source(source, glob)?;
        per_source.push((source.display().to_string(), ips));
    }

    let merged = merge::merge_key_sets(KeyKind::Ipv4, &per_source);

    let mut text = merged.combined.join("\n");
    if !merged.combined.is_empty() {
        text.push('\n');
    }
    write_atomic(output, text.as_bytes())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("\n=== IP Collection Summary ===");
    for (source, count) in &merged.per_source {
        let exclusive = merged.exclusive.get(source).copied().unwrap_or(0);
        println!("{}: {} addresses ({} only here)", source, count, exclusive);
    }
    if merged.rejected > 0 {
        println!("Rejected entries: {}", merged.rejected);
    }
    println!("Combined: {} addresses -> {}", merged.combined.len(), output.display());
    Ok(())
}

async fn lookup_cves(
    config: &HarvestConfig,
    input: &Path,
    column: &str,
    store_dir: &Path,
    refresh_all: bool,
    interrupt: &AtomicBool,
) -> Result<()> {
    let ids = cve::extract_cves_from_csv(input, column)?;
    cve::write_id_list(&store_dir.join(CVE_IDS_FILE), &ids)?;
    println!("Found {} distinct CVE id(s) in {}", ids.len(), input.display());

    let store = CveStore::new(store_dir);
    let mut records = store.load()?;
    let policy = RefreshPolicy::from_config(&config.refresh);
    let plan = cve::plan_lookups(&ids, &records, &policy, refresh_all, Utc::now());

    println!(
        "New: {}  Refresh: {}  Cached: {}  Kept (not in input): {}",
        plan.new_ids,
        plan.refreshed,
        plan.cached.saturating_sub(plan.refreshed),
        plan.extra_in_store
    );

    if plan.to_fetch.is_empty() {
        println!("Nothing to fetch; {} is up to date.", store.jsonl_path().display());
        return Ok(());
    }

    let fetcher = RateLimitedFetcher::build(
        Duration::from_secs(config.api.request_timeout_secs),
        &config.api.user_agent,
        &config.nvd.retry_config(),
    )?;
    let api_key = config.nvd.api_key();
    if api_key.is_none() {
        info!("No NVD API key set; requests use the public rate limit");
    }

    let summary = cve::fetch_cves(
        &fetcher,
        &config.nvd,
        api_key.as_deref(),
        &plan.to_fetch,
        &store,
        &mut records,
        interrupt,
    )
    .await?;

    println!("\n=== CVE Lookup Summary ===");
    println!("Fetched: {}", summary.fetched);
    println!("Failed:  {}", summary.failed.len());
    println!("Records: {}", summary.total_records);
    println!("Store:   {}", store.jsonl_path().display());
    println!("Summary: {}", store.csv_path().display());
    if !summary.failed.is_empty() {
        println!("Failed ids (retried next run): {}", summary.failed.join(", "));
    }
    if summary.interrupted {
        std::process::exit(130);
    }
    Ok(())
}
