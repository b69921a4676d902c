use crate::completion::RescanPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(about = "Resumable, rate-limited harvesting of paginated JSON search APIs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Create default configuration file at ./config/harvester.toml
    #[arg(long, global = true)]
    pub init: bool,

    /// Configuration file (defaults to ./config/harvester.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose logging (use -v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest every key in an input file that has no completed output yet
    Harvest {
        /// Key list: one key per line, CSV with a key column, or JSON array
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Column holding the key in CSV/JSON input
        #[arg(long, default_value = "key")]
        key_column: String,

        /// Fetch again keys whose newest output is not from today
        #[arg(long, conflicts_with = "rescan_all")]
        rescan_stale: bool,

        /// Fetch every key again, ignoring completed output
        #[arg(long, conflicts_with = "rescan_stale")]
        rescan_all: bool,
    },

    /// Run one resumable paginated query into a single output file
    Query {
        /// Query text sent to the search API
        #[arg(short, long)]
        query: String,

        /// Name used for the checkpoint and output file
        #[arg(short, long)]
        name: String,
    },

    /// Rebuild the combined CSV when the output files changed
    Export {
        /// Rebuild even if the manifest is unchanged
        #[arg(long)]
        force: bool,

        /// Directories of known domains to match against `fqdns`
        #[arg(long, value_name = "DIR", num_args = 1..)]
        known_domains: Vec<PathBuf>,
    },

    /// Merge IPv4 addresses from several sources into one sorted list
    CollectIps {
        /// Source directory, JSON file, or plain list (repeatable)
        #[arg(short, long, value_name = "PATH", num_args = 1.., required = true)]
        source: Vec<PathBuf>,

        /// Combined list, one address per line
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// File name pattern applied inside source directories
        #[arg(long, default_value = "*.json")]
        glob: String,
    },

    /// Look up CVE details for every CVE id found in an exported CSV
    Cves {
        /// Exported CSV to scan
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Column holding CVE ids
        #[arg(long, default_value = "service.cves")]
        column: String,

        /// Directory for the CVE store (defaults to the CSV's directory)
        #[arg(long, value_name = "DIR")]
        store_dir: Option<PathBuf>,

        /// Refetch every CVE regardless of cache age
        #[arg(long)]
        refresh_all: bool,
    },

    /// Show completion state for an input file without network access
    Status {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        #[arg(long, default_value = "key")]
        key_column: String,
    },
}

impl Commands {
    /// Rescan policy for the `harvest` subcommand flags
    pub fn rescan_policy(rescan_stale: bool, rescan_all: bool) -> RescanPolicy {
        if rescan_all {
            RescanPolicy::RescanAll
        } else if rescan_stale {
            RescanPolicy::RescanStale
        } else {
            RescanPolicy::SkipCompleted
        }
    }
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if !self.init && self.command.is_none() {
            return Err("A subcommand is required (see --help), or use --init".to_string());
        }

        match &self.command {
            Some(Commands::Query { query, name }) => {
                if query.trim().is_empty() {
                    return Err("Query cannot be empty".to_string());
                }
                if name.trim().is_empty() {
                    return Err("Name cannot be empty".to_string());
                }
            }
            Some(Commands::CollectIps { glob, .. }) if glob.trim().is_empty() => {
                return Err("Glob cannot be empty".to_string());
            }
            _ => {}
        }

        Ok(())
    }

    /// Whether the subcommand talks to the search API and so needs credentials
    pub fn needs_api_credentials(&self) -> bool {
        matches!(
            self.command,
            Some(Commands::Harvest { .. }) | Some(Commands::Query { .. })
        )
    }
}
