pub mod checkpoint;
pub mod cli;
pub mod completion;
pub mod config;
pub mod cve;
pub mod decode;
pub mod domain_utils;
pub mod export;
pub mod fetcher;
pub mod flatten;
pub mod harvest;
pub mod logger;
pub mod manifest;
pub mod merge;
pub mod pagination;
pub mod units;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::HarvestConfig;
pub use fetcher::{FetchFailure, FetchRequest, JsonFetch, RateLimitedFetcher};
pub use harvest::HarvestEngine;
