//! Configuration management for harvester
//!
//! All configuration is loaded from `./config/harvester.toml` (or the path given
//! with `--config`). The embedded template below is the only place defaults live;
//! components receive the parsed [`HarvestConfig`] at construction and never read
//! process-wide state.

use serde::Deserialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file path relative to working directory
pub const CONFIG_PATH: &str = "./config/harvester.toml";

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = include_str!("../config/harvester.toml");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid URL in '{field}': {url}")]
    InvalidUrl { field: String, url: String },

    #[error("Configuration field '{field}' cannot be empty")]
    EmptyRequired { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("No API credentials found (checked {checked})")]
    MissingCredentials { checked: String },
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct HarvestConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RateLimitConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub nvd: NvdConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// HTTP method used for page requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// Remote search API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub method: HttpMethod,
    pub page_size: u32,
    /// Per-unit query, with `{key}` and `{key_lower}` placeholders
    pub query_template: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Where the API token comes from and how it is sent
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub header: String,
    /// Prefix placed before the token, e.g. "Bearer"
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "Authorization".to_string(),
            scheme: Some("Bearer".to_string()),
            api_key_env: None,
            api_key_file: None,
        }
    }
}

impl AuthConfig {
    /// Resolve the API token: environment variable first, then the key file.
    /// Empty values count as missing so a run fails before any network call.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        let mut checked = Vec::new();

        if let Some(var) = &self.api_key_env {
            checked.push(format!("env {}", var));
            if let Ok(value) = std::env::var(var) {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(value.to_string());
                }
            }
        }

        if let Some(path) = &self.api_key_file {
            checked.push(format!("file {}", path.display()));
            if path.exists() {
                let value = fs::read_to_string(path)?;
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(value.to_string());
                }
            }
        }

        Err(ConfigError::MissingCredentials {
            checked: if checked.is_empty() {
                "no credential sources configured".to_string()
            } else {
                checked.join(", ")
            },
        })
    }

    /// Header value for a resolved token
    pub fn header_value(&self, token: &str) -> String {
        match self.scheme.as_deref().filter(|s| !s.is_empty()) {
            Some(scheme) => format!("{} {}", scheme, token),
            None => token.to_string(),
        }
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// base * attempt
    Linear,
    /// base * multiplier^(attempt - 1)
    Exponential,
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Extra attempts after the first one
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    pub backoff_max_delay_ms: u64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Linear,
            backoff_base_delay_ms: 3000,
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_delay_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    /// Attempt 0 means nothing has failed yet.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with(self.backoff_strategy, attempt)
    }

    /// Same as [`calculate_backoff_delay`](Self::calculate_backoff_delay) with an explicit strategy,
    /// for call sites that pick their own.
    pub fn backoff_delay_with(&self, strategy: BackoffStrategy, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.backoff_base_delay_ms as f64;
        let delay_ms = match strategy {
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => {
                base * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };

        let capped = delay_ms.min(self.backoff_max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Informal request budget between pages, units and batches
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    pub inter_page_delay_ms: u64,
    pub inter_unit_delay_ms: u64,
    /// Units fetched between long pauses (0 disables batch pauses)
    pub batch_size: usize,
    pub batch_sleep_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            inter_page_delay_ms: 1500,
            inter_unit_delay_ms: 600,
            batch_size: 10,
            batch_sleep_ms: 30_000,
        }
    }
}

impl ThrottleConfig {
    pub fn inter_page_delay(&self) -> Duration {
        Duration::from_millis(self.inter_page_delay_ms)
    }

    pub fn inter_unit_delay(&self) -> Duration {
        Duration::from_millis(self.inter_unit_delay_ms)
    }

    pub fn batch_sleep(&self) -> Duration {
        Duration::from_millis(self.batch_sleep_ms)
    }
}

/// Output locations and file naming
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub prefix: String,
    pub unit_id_field: String,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub retain_checkpoints: bool,
}

impl OutputConfig {
    /// Checkpoint directory, defaulting to a hidden folder inside the output directory
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".checkpoints"))
    }
}

/// Flatten and CSV export settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub csv_path: PathBuf,
    pub manifest_path: PathBuf,
    /// Files in the output directory that feed the export
    pub file_glob: String,
    pub list_separator: String,
    #[serde(default)]
    pub elided_suffixes: Vec<String>,
    #[serde(default)]
    pub truncated_suffixes: Vec<String>,
    pub max_cell_chars: usize,
    pub truncation_marker: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("./staging/export/harvest_all.csv"),
            manifest_path: PathBuf::from("./staging/export/_manifest_harvest.json"),
            file_glob: "*.json".to_string(),
            list_separator: ";".to_string(),
            elided_suffixes: vec!["service.tls.raw".to_string()],
            truncated_suffixes: Vec::new(),
            max_cell_chars: 2000,
            truncation_marker: "...[truncated]".to_string(),
        }
    }
}

/// NVD CVE lookup settings (single-record GETs, exponential backoff)
#[derive(Debug, Clone, Deserialize)]
pub struct NvdConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub request_delay_ms: u64,
    pub max_retries: u32,
    pub backoff_base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_delay_ms: u64,
    pub checkpoint_every: usize,
}

impl Default for NvdConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string(),
            api_key_env: Some("NVD_API_KEY".to_string()),
            request_delay_ms: 750,
            max_retries: 10,
            backoff_base_delay_ms: 750,
            backoff_multiplier: 1.7,
            backoff_max_delay_ms: 120_000,
            checkpoint_every: 25,
        }
    }
}

impl NvdConfig {
    /// Retry settings for NVD requests; always exponential
    pub fn retry_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_retries: self.max_retries,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_delay_ms: self.backoff_base_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            backoff_max_delay_ms: self.backoff_max_delay_ms,
        }
    }

    /// Optional NVD key; requests work without one at a lower rate
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Which staleness buckets trigger a refresh of cached records
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default)]
    pub older_than_week: bool,
    #[serde(default)]
    pub older_than_month: bool,
    #[serde(default)]
    pub missing_required_field: bool,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            older_than_week: false,
            older_than_month: true,
            missing_required_field: true,
            required_fields: vec!["cve_id".to_string(), "fetched_at".to_string()],
        }
    }
}

impl HarvestConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Path::new(CONFIG_PATH))
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HarvestConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("api.endpoint", &self.api.endpoint)?;
        validate_url("nvd.endpoint", &self.nvd.endpoint)?;

        if self.api.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.page_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.api.query_template.trim().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "api.query_template".to_string(),
            });
        }
        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::EmptyRequired {
                field: "api.request_timeout_secs".to_string(),
            });
        }
        if self.api.auth.header.trim().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "api.auth.header".to_string(),
            });
        }

        if self.output.prefix.trim().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "output.prefix".to_string(),
            });
        }
        if self.output.prefix.contains('/') || self.output.prefix.contains('\\') {
            return Err(ConfigError::InvalidValue {
                field: "output.prefix".to_string(),
                reason: "must not contain path separators".to_string(),
            });
        }
        if self.output.unit_id_field.trim().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "output.unit_id_field".to_string(),
            });
        }

        for (field, multiplier) in [
            ("retry.backoff_multiplier", self.retry.backoff_multiplier),
            ("nvd.backoff_multiplier", self.nvd.backoff_multiplier),
        ] {
            if !(multiplier >= 1.0) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("{} is below 1.0", multiplier),
                });
            }
        }

        if self.export.list_separator.is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "export.list_separator".to_string(),
            });
        }
        if self.export.file_glob.trim().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "export.file_glob".to_string(),
            });
        }

        Ok(())
    }

    /// Create default configuration file at the given location
    pub fn create_default_config(path: &Path) -> Result<PathBuf, ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;

        Ok(path.to_path_buf())
    }
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            field: field.to_string(),
            url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_parses() {
        let config: Result<HarvestConfig, _> = toml::from_str(DEFAULT_CONFIG);
        assert!(config.is_ok(), "Default config should parse: {:?}", config.err());
    }

    #[test]
    fn test_default_config_validates() {
        let config: HarvestConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(config.validate().is_ok(), "Default config should validate");
        assert_eq!(config.api.method, HttpMethod::Post);
        assert_eq!(config.retry.backoff_strategy, BackoffStrategy::Linear);
    }

    #[test]
    fn test_optional_sections_default() {
        let config_str = r#"
[api]
endpoint = "http://127.0.0.1:9999/search"
method = "GET"
page_size = 50
query_template = "domain = {key}"
request_timeout_secs = 5
user_agent = "test/1.0"

[output]
output_dir = "./out"
prefix = "test"
unit_id_field = "domain"
log_dir = "./logs"
"#;

        let config = HarvestConfig::from_toml_str(config_str).expect("Config should parse");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.throttle.batch_size, 10);
        assert_eq!(config.export.list_separator, ";");
        assert_eq!(config.api.auth.header, "Authorization");
        assert_eq!(config.output.checkpoint_dir(), PathBuf::from("./out/.checkpoints"));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut config: HarvestConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.api.endpoint = "ftp://example.com".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let mut config: HarvestConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.api.page_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_backoff_calculation_linear() {
        let config = RateLimitConfig {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Linear,
            backoff_base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_delay_ms: 30000,
        };

        assert_eq!(config.calculate_backoff_delay(0), Duration::ZERO);
        assert_eq!(config.calculate_backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(config.calculate_backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(config.calculate_backoff_delay(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_calculation_exponential() {
        let config = RateLimitConfig {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_delay_ms: 1000,
            backoff_multiplier: 1.5,
            backoff_max_delay_ms: 30000,
        };

        assert_eq!(config.calculate_backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(config.calculate_backoff_delay(2), Duration::from_millis(1500));
        assert_eq!(config.calculate_backoff_delay(3), Duration::from_millis(2250));
    }

    #[test]
    fn test_backoff_max_cap() {
        let config = RateLimitConfig {
            max_retries: 10,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_delay_ms: 5000,
        };

        assert_eq!(config.calculate_backoff_delay(10), Duration::from_millis(5000));
        assert_eq!(
            config.backoff_delay_with(BackoffStrategy::Linear, 4),
            Duration::from_millis(4000)
        );
    }

    #[test]
    fn test_api_key_from_file() {
        let tmp = TempDir::new().unwrap();
        let key_path = tmp.path().join("key.txt");
        fs::write(&key_path, "  secret-token\n").unwrap();

        let auth = AuthConfig {
            header: "Authorization".to_string(),
            scheme: Some("Bearer".to_string()),
            api_key_env: Some("HARVESTER_TEST_KEY_THAT_IS_NOT_SET".to_string()),
            api_key_file: Some(key_path),
        };

        let token = auth.resolve_api_key().unwrap();
        assert_eq!(token, "secret-token");
        assert_eq!(auth.header_value(&token), "Bearer secret-token");
    }

    #[test]
    fn test_empty_key_file_is_missing_credentials() {
        let tmp = TempDir::new().unwrap();
        let key_path = tmp.path().join("key.txt");
        fs::write(&key_path, "   \n").unwrap();

        let auth = AuthConfig {
            header: "X-Api-Key".to_string(),
            scheme: None,
            api_key_env: None,
            api_key_file: Some(key_path),
        };

        assert!(matches!(
            auth.resolve_api_key(),
            Err(ConfigError::MissingCredentials { .. })
        ));
        assert_eq!(auth.header_value("abc"), "abc");
    }

    #[test]
    fn test_create_default_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config").join("harvester.toml");
        HarvestConfig::create_default_config(&path).unwrap();
        assert!(HarvestConfig::load_from_path(&path).is_ok());
    }
}
