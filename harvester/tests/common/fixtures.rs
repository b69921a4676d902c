use harvester::config::{HarvestConfig, DEFAULT_CONFIG};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config rooted at `root`, pointed at `endpoint`, with every delay
/// shortened so tests run in milliseconds.
pub fn test_config(root: &Path, endpoint: &str) -> HarvestConfig {
    let mut config = HarvestConfig::from_toml_str(DEFAULT_CONFIG).expect("default config parses");

    config.api.endpoint = endpoint.to_string();
    config.api.page_size = 2;
    config.retry.backoff_base_delay_ms = 10;
    config.retry.backoff_max_delay_ms = 50;
    config.throttle.inter_page_delay_ms = 0;
    config.throttle.inter_unit_delay_ms = 0;
    config.throttle.batch_size = 0;
    config.output.output_dir = root.join("out");
    config.output.checkpoint_dir = Some(root.join("checkpoints"));
    config.output.log_dir = root.join("logs");
    config.export.csv_path = root.join("export").join("all.csv");
    config.export.manifest_path = root.join("export").join("_manifest.json");
    config
}

/// Write `value` as a harvest output file and return its path
pub fn write_output(dir: &Path, name: &str, value: &Value) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

pub fn read_json(path: &Path) -> Value {
    let text = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    serde_json::from_str(&text)
        .unwrap_or_else(|e| panic!("Failed to parse {}: {}", path.display(), e))
}
