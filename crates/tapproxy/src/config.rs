use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use rewrite_engine::ReplacerSpec;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    /// Ordered replacer items applied to every relayed chunk.
    #[serde(default)]
    pub replacers: Vec<ReplacerSpec>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_local")]
    pub local_addr: String,
    #[serde(default = "default_remote")]
    pub remote_addr: String,
    #[serde(default)]
    pub tls_unwrap: bool,
    /// `host:port` dialed when unwrapping TLS; defaults to `remote_addr`.
    #[serde(default)]
    pub tls_remote_addr: Option<String>,
    #[serde(default)]
    pub disable_nagle: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_addr: default_local(),
            remote_addr: default_remote(),
            tls_unwrap: false,
            tls_remote_addr: None,
            disable_nagle: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub output_hex: bool,
    /// JSON-lines event log; omitted means events are not recorded.
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output_hex: false,
            event_log_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RulesConfig {
    /// Rule file to compile and watch; omitted disables scanning.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            file: None,
            poll_interval_secs: default_poll_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_local() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_remote() -> String {
    "127.0.0.1:80".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_secs() -> u64 {
    2
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the defaults with a warning, so the proxy can run
/// from CLI flags alone.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
