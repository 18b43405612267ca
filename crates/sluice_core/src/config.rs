//! Process configuration loaded with Figment.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. `sluice.toml` (in the data directory, or an explicit path)
//! 3. Environment variables prefixed `SLUICE_`, nested keys split by `__`
//!    (e.g. `SLUICE_TUNNEL__RETRY_MAX_TIMES=5`)

use crate::error::SluiceResult;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for all settings.
const ENV_PREFIX: &str = "SLUICE_";

/// Default config file name inside the data directory.
const CONFIG_FILE_NAME: &str = "sluice.toml";

/// Core configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Directory holding the SQLite store and logs.
    /// Env: `SLUICE_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base64-encoded 32-byte AES-256 key for the credential vault.
    /// Env: `SLUICE_ENCRYPTION_KEY`. No default: the vault refuses to start without it.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Driver connect timeout in seconds. Default: `10`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Server-side statement timeout in seconds (`None` disables). Default: `60`.
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: Option<u64>,

    /// Maximum rows returned by an arbitrary query. Default: `10000`.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,

    /// Upper bound on the page size of a table read. Default: `500`.
    #[serde(default = "default_max_page_rows")]
    pub max_page_rows: i64,

    /// Entries per query history page. Default: `25`.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    /// Optional tracing filter directive overriding `SLUICE_LOG`/`RUST_LOG`.
    #[serde(default)]
    pub log_filter: Option<String>,

    /// SSH tunnel dial policy.
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// SSH tunnel dial policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Timeout for a single dial + handshake attempt. Default: `10`.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Retries after the first failed dial. Default: `2`.
    #[serde(default = "default_retry_max_times")]
    pub retry_max_times: usize,

    /// First backoff delay in milliseconds. Default: `200`.
    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,

    /// Backoff cap in milliseconds. Default: `2000`.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl CoreConfig {
    /// Builds a Figment over defaults, the TOML file in the default data dir, and the environment.
    pub fn figment() -> Figment {
        Self::figment_with_file(default_data_dir().join(CONFIG_FILE_NAME))
    }

    /// Builds a Figment that reads the given TOML file (missing files are ignored).
    pub fn figment_with_file(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(CoreConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from the default sources.
    pub fn load() -> SluiceResult<Self> {
        Ok(Self::figment().extract()?)
    }

    /// Load configuration with an explicit TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> SluiceResult<Self> {
        Ok(Self::figment_with_file(path).extract()?)
    }

    /// Driver connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Server-side statement timeout, if enabled.
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Path of the SQLite store.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sluice.db")
    }

    /// Directory for rotating log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            encryption_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
            max_result_rows: default_max_result_rows(),
            max_page_rows: default_max_page_rows(),
            history_page_size: default_history_page_size(),
            log_filter: None,
            tunnel: TunnelConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Per-attempt dial timeout.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout_secs(),
            retry_max_times: default_retry_max_times(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Get the default data directory for the service.
///
/// Debug builds use `./sluice_data` in the current directory.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./sluice_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| d.join("sluice"))
            .unwrap_or_else(|| PathBuf::from("./sluice_data"))
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_statement_timeout_secs() -> Option<u64> {
    Some(60)
}

fn default_max_result_rows() -> usize {
    10_000
}

fn default_max_page_rows() -> i64 {
    500
}

fn default_history_page_size() -> usize {
    25
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_retry_max_times() -> usize {
    2
}

fn default_retry_min_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}
