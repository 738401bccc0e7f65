//! Sync configuration
//!
//! Loaded once at start-up from `config.json` (or a `.toml` file), then
//! overlaid with environment variables. Placeholder credentials are
//! rejected before any client is built.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SyncError;

/// Values shipped in the sample config that mean "not configured"
pub const PLACEHOLDER_USERNAME: &str = "username";
pub const PLACEHOLDER_PASSWORD: &str = "password";
pub const PLACEHOLDER_API_KEY: &str = "apikey";

pub const DUNE_API_BASE: &str = "https://api.dune.com/api/v1";

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dune: DuneConfig,
    #[serde(default)]
    pub snowflake: SnowflakeConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuneConfig {
    #[serde(default)]
    pub apikey: String,

    #[serde(default = "default_dune_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for DuneConfig {
    fn default() -> Self {
        Self {
            apikey: String::new(),
            base_url: default_dune_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DuneConfig {
    /// Reject a missing or placeholder API key.
    pub fn validate(&self) -> Result<(), SyncError> {
        let key = self.apikey.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            return Err(SyncError::config(
                "dune.apikey is not set. Please update config.json or DUNE_API_KEY",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,

    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_warehouse")]
    pub warehouse: String,
    #[serde(default = "default_role")]
    pub role: String,

    /// Base URL override; defaults to `https://<account>.snowflakecomputing.com`
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Rows per INSERT statement during bulk load
    #[serde(default = "default_load_batch_size")]
    pub load_batch_size: usize,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            account: String::new(),
            database: default_database(),
            schema: default_schema(),
            warehouse: default_warehouse(),
            role: default_role(),
            host: None,
            request_timeout_secs: default_request_timeout_secs(),
            load_batch_size: default_load_batch_size(),
        }
    }
}

impl SnowflakeConfig {
    /// Reject missing or placeholder credentials.
    pub fn validate(&self) -> Result<(), SyncError> {
        let user = self.username.trim();
        let pw = self.password.trim();
        if user.is_empty() || pw.is_empty() || user == PLACEHOLDER_USERNAME || pw == PLACEHOLDER_PASSWORD
        {
            return Err(SyncError::config(
                "Snowflake username / password entry is invalid. Please update config.json",
            ));
        }
        if self.account.trim().is_empty() && self.host.is_none() {
            return Err(SyncError::config("snowflake.account is not set"));
        }
        if self.load_batch_size == 0 {
            return Err(SyncError::config("snowflake.load_batch_size must be positive"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        match &self.host {
            Some(h) => h.trim_end_matches('/').to_string(),
            None => format!("https://{}.snowflakecomputing.com", self.account.trim()),
        }
    }

    /// Connection string with the password redacted, for logs.
    pub fn connection_string(&self) -> String {
        format!(
            "snowflake://{}:***@{}/{}/{}?warehouse={}&role={}",
            self.username, self.account, self.database, self.schema, self.warehouse, self.role
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_query_id")]
    pub query_id: String,

    #[serde(default = "default_table")]
    pub table: String,

    /// Column holding the row timestamp, used for the watermark
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,

    #[serde(default = "default_begin_param")]
    pub begin_param: String,

    #[serde(default = "default_end_param")]
    pub end_param: String,

    /// Upper bound passed to the query on every run
    #[serde(default = "default_end_date")]
    pub end_date: String,

    /// Lower bound for a run against a missing or empty table
    #[serde(default = "default_initial_begin_date")]
    pub initial_begin_date: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// 0 disables the limit
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Wrap scrub and load in one warehouse transaction
    #[serde(default = "default_transactional")]
    pub transactional: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            query_id: default_query_id(),
            table: default_table(),
            timestamp_column: default_timestamp_column(),
            begin_param: default_begin_param(),
            end_param: default_end_param(),
            end_date: default_end_date(),
            initial_begin_date: default_initial_begin_date(),
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            transactional: default_transactional(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0).then(|| Duration::from_secs(self.max_wait_secs))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.query_id.trim().is_empty() {
            return Err(SyncError::config("sync.query_id is empty"));
        }
        for (name, value) in [
            ("sync.end_date", &self.end_date),
            ("sync.initial_begin_date", &self.initial_begin_date),
        ] {
            if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
                return Err(SyncError::config(format!(
                    "{} '{}' is not a YYYY-MM-DD date",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

fn default_dune_base_url() -> String {
    DUNE_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_database() -> String {
    "USER_TB".to_string()
}

fn default_schema() -> String {
    "PUBLIC".to_string()
}

fn default_warehouse() -> String {
    "XS".to_string()
}

fn default_role() -> String {
    "PUBLIC".to_string()
}

fn default_load_batch_size() -> usize {
    5000
}

fn default_query_id() -> String {
    "2030153".to_string()
}

fn default_table() -> String {
    "maker_tx_level_accounting".to_string()
}

fn default_timestamp_column() -> String {
    "ts".to_string()
}

fn default_begin_param() -> String {
    "begin_dt".to_string()
}

fn default_end_param() -> String {
    "end_dt".to_string()
}

fn default_end_date() -> String {
    "2099-12-31".to_string()
}

fn default_initial_begin_date() -> String {
    "1970-01-01".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    4 * 60 * 60
}

fn default_transactional() -> bool {
    true
}

impl AppConfig {
    /// Load from a JSON or TOML file (chosen by extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&contents, path)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        let is_toml = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let config: Self = if is_toml {
            toml::from_str(contents).map_err(|e| SyncError::config(e.to_string()))?
        } else {
            serde_json::from_str(contents).map_err(|e| SyncError::config(e.to_string()))?
        };
        Ok(config)
    }

    /// Load `.env` files, then the config file, then apply env overrides.
    pub fn from_env(path: impl AsRef<Path>) -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Like `from_env`, but without an explicit path `config.json` is
    /// optional and defaults plus env overrides are used when it is absent.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_env(p),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_env(DEFAULT_CONFIG_PATH),
            None => {
                dotenv::dotenv().ok();
                let mut config = Self::default();
                config.apply_overrides(|key| std::env::var(key).ok());
                Ok(config)
            }
        }
    }

    /// Overlay non-empty values from `lookup` (normally the process env).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DUNE_API_KEY") {
            self.dune.apikey = v;
        }
        if let Some(v) = get("DUNE_API_BASE_URL") {
            self.dune.base_url = v;
        }
        if let Some(v) = get("SNOWFLAKE_USERNAME") {
            self.snowflake.username = v;
        }
        if let Some(v) = get("SNOWFLAKE_PASSWORD") {
            self.snowflake.password = v;
        }
        if let Some(v) = get("SNOWFLAKE_ACCOUNT") {
            self.snowflake.account = v;
        }
        if let Some(v) = get("SYNC_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.sync.poll_interval_secs = v;
        }
    }

    /// Pre-flight guard: nothing talks to the network until this passes.
    pub fn validate(&self, needs_snowflake: bool) -> Result<(), SyncError> {
        self.dune.validate()?;
        if needs_snowflake {
            self.snowflake.validate()?;
        }
        self.sync.validate()
    }
}
