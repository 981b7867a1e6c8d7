use std::fs;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Service runtime configuration, loaded from a YAML file with environment
/// variable overrides for the address fields.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub develop_mode: bool,
    #[serde(default = "default_submit_limit")]
    pub submit_limit: usize,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub admin_database: AdminDbConfig,
    #[serde(default)]
    pub dp_libraries: DpLibrariesConfig,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub dataset_cache: DatasetCacheSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            develop_mode: false,
            submit_limit: default_submit_limit(),
            server: ServerSettings::default(),
            admin_database: AdminDbConfig::default(),
            dp_libraries: DpLibrariesConfig::default(),
            broker: BrokerSettings::default(),
            dataset_cache: DatasetCacheSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host_ip")]
    pub host_ip: String,
    #[serde(default = "default_host_port")]
    pub host_port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub time_attack: Option<TimeAttack>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host_ip: default_host_ip(),
            host_port: default_host_port(),
            workers: default_workers(),
            log_level: default_log_level(),
            time_attack: None,
        }
    }
}

/// Response-timing shaper selection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct TimeAttack {
    pub method: TimeAttackMethod,
    /// Seconds: jitter upper bound, or the stall floor.
    pub magnitude: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeAttackMethod {
    Jitter,
    Stall,
}

/// Admin store backend, discriminated by `db_type`.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "db_type", rename_all = "snake_case")]
pub enum AdminDbConfig {
    Yaml { db_file: String },
    InMemory,
}

impl Default for AdminDbConfig {
    fn default() -> Self {
        AdminDbConfig::InMemory
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DpLibrariesConfig {
    #[serde(default)]
    pub opendp: OpendpFeatures,
}

/// Feature switches forwarded to the opendp-style backend.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct OpendpFeatures {
    #[serde(default = "default_true")]
    pub contrib: bool,
    #[serde(default = "default_true")]
    pub floating_point: bool,
}

impl Default for OpendpFeatures {
    fn default() -> Self {
        Self {
            contrib: true,
            floating_point: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BrokerSettings {
    /// High-water mark per library partition; admissions beyond it are
    /// rejected with a retryable signal before any debit.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct DatasetCacheSettings {
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
}

impl Default for DatasetCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

fn default_submit_limit() -> usize {
    50
}

fn default_host_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_host_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_depth() -> usize {
    64
}

fn default_reply_timeout_secs() -> u64 {
    60
}

fn default_cache_entries() -> u64 {
    8
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file at {}", path))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .context(format!("Failed to parse config file at {}", path))?;

        // Environment variable overrides for server settings
        if let Ok(ip) = std::env::var("VEIL_SERVER__HOST_IP") {
            config.server.host_ip = ip;
        }
        if let Ok(port) = std::env::var("VEIL_SERVER__HOST_PORT") {
            config.server.host_port = port
                .parse()
                .context("VEIL_SERVER__HOST_PORT is not a port number")?;
        }

        Ok(config)
    }
}

// Secrets
// ---------------------------------------------------------------------------

/// Secrets are kept in a separate file so the main config can be committed.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Secrets {
    #[serde(default)]
    pub private_db_credentials: Vec<S3Credentials>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Credentials {
    pub credentials_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Secrets {
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read secrets file at {}", path))?;
        serde_yaml::from_str(&content).context("Failed to parse secrets file")
    }

    pub fn find(&self, credentials_name: &str) -> Option<&S3Credentials> {
        self.private_db_credentials
            .iter()
            .find(|c| c.credentials_name == credentials_name)
    }
}
