//! Configuration management.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// On-disk locations for datasets, run artifacts and explorations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run embedded migrations at startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per dataset
    #[serde(default = "default_datasets_path")]
    pub datasets_path: PathBuf,

    /// Root directory for trained model artifacts and trial histories
    #[serde(default = "default_runs_path")]
    pub runs_path: PathBuf,

    /// Root directory for exploration results
    #[serde(default = "default_explorations_path")]
    pub explorations_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            datasets_path: default_datasets_path(),
            runs_path: default_runs_path(),
            explorations_path: default_explorations_path(),
        }
    }
}

impl StorageConfig {
    /// All storage roots rooted under one directory. Used by tests.
    pub fn under(root: &Path) -> Self {
        Self {
            datasets_path: root.join("datasets"),
            runs_path: root.join("runs"),
            explorations_path: root.join("explorations"),
        }
    }

    /// Create every configured directory if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.datasets_path)?;
        std::fs::create_dir_all(&self.runs_path)?;
        std::fs::create_dir_all(&self.explorations_path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Start the drain loop at boot
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// Whether the boot-time loop exits once the queue is observed empty
    #[serde(default)]
    pub stop_when_empty: bool,

    /// Upper bound on how long an idle loop sleeps before re-checking the queue
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            stop_when_empty: false,
            poll_interval: default_poll_interval(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_database_url() -> String { "postgres://localhost:5432/labkit".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_true() -> bool { true }
fn default_datasets_path() -> PathBuf { PathBuf::from("data/datasets") }
fn default_runs_path() -> PathBuf { PathBuf::from("data/runs") }
fn default_explorations_path() -> PathBuf { PathBuf::from("data/explorations") }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }

impl Config {
    /// Load configuration from the environment (`LABKIT__SECTION__KEY`).
    pub fn load() -> anyhow::Result<Self> {
        Self::build(None)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Self::build(Some(path))
    }

    fn build(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("LABKIT").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Socket address string the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
