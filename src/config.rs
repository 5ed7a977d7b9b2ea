//! Runner configuration.
//!
//! Settings come from three places, lowest to highest priority:
//! built-in defaults, an optional YAML file (`--config` or
//! `STACK_RUNNER_CONFIG`), and environment variables.
//!
//! Environment variables:
//! - `TASK_DB` - relational store path (default `./tasks.db`)
//! - `GRAPH_DB` - request graph store path (default `./graph.db`)
//! - `RUNS_DIR` - output directory for run artifacts (default `./runs`)
//! - `TASK_LEASE_SECONDS` - lease duration (default 300)
//! - `POLL_INTERVAL_MS` - daemon poll interval (default 2000)
//! - `STACK_TIMEOUT_SECONDS` - aggregate per-stack budget (default 3600)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the relational store (tasks, queues, stacks).
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Path to the request graph store.
    #[serde(default = "default_graph_db_path")]
    pub graph_db_path: PathBuf,

    /// Directory for run artifact JSON files.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,

    /// Lease duration for queue and stack node claims.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,

    /// Daemon sleep between empty polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Aggregate wall-clock budget for one stack run, in seconds.
    /// A stack still running past this is failed with "worker timeout".
    #[serde(default = "default_stack_timeout_seconds")]
    pub stack_timeout_seconds: i64,

    /// Backoff for settlement retries and backend-unavailable claims.
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Jitter factor in 0.0..=1.0 applied to each delay.
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_ms: default_retry_initial_ms(),
            max_ms: default_retry_max_ms(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./tasks.db")
}

fn default_graph_db_path() -> PathBuf {
    PathBuf::from("./graph.db")
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("./runs")
}

fn default_lease_seconds() -> i64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_stack_timeout_seconds() -> i64 {
    3_600
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            graph_db_path: default_graph_db_path(),
            runs_dir: default_runs_dir(),
            lease_seconds: default_lease_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            stack_timeout_seconds: default_stack_timeout_seconds(),
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, then apply env overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path.as_ref()))?;
        config.apply_env();
        Ok(config)
    }

    /// Load from `STACK_RUNNER_CONFIG` if set, then a user-level
    /// `~/.stack-runner/config.yaml`, else defaults + env.
    pub fn load_or_default() -> Self {
        if let Ok(path) = std::env::var("STACK_RUNNER_CONFIG") {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Ignoring config file {}: {}", path, e);
                }
            }
        }
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".stack-runner").join("config.yaml");
            if user_config.exists() {
                match Self::load(&user_config) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Ignoring config file {:?}: {}", user_config, e);
                    }
                }
            }
        }
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Apply environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TASK_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GRAPH_DB") {
            self.graph_db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RUNS_DIR") {
            self.runs_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TASK_LEASE_SECONDS") {
            if let Ok(n) = v.parse() {
                self.lease_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.poll_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("STACK_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                self.stack_timeout_seconds = n;
            }
        }
    }

    /// Ensure parent directories for the databases and the runs dir exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for db in [&self.db_path, &self.graph_db_path] {
            if let Some(parent) = db.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {:?}", parent))?;
                }
            }
        }
        std::fs::create_dir_all(&self.runs_dir)
            .with_context(|| format!("Failed to create {:?}", self.runs_dir))?;
        Ok(())
    }

    /// Stable worker identity: hostname:pid.
    pub fn worker_id() -> String {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());
        format!("{}:{}", hostname, std::process::id())
    }
}
