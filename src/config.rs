//! TOML configuration for jobrelay.
//!
//! Layered model: compiled-in defaults, overridden by a config file found via
//! the `JOBRELAY_CONFIG` environment variable or `./jobrelay.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration shared by the host (`serve`) and controller subcommands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobrelayConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl JobrelayConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded jobrelay configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `JOBRELAY_CONFIG` environment variable.
    /// 2. `./jobrelay.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        // 1. Environment variable override.
        if let Ok(env_path) = std::env::var("JOBRELAY_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "JOBRELAY_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        // 2. Working directory.
        let local_path = Path::new("jobrelay.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        // 3. Defaults.
        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Request store location and lock-contention tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file shared by controller and host.
    pub path: PathBuf,
    /// SQLite `busy_timeout` applied to every pooled connection.
    pub busy_timeout_ms: u64,
    pub pool_size: u32,
    /// How long a pool checkout may wait before counting as contention.
    pub connection_timeout_ms: u64,
    /// Attempts (including the first) before an operation reports
    /// `store-unavailable`.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/jobrelay.db"),
            busy_timeout_ms: 2_000,
            pool_size: 4,
            connection_timeout_ms: 2_000,
            retry_attempts: 5,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Host loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Period of the host's own idle-loop tick.
    pub idle_interval_ms: u64,
    /// Capacity of the main-context mailbox.
    pub mailbox_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 500,
            mailbox_capacity: 256,
        }
    }
}

impl HostConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.max(10))
    }
}

// ---------------------------------------------------------------------------
// Background poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// Used until an operator persists a choice in the store.
    pub enabled_by_default: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            enabled_by_default: true,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Directory the host capability writes result artifacts into.
    pub results_dir: PathBuf,
    /// Wall-clock bound from claim to completion.
    pub timeout_secs: u64,
    /// How often the fallback path looks for a new artifact.
    pub check_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("TestResults"),
            timeout_secs: 300,
            check_interval_ms: 2_000,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// External runner program driven by `serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub program: PathBuf,
    /// Arguments placed before the generated filter arguments.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("run-host-tests"),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy_constants() {
        let cfg = JobrelayConfig::default();
        assert_eq!(cfg.executor.timeout(), Duration::from_secs(300));
        assert_eq!(cfg.executor.check_interval(), Duration::from_secs(2));
        assert!(cfg.poller.enabled_by_default);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let cfg: JobrelayConfig = toml::from_str(
            r#"
            [executor]
            timeout_secs = 900

            [store]
            path = "/tmp/queue.db"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.executor.timeout_secs, 900);
        assert_eq!(cfg.executor.check_interval_ms, 2_000);
        assert_eq!(cfg.store.path, PathBuf::from("/tmp/queue.db"));
        assert_eq!(cfg.store.retry_attempts, 5);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = JobrelayConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
