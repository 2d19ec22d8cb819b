use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::constants::{
    BACKFILL_LOOKBACK_MINUTES, COMMAND_STDERR_BUDGET, COMMAND_STDOUT_BUDGET, COMMAND_TIMEOUT_SECS,
    DEFAULT_EVENTLOG_FILTER_WINDOW, DEFAULT_MAX_LOG_LINES, HELLO_COMPLETION_TIMEOUT_SECS, HELLO_WAIT_TIMEOUT_SECS,
    POLICY_POLL_INTERVAL_SECS, WATCHER_POLL_INTERVAL_SECS,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file: None }
    }
}

/// Timer lengths and poll intervals for the provisioning tracker.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub hello_wait_timeout_secs: u64,
    pub hello_completion_timeout_secs: u64,
    pub policy_poll_interval_secs: u64,
    pub watcher_poll_interval_secs: u64,
    pub backfill_lookback_minutes: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            hello_wait_timeout_secs: HELLO_WAIT_TIMEOUT_SECS,
            hello_completion_timeout_secs: HELLO_COMPLETION_TIMEOUT_SECS,
            policy_poll_interval_secs: POLICY_POLL_INTERVAL_SECS,
            watcher_poll_interval_secs: WATCHER_POLL_INTERVAL_SECS,
            backfill_lookback_minutes: BACKFILL_LOOKBACK_MINUTES,
        }
    }
}

impl TrackerConfig {
    pub fn hello_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_wait_timeout_secs)
    }

    pub fn hello_completion_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_completion_timeout_secs)
    }

    pub fn policy_poll_interval(&self) -> Duration {
        Duration::from_secs(self.policy_poll_interval_secs.max(1))
    }

    pub fn watcher_poll_interval(&self) -> Duration {
        Duration::from_secs(self.watcher_poll_interval_secs.max(1))
    }

    pub fn backfill_lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.backfill_lookback_minutes.max(0))
    }
}

/// Limits applied by the collection engine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CollectionSettings {
    pub command_timeout_secs: u64,
    pub stdout_budget: usize,
    pub stderr_budget: usize,
    pub max_log_lines: usize,
    /// Newest event log entries searched by a message-filtered rule
    pub eventlog_filter_window: usize,
    /// Persist log parser cursors here; memory-only when unset.
    pub cursor_state_path: Option<PathBuf>,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: COMMAND_TIMEOUT_SECS,
            stdout_budget: COMMAND_STDOUT_BUDGET,
            stderr_budget: COMMAND_STDERR_BUDGET,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            eventlog_filter_window: DEFAULT_EVENTLOG_FILTER_WINDOW,
            cursor_state_path: None,
        }
    }
}

impl CollectionSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Top-level agent configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub logging: LoggingConfig,
    pub tracker: TrackerConfig,
    pub collection: CollectionSettings,
    /// Rule set loaded at startup
    pub rules_path: Option<PathBuf>,
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .context(format!("Failed to write config to {}", path.display()))?;

        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Load `path` if given and present, otherwise defaults.
    ///
    /// A file that exists but does not parse is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_yaml_file(path),
            Some(path) => {
                info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}
