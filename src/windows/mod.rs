//! OS introspection surfaces used by the collectors and the tracker.
//!
//! Each surface is a trait so the engine and the tracker can run against
//! fakes. [`Backends::system`] wires the real implementations: `winreg` and
//! PowerShell on Windows, "not available" stand-ins elsewhere.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod powershell;
pub mod process;
pub mod shared_read;

#[cfg(target_os = "windows")]
mod registry;

#[cfg(not(target_os = "windows"))]
mod mock_impl;

#[cfg(target_os = "windows")]
pub use powershell::{PowerShellCim, PowerShellEventLog};
#[cfg(target_os = "windows")]
pub use registry::WinRegistry;

#[cfg(not(target_os = "windows"))]
pub use mock_impl::Unavailable;

pub use process::ProcessRunner;
pub use shared_read::open_shared_read;

/// A registry value converted out of its raw form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegValue {
    String(String),
    MultiString(Vec<String>),
    Dword(u32),
    Qword(u64),
    Binary(Vec<u8>),
}

impl RegValue {
    pub fn to_json(&self) -> Value {
        match self {
            RegValue::String(s) => Value::String(s.clone()),
            RegValue::MultiString(v) => Value::from(v.clone()),
            RegValue::Dword(d) => Value::from(*d),
            RegValue::Qword(q) => Value::from(*q),
            RegValue::Binary(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                Value::String(hex)
            }
        }
    }

    /// Numeric view for DWORD/QWORD and numeric strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegValue::Dword(d) => Some(u64::from(*d)),
            RegValue::Qword(q) => Some(*q),
            RegValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Hierarchical configuration store (the registry).
///
/// Key paths are normalized `HIVE\Sub\Key` strings. A missing key or value
/// is `Ok(None)` / `Ok(false)`, not an error.
pub trait ConfigStore: Send + Sync {
    fn key_exists(&self, key: &str) -> Result<bool>;
    fn read_value(&self, key: &str, name: &str) -> Result<Option<RegValue>>;
    /// Up to `limit` values under `key`, in enumeration order.
    fn values(&self, key: &str, limit: usize) -> Result<Vec<(String, RegValue)>>;
    fn subkeys(&self, key: &str) -> Result<Vec<String>>;
}

/// WMI/CIM query interface.
pub trait ManagementQuery: Send + Sync {
    /// Run `query` in `namespace`, returning at most `max_results` objects.
    fn query(&self, namespace: &str, query: &str, max_results: usize) -> Result<Vec<Map<String, Value>>>;
}

/// Filter for an event log read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub channel: String,
    pub providers: Vec<String>,
    pub event_ids: Vec<u32>,
    pub since: Option<DateTime<Utc>>,
    /// Only records with a larger record id
    pub after_record_id: Option<u64>,
    pub max_events: usize,
    pub newest_first: bool,
}

impl EventQuery {
    pub fn new(channel: impl Into<String>, max_events: usize) -> Self {
        Self {
            channel: channel.into(),
            max_events,
            newest_first: true,
            ..Self::default()
        }
    }

    pub fn event_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.event_ids = ids.into_iter().collect();
        self
    }

    pub fn providers(mut self, providers: impl IntoIterator<Item = String>) -> Self {
        self.providers = providers.into_iter().collect();
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn after_record(mut self, record_id: u64) -> Self {
        self.after_record_id = Some(record_id);
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// True when `record` passes every filter except the count limit.
    pub fn matches(&self, record: &EventRecord) -> bool {
        record.channel.eq_ignore_ascii_case(&self.channel)
            && (self.providers.is_empty()
                || self.providers.iter().any(|p| p.eq_ignore_ascii_case(&record.provider)))
            && (self.event_ids.is_empty() || self.event_ids.contains(&record.event_id))
            && self.since.map_or(true, |since| record.time_created >= since)
            && self.after_record_id.map_or(true, |after| record.record_id > after)
    }
}

/// One event log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub channel: String,
    pub provider: String,
    pub event_id: u32,
    pub record_id: u64,
    pub time_created: DateTime<Utc>,
    #[serde(default)]
    pub level: Option<u8>,
    #[serde(default)]
    pub message: String,
}

/// Live and historical system event log.
pub trait EventLogSource: Send + Sync {
    fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>>;

    /// Record id of the newest entry in `channel`, if any.
    fn latest_record_id(&self, channel: &str) -> Result<Option<u64>> {
        let newest = self.query(&EventQuery::new(channel, 1))?;
        Ok(newest.first().map(|r| r.record_id))
    }
}

/// Captured result of a finished (or killed) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Restricted process execution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command_line: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// The full set of OS surfaces handed to the engine and the tracker.
#[derive(Clone)]
pub struct Backends {
    pub registry: Arc<dyn ConfigStore>,
    pub wmi: Arc<dyn ManagementQuery>,
    pub event_log: Arc<dyn EventLogSource>,
    pub commands: Arc<dyn CommandRunner>,
}

impl Backends {
    /// Real implementations for the current platform.
    #[cfg(target_os = "windows")]
    pub fn system() -> Self {
        Self {
            registry: Arc::new(WinRegistry),
            wmi: Arc::new(PowerShellCim),
            event_log: Arc::new(PowerShellEventLog),
            commands: Arc::new(ProcessRunner),
        }
    }

    /// Real implementations for the current platform.
    #[cfg(not(target_os = "windows"))]
    pub fn system() -> Self {
        Self {
            registry: Arc::new(Unavailable),
            wmi: Arc::new(Unavailable),
            event_log: Arc::new(Unavailable),
            commands: Arc::new(ProcessRunner),
        }
    }
}
