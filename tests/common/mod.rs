//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use autopilot_monitor::windows::{
    Backends, CommandOutput, CommandRunner, ConfigStore, EventLogSource, EventQuery, EventRecord,
    ManagementQuery, RegValue,
};

#[derive(Default)]
pub struct FakeRegistry {
    pub keys: Mutex<BTreeMap<String, Vec<(String, RegValue)>>>,
    pub reads: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn set(&self, key: &str, name: &str, value: RegValue) {
        let mut keys = self.keys.lock();
        let values = keys.entry(key.to_string()).or_default();
        values.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        values.push((name.to_string(), value));
    }
}

impl ConfigStore for FakeRegistry {
    fn key_exists(&self, key: &str) -> Result<bool> {
        self.reads.lock().push(key.to_string());
        Ok(self.keys.lock().contains_key(key))
    }

    fn read_value(&self, key: &str, name: &str) -> Result<Option<RegValue>> {
        self.reads.lock().push(key.to_string());
        Ok(self
            .keys
            .lock()
            .get(key)
            .and_then(|values| values.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)))
            .map(|(_, v)| v.clone()))
    }

    fn values(&self, key: &str, limit: usize) -> Result<Vec<(String, RegValue)>> {
        self.reads.lock().push(key.to_string());
        Ok(self.keys.lock().get(key).map(|v| v.iter().take(limit).cloned().collect()).unwrap_or_default())
    }

    fn subkeys(&self, key: &str) -> Result<Vec<String>> {
        self.reads.lock().push(key.to_string());
        let prefix = format!("{}\\", key);
        Ok(self
            .keys
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('\\'))
            .map(str::to_string)
            .collect())
    }
}

pub struct NoWmi;

impl ManagementQuery for NoWmi {
    fn query(&self, _namespace: &str, _query: &str, _max: usize) -> Result<Vec<Map<String, Value>>> {
        bail!("WMI not available in tests")
    }
}

#[derive(Default)]
pub struct FakeEventLog {
    pub records: Mutex<Vec<EventRecord>>,
}

impl FakeEventLog {
    pub fn push(&self, record: EventRecord) {
        self.records.lock().push(record);
    }
}

impl EventLogSource for FakeEventLog {
    fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let mut matching: Vec<EventRecord> =
            self.records.lock().iter().filter(|r| query.matches(r)).cloned().collect();
        matching.sort_by_key(|r| r.record_id);
        if query.newest_first {
            matching.reverse();
        }
        matching.truncate(query.max_events);
        Ok(matching)
    }
}

/// Records every command line it is asked to run.
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command_line: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().push(command_line.to_string());
        Ok(CommandOutput { exit_code: Some(0), stdout: b"done".to_vec(), ..Default::default() })
    }
}

pub struct Fixture {
    pub registry: Arc<FakeRegistry>,
    pub event_log: Arc<FakeEventLog>,
    pub runner: Arc<RecordingRunner>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(FakeRegistry::default()),
            event_log: Arc::new(FakeEventLog::default()),
            runner: Arc::new(RecordingRunner::default()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            registry: self.registry.clone(),
            wmi: Arc::new(NoWmi),
            event_log: self.event_log.clone(),
            commands: self.runner.clone(),
        }
    }
}

pub fn event_record(channel: &str, event_id: u32, record_id: u64, time: DateTime<Utc>, message: &str) -> EventRecord {
    EventRecord {
        channel: channel.to_string(),
        provider: String::new(),
        event_id,
        record_id,
        time_created: time,
        level: Some(4),
        message: message.to_string(),
    }
}

pub fn cmtrace_line(message: &str, component: &str, entry_type: u8) -> String {
    format!(
        "<![LOG[{}]LOG]!><time=\"08:00:00.000+000\" date=\"06-15-2024\" component=\"{}\" \
         context=\"\" type=\"{}\" thread=\"12\" file=\"\">\n",
        message, component, entry_type
    )
}

pub fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}
