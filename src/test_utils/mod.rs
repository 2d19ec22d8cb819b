//! Test utilities for the monitoring agent
//!
//! In-memory stand-ins for the OS surfaces and helpers for building log
//! fixtures, for use across unit test modules.

#![cfg(test)]

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::windows::{ConfigStore, EventLogSource, EventQuery, EventRecord, ManagementQuery, RegValue};

/// Format one CMTrace log line (with trailing newline).
pub fn cmtrace_line(message: &str, component: &str, entry_type: u8) -> String {
    format!(
        "<![LOG[{}]LOG]!><time=\"10:15:30.123+000\" date=\"05-01-2024\" component=\"{}\" \
         context=\"\" type=\"{}\" thread=\"4242\" file=\"agent.cpp:12\">\n",
        message, component, entry_type
    )
}

/// Append raw text to a file, creating it when missing.
pub fn append_to_file(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Registry keyed by normalized path. Keys listed in `failing` error out.
#[derive(Default)]
pub struct FakeRegistry {
    pub keys: BTreeMap<String, Vec<(String, RegValue)>>,
    pub failing: Vec<String>,
}

impl FakeRegistry {
    pub fn with_key(mut self, key: &str, values: Vec<(&str, RegValue)>) -> Self {
        self.keys.insert(
            key.to_string(),
            values.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
        );
        self
    }

    fn check(&self, key: &str) -> Result<()> {
        if self.failing.iter().any(|k| k == key) {
            bail!("Access denied to {}", key);
        }
        Ok(())
    }
}

impl ConfigStore for FakeRegistry {
    fn key_exists(&self, key: &str) -> Result<bool> {
        self.check(key)?;
        Ok(self.keys.contains_key(key))
    }

    fn read_value(&self, key: &str, name: &str) -> Result<Option<RegValue>> {
        self.check(key)?;
        Ok(self
            .keys
            .get(key)
            .and_then(|values| values.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)))
            .map(|(_, v)| v.clone()))
    }

    fn values(&self, key: &str, limit: usize) -> Result<Vec<(String, RegValue)>> {
        self.check(key)?;
        Ok(self.keys.get(key).map(|v| v.iter().take(limit).cloned().collect()).unwrap_or_default())
    }

    fn subkeys(&self, key: &str) -> Result<Vec<String>> {
        self.check(key)?;
        let prefix = format!("{}\\", key);
        Ok(self
            .keys
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('\\'))
            .map(|rest| rest.to_string())
            .collect())
    }
}

/// WMI answering every query with the same instances.
#[derive(Default)]
pub struct FakeWmi {
    pub instances: Vec<Map<String, Value>>,
    pub queries: Mutex<Vec<(String, String)>>,
}

impl ManagementQuery for FakeWmi {
    fn query(&self, namespace: &str, query: &str, max_results: usize) -> Result<Vec<Map<String, Value>>> {
        self.queries.lock().push((namespace.to_string(), query.to_string()));
        Ok(self.instances.iter().take(max_results).cloned().collect())
    }
}

/// Event log over a fixed set of records.
#[derive(Default)]
pub struct FakeEventLog {
    pub records: Mutex<Vec<EventRecord>>,
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
