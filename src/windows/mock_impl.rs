use anyhow::{bail, Result};
use log::debug;
use serde_json::{Map, Value};

use crate::windows::{ConfigStore, EventLogSource, EventQuery, EventRecord, ManagementQuery, RegValue};

/// Stand-in for the Windows-only surfaces on other platforms.
///
/// Every call fails with a "not available" error, which the collectors
/// report as an expected-absent facility.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl ConfigStore for Unavailable {
    fn key_exists(&self, key: &str) -> Result<bool> {
        debug!("Registry lookup of {} on a non-Windows platform", key);
        bail!("Registry is not available on this platform")
    }

    fn read_value(&self, _key: &str, _name: &str) -> Result<Option<RegValue>> {
        bail!("Registry is not available on this platform")
    }

    fn values(&self, _key: &str, _limit: usize) -> Result<Vec<(String, RegValue)>> {
        bail!("Registry is not available on this platform")
    }

    fn subkeys(&self, _key: &str) -> Result<Vec<String>> {
        bail!("Registry is not available on this platform")
    }
}

impl ManagementQuery for Unavailable {
    fn query(&self, _namespace: &str, _query: &str, _max_results: usize) -> Result<Vec<Map<String, Value>>> {
        bail!("WMI is not available on this platform")
    }
}

impl EventLogSource for Unavailable {
    fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        bail!("Event log channel {} is not available on this platform", query.channel)
    }
}
