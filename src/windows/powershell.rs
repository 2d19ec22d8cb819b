//! CIM and event log access through `powershell.exe`, parsed from JSON.
//!
//! Script construction and output parsing are plain functions so they are
//! tested on every platform; only the process launch is Windows-only.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::windows::{EventQuery, EventRecord};

/// Environment variables the scripts read rule-supplied values from.
pub const ENV_CIM_NAMESPACE: &str = "AUTOPILOT_MONITOR_CIM_NAMESPACE";
pub const ENV_CIM_QUERY: &str = "AUTOPILOT_MONITOR_CIM_QUERY";
pub const ENV_EVENT_CHANNEL: &str = "AUTOPILOT_MONITOR_EVENT_CHANNEL";
pub const ENV_EVENT_XPATH: &str = "AUTOPILOT_MONITOR_EVENT_XPATH";

/// A fixed script plus the environment carrying its arguments.
///
/// Rule text only ever travels in `env`. PowerShell expands `$env:` references
/// as argument values and never parses them as script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInvocation {
    pub script: String,
    pub env: Vec<(&'static str, String)>,
}

/// `Get-CimInstance` for an approved query.
pub fn cim_invocation(namespace: &str, query: &str, max_results: usize) -> ScriptInvocation {
    let script = format!(
        "Get-CimInstance -Namespace $env:{} -Query $env:{} -ErrorAction Stop \
         | Select-Object -First {} \
         | Select-Object -Property * -ExcludeProperty Cim* \
         | ConvertTo-Json -Depth 3 -Compress",
        ENV_CIM_NAMESPACE, ENV_CIM_QUERY, max_results
    );
    ScriptInvocation {
        script,
        env: vec![(ENV_CIM_NAMESPACE, namespace.to_string()), (ENV_CIM_QUERY, query.to_string())],
    }
}

fn is_quote(c: char) -> bool {
    matches!(c, '\'' | '"' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}')
}

/// XPath filter for an event query. Providers are matched by name.
pub fn event_xpath(query: &EventQuery) -> String {
    let mut clauses = Vec::new();

    if !query.event_ids.is_empty() {
        let ids: Vec<String> = query.event_ids.iter().map(|id| format!("EventID={}", id)).collect();
        clauses.push(format!("({})", ids.join(" or ")));
    }
    if !query.providers.is_empty() {
        let names: Vec<String> = query
            .providers
            .iter()
            .map(|p| format!("@Name='{}'", p.replace(is_quote, "")))
            .collect();
        clauses.push(format!("Provider[{}]", names.join(" or ")));
    }
    if let Some(after) = query.after_record_id {
        clauses.push(format!("EventRecordID > {}", after));
    }
    if let Some(since) = query.since {
        clauses.push(format!(
            "TimeCreated[@SystemTime>='{}']",
            since.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }

    if clauses.is_empty() {
        "*".to_string()
    } else {
        format!("*[System[{}]]", clauses.join(" and "))
    }
}

/// `Get-WinEvent` for an event query.
pub fn winevent_invocation(query: &EventQuery) -> ScriptInvocation {
    let oldest = if query.newest_first { "" } else { " -Oldest" };
    let script = format!(
        "try {{ Get-WinEvent -LogName $env:{} -FilterXPath $env:{} -MaxEvents {}{} -ErrorAction Stop \
         | Select-Object Id, ProviderName, RecordId, Level, Message, \
         @{{n='TimeCreated';e={{$_.TimeCreated.ToUniversalTime().ToString('o')}}}} \
         | ConvertTo-Json -Compress }} \
         catch {{ if ($_.FullyQualifiedErrorId -like 'NoMatchingEventsFound*') {{ '[]' }} else {{ throw }} }}",
        ENV_EVENT_CHANNEL,
        ENV_EVENT_XPATH,
        query.max_events.max(1),
        oldest
    );
    ScriptInvocation {
        script,
        env: vec![(ENV_EVENT_CHANNEL, query.channel.clone()), (ENV_EVENT_XPATH, event_xpath(query))],
    }
}

/// ConvertTo-Json emits a bare object for one result and nothing for none.
fn json_items(output: &str) -> Result<Vec<Value>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).context("Failed to parse PowerShell JSON output")?;
    Ok(match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

/// Parse CIM output into one property map per instance.
pub fn parse_cim_output(output: &str) -> Result<Vec<Map<String, Value>>> {
    Ok(json_items(output)?
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEvent {
    id: u32,
    #[serde(default)]
    provider_name: Option<String>,
    #[serde(default)]
    record_id: Option<u64>,
    #[serde(default)]
    level: Option<u8>,
    #[serde(default)]
    message: Option<String>,
    time_created: String,
}

/// Parse `Get-WinEvent` output. Entries that do not parse are skipped.
pub fn parse_winevent_output(channel: &str, output: &str) -> Result<Vec<EventRecord>> {
    let mut records = Vec::new();
    for item in json_items(output)? {
        let Ok(raw) = serde_json::from_value::<RawEvent>(item) else {
            continue;
        };
        let Ok(time_created) = DateTime::parse_from_rfc3339(&raw.time_created) else {
            continue;
        };
        records.push(EventRecord {
            channel: channel.to_string(),
            provider: raw.provider_name.unwrap_or_default(),
            event_id: raw.id,
            record_id: raw.record_id.unwrap_or_default(),
            time_created: time_created.with_timezone(&Utc),
            level: raw.level,
            message: raw.message.unwrap_or_default(),
        });
    }
    Ok(records)
}

#[cfg(target_os = "windows")]
mod exec {
    use std::process::Command;

    use anyhow::{bail, Context, Result};
    use log::debug;
    use serde_json::{Map, Value};

    use super::{cim_invocation, parse_cim_output, parse_winevent_output, winevent_invocation, ScriptInvocation};
    use crate::windows::{EventLogSource, EventQuery, EventRecord, ManagementQuery};

    fn run_script(invocation: &ScriptInvocation) -> Result<String> {
        debug!("Running PowerShell query: {} {:?}", invocation.script, invocation.env);
        let output = Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command", &invocation.script])
            .envs(invocation.env.iter().map(|(name, value)| (*name, value.as_str())))
            .output()
            .context("Failed to launch powershell.exe")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("PowerShell query failed: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// WMI/CIM via `Get-CimInstance`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PowerShellCim;

    impl ManagementQuery for PowerShellCim {
        fn query(&self, namespace: &str, query: &str, max_results: usize) -> Result<Vec<Map<String, Value>>> {
            let output = run_script(&cim_invocation(namespace, query, max_results))?;
            let mut results = parse_cim_output(&output)?;
            results.truncate(max_results);
            Ok(results)
        }
    }

    /// Event log via `Get-WinEvent`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PowerShellEventLog;

    impl EventLogSource for PowerShellEventLog {
        fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
            let output = run_script(&winevent_invocation(query))?;
            parse_winevent_output(&query.channel, &output)
        }
    }
}

#[cfg(target_os = "windows")]
pub use exec::{PowerShellCim, PowerShellEventLog};
