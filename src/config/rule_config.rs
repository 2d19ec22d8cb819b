use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::models::Severity;

/// Event type used when a rule does not name one.
pub const DEFAULT_OUTPUT_EVENT_TYPE: &str = "collection_result";

/// Where a rule gathers data from, with the parameters that collector needs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectorSpec {
    /// Registry key, or one value under it.
    Registry {
        path: String,
        #[serde(default)]
        value_name: Option<String>,
    },

    /// WMI/CIM query or bare class name.
    #[serde(alias = "management_query")]
    Wmi {
        #[serde(default)]
        namespace: Option<String>,
        query: String,
    },

    /// Allowlisted diagnostic command.
    Command { command_line: String },

    /// File metadata, optional content tail, or a directory listing.
    File {
        path: String,
        #[serde(default)]
        read_content: bool,
        #[serde(default)]
        tail_chars: Option<usize>,
    },

    /// Recent entries from an event log channel.
    #[serde(rename = "eventlog", alias = "event_log")]
    EventLog {
        channel: String,
        #[serde(default)]
        providers: Vec<String>,
        #[serde(default)]
        event_ids: Vec<u32>,
        #[serde(default)]
        message_filter: Option<String>,
        #[serde(default)]
        max_entries: Option<usize>,
    },

    /// Incremental pattern matching over a CMTrace-format log.
    #[serde(rename = "logparser", alias = "log_parser")]
    LogParser {
        path: String,
        pattern: String,
        #[serde(default)]
        max_lines: Option<usize>,
    },
}

/// Collector kind without parameters, for logging and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    Registry,
    Wmi,
    Command,
    File,
    EventLog,
    LogParser,
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorKind::Registry => "registry",
            CollectorKind::Wmi => "wmi",
            CollectorKind::Command => "command",
            CollectorKind::File => "file",
            CollectorKind::EventLog => "eventlog",
            CollectorKind::LogParser => "logparser",
        };
        f.write_str(name)
    }
}

impl CollectorSpec {
    pub fn kind(&self) -> CollectorKind {
        match self {
            CollectorSpec::Registry { .. } => CollectorKind::Registry,
            CollectorSpec::Wmi { .. } => CollectorKind::Wmi,
            CollectorSpec::Command { .. } => CollectorKind::Command,
            CollectorSpec::File { .. } => CollectorKind::File,
            CollectorSpec::EventLog { .. } => CollectorKind::EventLog,
            CollectorSpec::LogParser { .. } => CollectorKind::LogParser,
        }
    }

    /// The primary target string, as written in the rule.
    pub fn target(&self) -> &str {
        match self {
            CollectorSpec::Registry { path, .. } => path,
            CollectorSpec::Wmi { query, .. } => query,
            CollectorSpec::Command { command_line } => command_line,
            CollectorSpec::File { path, .. } => path,
            CollectorSpec::EventLog { channel, .. } => channel,
            CollectorSpec::LogParser { path, .. } => path,
        }
    }
}

/// When a rule runs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Once per process lifetime, on the first rule set that contains it.
    Startup,
    /// Every `seconds`, first run one full period after arming.
    Interval { seconds: u64 },
    /// On entry to `phase`, or any phase when `phase` is `*`.
    PhaseChange { phase: String },
    /// When the host reports an event of this type.
    OnEvent { event_type: String },
}

/// A collection instruction delivered at runtime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CollectionRule {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub collector: CollectorSpec,
    pub trigger: Trigger,
    #[serde(default = "default_output_event_type")]
    pub event_type: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_output_event_type() -> String {
    DEFAULT_OUTPUT_EVENT_TYPE.to_string()
}

fn default_enabled() -> bool {
    true
}

impl CollectionRule {
    pub fn new(id: impl Into<String>, collector: CollectorSpec, trigger: Trigger) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            collector,
            trigger,
            event_type: default_output_event_type(),
            severity: Severity::default(),
            enabled: true,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A versioned batch of rules, replaced wholesale on each update.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<CollectionRule>,
}

impl RuleSet {
    /// Load a rule set from a YAML or JSON file (by extension).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read rule file: {}", path.display()))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let rules: RuleSet = if is_json {
            serde_json::from_str(&content).context("Failed to parse JSON rule set")?
        } else {
            serde_yaml::from_str(&content).context("Failed to parse YAML rule set")?
        };

        debug!("Loaded {} rules from {}", rules.rules.len(), path.display());
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_YAML: &str = r#"
version: "2024.1"
rules:
  - id: dsreg-status
    title: Device registration status
    collector:
      kind: command
      command_line: dsregcmd /status
    trigger:
      type: startup
  - id: ime-errors
    collector:
      kind: logparser
      path: C:\ProgramData\Microsoft\IntuneManagementExtension\Logs\IntuneManagementExtension.log
      pattern: 'Error (?P<code>0x[0-9a-fA-F]+)'
    trigger:
      type: interval
      seconds: 60
    event_type: ime_error
    severity: warning
  - id: tpm
    collector:
      kind: management_query
      namespace: root\cimv2\Security\MicrosoftTpm
      query: Win32_Tpm
    trigger:
      type: phase_change
      phase: device_setup
    enabled: false
"#;

    #[test]
    fn test_parse_yaml_rule_set() {
        let set: RuleSet = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(set.version, "2024.1");
        assert_eq!(set.rules.len(), 3);

        let first = &set.rules[0];
        assert_eq!(first.collector.kind(), CollectorKind::Command);
        assert_eq!(first.collector.target(), "dsregcmd /status");
        assert_eq!(first.event_type, DEFAULT_OUTPUT_EVENT_TYPE);
        assert_eq!(first.severity, Severity::Info);
        assert!(first.enabled);

        let second = &set.rules[1];
        assert_eq!(second.trigger, Trigger::Interval { seconds: 60 });
        assert_eq!(second.severity, Severity::Warning);
        assert!(second.title.is_empty());

        let third = &set.rules[2];
        assert_eq!(third.collector.kind(), CollectorKind::Wmi);
        assert!(!third.enabled);
    }

    #[test]
    fn test_rule_set_from_json_file() {
        let json = r#"{
            "version": "1",
            "rules": [{
                "id": "bios",
                "collector": {"kind": "wmi", "query": "SELECT * FROM Win32_BIOS"},
                "trigger": {"type": "on_event", "event_type": "esp_exited"}
            }]
        }"#;
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let set = RuleSet::from_file(file.path()).unwrap();
        assert_eq!(
            set.rules[0].trigger,
            Trigger::OnEvent { event_type: "esp_exited".to_string() }
        );
    }

    #[test]
    fn test_unknown_collector_kind_rejected() {
        let yaml = "id: x\ncollector:\n  kind: shell\n  command_line: rm\ntrigger:\n  type: startup\n";
        assert!(serde_yaml::from_str::<CollectionRule>(yaml).is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let rule = CollectionRule::new(
            "r1",
            CollectorSpec::Command { command_line: "ipconfig /all".to_string() },
            Trigger::Startup,
        )
        .with_event_type("network_config");
        assert_eq!(rule.title, "r1");
        assert_eq!(rule.event_type, "network_config");
        assert!(rule.enabled);
    }
}
