use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Coarse enrollment lifecycle stage, attached to every emitted event.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPhase {
    #[default]
    PreFlight,
    Identity,
    DeviceSetup,
    UserSetup,
    AppInstallation,
    Finalizing,
    Complete,
    Failed,
}

impl EnrollmentPhase {
    pub const ALL: [EnrollmentPhase; 8] = [
        EnrollmentPhase::PreFlight,
        EnrollmentPhase::Identity,
        EnrollmentPhase::DeviceSetup,
        EnrollmentPhase::UserSetup,
        EnrollmentPhase::AppInstallation,
        EnrollmentPhase::Finalizing,
        EnrollmentPhase::Complete,
        EnrollmentPhase::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentPhase::PreFlight => "pre_flight",
            EnrollmentPhase::Identity => "identity",
            EnrollmentPhase::DeviceSetup => "device_setup",
            EnrollmentPhase::UserSetup => "user_setup",
            EnrollmentPhase::AppInstallation => "app_installation",
            EnrollmentPhase::Finalizing => "finalizing",
            EnrollmentPhase::Complete => "complete",
            EnrollmentPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for EnrollmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentPhase {
    type Err = anyhow::Error;

    /// Accepts `device_setup`, `device-setup`, `DeviceSetup` and `devicesetup`.
    fn from_str(s: &str) -> Result<Self> {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != ' ')
            .collect::<String>()
            .to_lowercase();

        EnrollmentPhase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str().replace('_', "") == folded)
            .ok_or_else(|| anyhow!("Unknown enrollment phase: {}", s))
    }
}

/// Event severity, ordered from least to most severe.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A finished telemetry event handed to the outward sink.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TelemetryEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub phase: EnrollmentPhase,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl TelemetryEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: Severity,
        source: impl Into<String>,
        phase: EnrollmentPhase,
        message: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity,
            source: source.into(),
            phase,
            message: message.into(),
            data,
        }
    }

    /// Convenience accessor for string fields in `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}
