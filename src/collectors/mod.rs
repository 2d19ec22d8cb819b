//! Rule-driven data collection.
//!
//! Each collector gathers one kind of data from an approved target and
//! returns it as a JSON object. The [`engine`] owns the rule set, decides
//! when rules run and turns collector output into telemetry events.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         CollectionRuleEngine            │
//! │   triggers · guard · dispatch · emit    │
//! ├─────────────────────────────────────────┤
//! │              Collectors                 │
//! │  ┌──────────┬─────────┬──────────┐      │
//! │  │ Registry │   WMI   │ Command  │      │
//! │  ├──────────┼─────────┼──────────┤      │
//! │  │   File   │EventLog │LogParser │      │
//! │  └──────────┴─────────┴──────────┘      │
//! ├─────────────────────────────────────────┤
//! │     Platform backends (windows/)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use autopilot_monitor::collectors::engine::CollectionRuleEngine;
//! use autopilot_monitor::config::{CollectionRule, CollectionSettings, CollectorSpec, Trigger};
//! use autopilot_monitor::security::SecurityGuard;
//! use autopilot_monitor::telemetry::{EventEmitter, LogSink};
//! use autopilot_monitor::windows::Backends;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let emitter = EventEmitter::new(Arc::new(LogSink));
//! let engine = CollectionRuleEngine::new(
//!     SecurityGuard::default(),
//!     Backends::system(),
//!     emitter,
//!     CollectionSettings::default(),
//! )?;
//!
//! engine.update_rules(&[CollectionRule::new(
//!     "os-version",
//!     CollectorSpec::Registry {
//!         path: "HKLM\\SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion".to_string(),
//!         value_name: Some("CurrentBuild".to_string()),
//!     },
//!     Trigger::Startup,
//! )]);
//! engine.wait_for_startup_rules(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

/// Trigger and pattern validation for incoming rules
pub mod rule;

/// Rule scheduling and dispatch
pub mod engine;

/// Registry key and value reads
pub mod registry;

/// WMI/CIM queries
pub mod wmi;

/// Allowlisted command execution
pub mod command;

/// File metadata, content tails and directory listings
pub mod file;

/// Event log channel reads
pub mod eventlog;

/// Incremental CMTrace log scanning
pub mod log_parser;

pub use engine::CollectionRuleEngine;
pub use rule::{compile_rule, compile_rules, CompiledRule, CompiledTrigger, PhaseMatch};
