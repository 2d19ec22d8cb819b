//! # autopilot-monitor
//!
//! Core of an on-device enrollment monitoring agent.
//!
//! ## Overview
//!
//! The agent watches a managed-device enrollment as it happens and reports
//! structured telemetry. Two subsystems do the work:
//!
//! - a **provisioning tracker** that combines live event log watchers, a
//!   policy poll and a short historical backfill into monotonic state for
//!   the Windows Hello wizard and the pre-provisioning path, and
//! - a **collection rule engine** that runs rules delivered at runtime
//!   against the registry, WMI, the event log, the filesystem and a small
//!   set of diagnostic commands, with every target checked against
//!   compiled-in allowlists.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use autopilot_monitor::collectors::CollectionRuleEngine;
//! use autopilot_monitor::config::AgentConfig;
//! use autopilot_monitor::models::EnrollmentPhase;
//! use autopilot_monitor::security::SecurityGuard;
//! use autopilot_monitor::telemetry::{EventEmitter, LogSink};
//! use autopilot_monitor::tracker::ProvisioningTracker;
//! use autopilot_monitor::windows::Backends;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig::default();
//! let backends = Backends::system();
//! let emitter = EventEmitter::new(Arc::new(LogSink));
//!
//! let tracker = ProvisioningTracker::new(&backends, emitter.clone(), config.tracker.clone())?;
//! tracker.start().await;
//!
//! let engine = CollectionRuleEngine::new(SecurityGuard::default(), backends, emitter, config.collection)?;
//! engine.on_phase_changed(EnrollmentPhase::DeviceSetup);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`cli`]: Command-line interface definitions and argument parsing
//! - [`models`]: Enrollment phases and telemetry events
//! - [`collectors`]: Rule engine and the six collectors
//! - [`tracker`]: Provisioning state machine and its watchers
//! - [`security`]: Allowlists and target validation
//! - [`config`]: Agent configuration and rule sets
//! - [`telemetry`]: Event sinks and the shared emitter
//! - [`windows`]: OS surfaces behind traits, with Windows implementations
//! - [`utils`]: Output truncation helpers
//! - [`constants`]: Caps, budgets and timer defaults

/// Command-line interface definitions and argument parsing
pub mod cli;

/// Core data models and structures used throughout the application
pub mod models;

/// OS surfaces (registry, WMI, event log, processes)
pub mod windows;

/// Rule-driven collectors and the collection engine
pub mod collectors;

/// Provisioning state tracking
pub mod tracker;

/// Utility functions for output truncation
pub mod utils;

/// Agent configuration and collection rules
pub mod config;

/// Application constants and configuration values
pub mod constants;

/// Security allowlists and target validation
pub mod security;

/// Telemetry sinks and the event emitter
pub mod telemetry;

/// Test utilities and helpers
#[cfg(test)]
pub mod test_utils;
