//! Provisioning state tracking.
//!
//! Watches the device registration and Shell-Core event logs, polls the
//! Hello for Business policy and runs the Hello wait timers. Progress is
//! reported as telemetry and as [`TrackerSignal`]s.
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use autopilot_monitor::config::TrackerConfig;
//! use autopilot_monitor::telemetry::{EventEmitter, LogSink};
//! use autopilot_monitor::tracker::{ProvisioningTracker, TrackerSignal};
//! use autopilot_monitor::windows::Backends;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let tracker = ProvisioningTracker::new(
//!     &Backends::system(),
//!     EventEmitter::new(Arc::new(LogSink)),
//!     TrackerConfig::default(),
//! )?;
//! let mut signals = tracker.subscribe();
//! tracker.start().await;
//!
//! // Account setup finished: give the Hello wizard a chance to appear
//! tracker.start_hello_wait_timer();
//! while let Ok(signal) = signals.recv().await {
//!     if signal == TrackerSignal::HelloCompleted {
//!         break;
//!     }
//! }
//! tracker.stop();
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod policy;
pub mod provisioning;
pub mod state;
pub mod watcher;

pub use events::{classify, HelloOutcome, TrackerEvent};
pub use policy::{check_hello_policy, HelloPolicy};
pub use provisioning::ProvisioningTracker;
pub use state::{Origin, PolicyState, ProvisioningState, TimerKind, TrackerSignal};
pub use watcher::EventLogWatcher;
