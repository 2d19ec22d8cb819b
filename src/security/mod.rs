//! Security boundary for collection rule targets.
//!
//! This module provides:
//! - Path normalization with segment-bounded prefix matching
//! - Compiled-in allowlists for registry, file, command and WMI targets
//! - The [`SecurityGuard`] decision functions
//! - Security event logging

pub mod config;
pub mod guard;
pub mod path_validator;

pub use config::{log_security_event, SecurityAllowlists, SecurityEvent, WmiAllowEntry};
pub use guard::{
    is_event_log_name, ApprovedTarget, SecurityDecision, SecurityGuard, TargetKind, DEFAULT_WMI_NAMESPACE,
};
pub use path_validator::{
    is_within_prefix, normalize_file_path, normalize_registry_path, wildcard_matches, NormalizedPath,
    PathStyle,
};
