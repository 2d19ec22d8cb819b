//! Allowlist decisions for every target a collection rule can name.
//!
//! All checks are pure: the guard never touches the registry, WMI, the
//! filesystem or a process. Callers act on [`SecurityDecision::Allow`] using
//! the approved (normalized) target, never the raw input, so there is no path
//! from rule text to the OS that skips the guard.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::security::config::{log_security_event, SecurityAllowlists, SecurityEvent};
use crate::security::path_validator::{
    is_within_prefix, normalize_file_path, normalize_registry_path, NormalizedPath,
};

/// Namespace assumed when a WMI rule does not name one.
pub const DEFAULT_WMI_NAMESPACE: &str = "root\\cimv2";

/// The kinds of target the guard decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Registry,
    Wmi,
    Command,
    File,
    EventLog,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetKind::Registry => "registry",
            TargetKind::Wmi => "wmi",
            TargetKind::Command => "command",
            TargetKind::File => "file",
            TargetKind::EventLog => "eventlog",
        };
        f.write_str(name)
    }
}

/// A target that passed its allowlist check.
///
/// Only the guard constructs these, so a collector taking an
/// `&ApprovedTarget` cannot be handed an unchecked string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovedTarget {
    target: String,
    wildcard: Option<String>,
    namespace: Option<String>,
}

impl ApprovedTarget {
    fn plain(target: impl Into<String>) -> Self {
        Self { target: target.into(), wildcard: None, namespace: None }
    }

    /// Normalized path, canonical query or exact command line.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wildcard split off the final path segment.
    pub fn wildcard(&self) -> Option<&str> {
        self.wildcard.as_deref()
    }

    /// WMI namespace, for WMI targets.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

/// Result of an allowlist check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SecurityDecision {
    Allow(ApprovedTarget),
    Deny { reason: String },
}

impl SecurityDecision {
    fn deny(reason: impl Into<String>) -> Self {
        SecurityDecision::Deny { reason: reason.into() }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, SecurityDecision::Allow(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SecurityDecision::Allow(_) => None,
            SecurityDecision::Deny { reason } => Some(reason),
        }
    }

    pub fn approved(&self) -> Option<&ApprovedTarget> {
        match self {
            SecurityDecision::Allow(target) => Some(target),
            SecurityDecision::Deny { .. } => None,
        }
    }
}

/// Allowlist enforcement over registry, WMI, command and file targets.
#[derive(Debug, Clone)]
pub struct SecurityGuard {
    registry_prefixes: Vec<NormalizedPath>,
    file_prefixes: Vec<NormalizedPath>,
    commands: HashSet<String>,
    /// (lowercase namespace, lowercase class, display class)
    wmi_classes: Vec<(String, String, String)>,
}

impl Default for SecurityGuard {
    fn default() -> Self {
        Self::new(SecurityAllowlists::default())
    }
}

impl SecurityGuard {
    /// Build a guard, normalizing every prefix once. Entries that do not
    /// normalize are dropped with a security log line.
    pub fn new(allowlists: SecurityAllowlists) -> Self {
        let registry_prefixes = allowlists
            .registry_prefixes
            .iter()
            .filter_map(|entry| normalize_prefix(entry, normalize_registry_path))
            .collect();

        let file_prefixes = allowlists
            .file_prefixes
            .iter()
            .filter_map(|entry| normalize_prefix(entry, normalize_file_path))
            .collect();

        let commands = allowlists.commands.iter().map(|c| c.trim().to_string()).collect();

        let wmi_classes = allowlists
            .wmi_classes
            .iter()
            .map(|e| {
                (
                    normalize_namespace(&e.namespace),
                    e.class.to_lowercase(),
                    e.class.clone(),
                )
            })
            .collect();

        Self { registry_prefixes, file_prefixes, commands, wmi_classes }
    }

    /// Exact match against the command allowlist after trimming.
    pub fn check_command(&self, command_line: &str) -> SecurityDecision {
        let trimmed = command_line.trim();
        if trimmed.is_empty() {
            return SecurityDecision::deny("Empty command line");
        }
        if self.commands.contains(trimmed) {
            SecurityDecision::Allow(ApprovedTarget::plain(trimmed))
        } else {
            SecurityDecision::deny("Command line is not on the allowlist")
        }
    }

    /// Registry key path under an allowed prefix.
    pub fn check_registry_path(&self, raw: &str) -> SecurityDecision {
        check_path(raw, &self.registry_prefixes, normalize_registry_path)
    }

    /// Filesystem path under an allowed prefix.
    pub fn check_file_path(&self, raw: &str) -> SecurityDecision {
        check_path(raw, &self.file_prefixes, normalize_file_path)
    }

    /// WMI query (or bare class name) against the namespace/class allowlist.
    ///
    /// Only `SELECT <props> FROM <Class> [WHERE ...]` is accepted. The
    /// approved target is the canonical query text.
    pub fn check_wmi_query(&self, namespace: Option<&str>, query: &str) -> SecurityDecision {
        let namespace = normalize_namespace(namespace.unwrap_or(DEFAULT_WMI_NAMESPACE));
        let query = query.trim();

        if query.is_empty() {
            return SecurityDecision::deny("Empty WMI query");
        }
        if query.chars().any(|c| c == ';' || c.is_control()) {
            return SecurityDecision::deny("WMI query contains statement separators or control characters");
        }
        if let Some(c) = query.chars().find(|c| !is_wql_char(*c)) {
            return SecurityDecision::deny(format!("WMI query contains disallowed character {:?}", c));
        }

        let (class, canonical) = if is_identifier(query) {
            (query.to_string(), format!("SELECT * FROM {}", query))
        } else {
            match parse_select_class(query) {
                Ok(class) => (class, query.to_string()),
                Err(reason) => return SecurityDecision::deny(reason),
            }
        };

        let class_lower = class.to_lowercase();
        let allowed = self
            .wmi_classes
            .iter()
            .any(|(ns, cls, _)| *ns == namespace && *cls == class_lower);

        if allowed {
            SecurityDecision::Allow(ApprovedTarget {
                target: canonical,
                wildcard: None,
                namespace: Some(namespace),
            })
        } else {
            SecurityDecision::deny(format!("WMI class {} in namespace {} is not on the allowlist", class, namespace))
        }
    }

    /// Event log channel plus the provider names filtering it.
    ///
    /// Names are restricted to letters, digits, space and `._/-`.
    pub fn check_event_log(&self, channel: &str, providers: &[String]) -> SecurityDecision {
        let channel = channel.trim();
        if !is_event_log_name(channel) {
            return SecurityDecision::deny(format!("Event log channel {:?} is not a valid channel name", channel));
        }
        if let Some(bad) = providers.iter().find(|p| !is_event_log_name(p.trim())) {
            return SecurityDecision::deny(format!("Event log provider {:?} is not a valid provider name", bad));
        }
        SecurityDecision::Allow(ApprovedTarget::plain(channel))
    }

    /// Dispatch on target kind. `namespace` is only used for WMI.
    pub fn check(&self, kind: TargetKind, target: &str, namespace: Option<&str>) -> SecurityDecision {
        match kind {
            TargetKind::Registry => self.check_registry_path(target),
            TargetKind::Wmi => self.check_wmi_query(namespace, target),
            TargetKind::Command => self.check_command(target),
            TargetKind::File => self.check_file_path(target),
            TargetKind::EventLog => self.check_event_log(target, &[]),
        }
    }
}

fn normalize_prefix(
    entry: &str,
    normalize: fn(&str) -> anyhow::Result<NormalizedPath>,
) -> Option<NormalizedPath> {
    match normalize(entry) {
        Ok(n) if n.wildcard.is_none() => Some(n),
        Ok(_) => {
            log_security_event(SecurityEvent::AllowlistEntryInvalid {
                entry: entry.to_string(),
                reason: "Allowlist prefixes cannot contain wildcards".to_string(),
            });
            None
        }
        Err(e) => {
            log_security_event(SecurityEvent::AllowlistEntryInvalid {
                entry: entry.to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

fn check_path(
    raw: &str,
    prefixes: &[NormalizedPath],
    normalize: fn(&str) -> anyhow::Result<NormalizedPath>,
) -> SecurityDecision {
    let normalized = match normalize(raw) {
        Ok(n) => n,
        Err(e) => return SecurityDecision::deny(format!("Path normalization failed: {}", e)),
    };

    let allowed = prefixes
        .iter()
        .filter(|p| p.style == normalized.style)
        .any(|p| is_within_prefix(&normalized.path, &p.path, normalized.style));

    if allowed {
        SecurityDecision::Allow(ApprovedTarget {
            target: normalized.path,
            wildcard: normalized.wildcard,
            namespace: None,
        })
    } else {
        SecurityDecision::deny(format!("{} is not under an allowed prefix", normalized.path))
    }
}

fn normalize_namespace(namespace: &str) -> String {
    namespace
        .trim()
        .replace('/', "\\")
        .trim_matches('\\')
        .to_lowercase()
}

/// Longest accepted channel or provider name
const MAX_EVENT_LOG_NAME_LEN: usize = 256;

/// Channel and provider names: letters, digits, space and `._/-`.
pub fn is_event_log_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_EVENT_LOG_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '/' | '-'))
}

/// WQL text is limited to ASCII identifiers, literals and comparisons.
fn is_wql_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, ' ' | '_' | '.' | ',' | '*' | '=' | '<' | '>' | '!' | '\'' | '%' | '-' | '(' | ')' | '\\' | ':')
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Extract the class from `SELECT ... FROM Class [WHERE ...]`.
fn parse_select_class(query: &str) -> Result<String, String> {
    let tokens: Vec<&str> = query.split_whitespace().collect();

    match tokens.first() {
        Some(first) if first.eq_ignore_ascii_case("SELECT") => {}
        _ => return Err("Only SELECT queries are allowed".to_string()),
    }

    let from_positions: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.eq_ignore_ascii_case("FROM"))
        .map(|(i, _)| i)
        .collect();

    let from = match from_positions.as_slice() {
        [single] => *single,
        [] => return Err("WMI query has no FROM clause".to_string()),
        _ => return Err("WMI query has more than one FROM clause".to_string()),
    };

    if from < 2 {
        return Err("WMI query selects no properties".to_string());
    }

    let class = match tokens.get(from + 1) {
        Some(class) if is_identifier(class) => class.to_string(),
        Some(_) => return Err("WMI class name is not a plain identifier".to_string()),
        None => return Err("WMI query names no class".to_string()),
    };

    match tokens.get(from + 2) {
        None => Ok(class),
        Some(next) if next.eq_ignore_ascii_case("WHERE") => Ok(class),
        Some(next) => Err(format!("Unexpected token after class name: {}", next)),
    }
}
