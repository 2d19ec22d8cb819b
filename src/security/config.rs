//! Compiled-in allowlists and security event logging.
//!
//! The lists below are the only targets collection rules may reach. Rules are
//! delivered at runtime, the lists are not: extending them requires a new
//! build.

use serde::Serialize;

/// Registry key prefixes rules may read.
const ALLOWED_REGISTRY_PREFIXES: &[&str] = &[
    "HKLM\\SOFTWARE\\Microsoft\\Enrollments",
    "HKLM\\SOFTWARE\\Microsoft\\EnterpriseResourceManager",
    "HKLM\\SOFTWARE\\Microsoft\\IntuneManagementExtension",
    "HKLM\\SOFTWARE\\Microsoft\\PolicyManager\\current\\device",
    "HKLM\\SOFTWARE\\Microsoft\\PolicyManager\\providers",
    "HKLM\\SOFTWARE\\Microsoft\\Policies\\PassportForWork",
    "HKLM\\SOFTWARE\\Microsoft\\Provisioning",
    "HKLM\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall",
    "HKLM\\SOFTWARE\\Microsoft\\Windows\\Autopilot",
    "HKLM\\SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion",
    "HKLM\\SOFTWARE\\Policies\\Microsoft\\PassportForWork",
    "HKLM\\SOFTWARE\\Policies\\Microsoft\\Windows\\WindowsUpdate",
    "HKLM\\SYSTEM\\CurrentControlSet\\Control\\CloudDomainJoin",
    "HKLM\\SYSTEM\\CurrentControlSet\\Control\\TimeZoneInformation",
    "HKLM\\SYSTEM\\Setup",
];

/// Filesystem prefixes rules may read.
const ALLOWED_FILE_PREFIXES: &[&str] = &[
    "C:\\ProgramData\\Microsoft\\IntuneManagementExtension\\Logs",
    "C:\\ProgramData\\Microsoft\\Windows\\Provisioning\\Autopilot",
    "C:\\ProgramData\\AutopilotMonitor\\Logs",
    "C:\\Windows\\CCM\\Logs",
    "C:\\Windows\\Logs",
    "C:\\Windows\\Panther",
    "C:\\Windows\\Provisioning\\Autopilot",
    "C:\\Windows\\SetupDiag",
    "C:\\Windows\\INF\\setupapi.dev.log",
];

/// Diagnostic command lines that may run, matched byte for byte.
const ALLOWED_COMMANDS: &[&str] = &[
    "dsregcmd /status",
    "ipconfig /all",
    "netsh winhttp show proxy",
    "netsh wlan show interfaces",
    "w32tm /query /status",
    "certutil -store My",
    "manage-bde -status",
    "tpmtool getdeviceinformation",
    "route print",
    "whoami /all",
    "systeminfo",
    "gpresult /r /scope computer",
];

/// WMI namespace/class pairs queries may target.
const ALLOWED_WMI_CLASSES: &[(&str, &str)] = &[
    ("root\\cimv2", "Win32_BIOS"),
    ("root\\cimv2", "Win32_ComputerSystem"),
    ("root\\cimv2", "Win32_ComputerSystemProduct"),
    ("root\\cimv2", "Win32_OperatingSystem"),
    ("root\\cimv2", "Win32_Processor"),
    ("root\\cimv2", "Win32_LogicalDisk"),
    ("root\\cimv2", "Win32_NetworkAdapterConfiguration"),
    ("root\\cimv2", "Win32_QuickFixEngineering"),
    ("root\\cimv2", "Win32_TimeZone"),
    ("root\\cimv2", "SoftwareLicensingService"),
    ("root\\cimv2\\security\\microsofttpm", "Win32_Tpm"),
    ("root\\cimv2\\security\\microsoftvolumeencryption", "Win32_EncryptableVolume"),
    ("root\\cimv2\\mdm\\dmmap", "MDM_DevDetail_Ext01"),
    ("root\\cimv2\\mdm\\dmmap", "MDM_DevInfo"),
];

/// One allowed WMI target.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WmiAllowEntry {
    pub namespace: String,
    pub class: String,
}

/// The full set of allowlists a guard enforces.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityAllowlists {
    pub registry_prefixes: Vec<String>,
    pub file_prefixes: Vec<String>,
    pub commands: Vec<String>,
    pub wmi_classes: Vec<WmiAllowEntry>,
}

impl Default for SecurityAllowlists {
    fn default() -> Self {
        Self {
            registry_prefixes: ALLOWED_REGISTRY_PREFIXES.iter().map(|s| s.to_string()).collect(),
            file_prefixes: ALLOWED_FILE_PREFIXES.iter().map(|s| s.to_string()).collect(),
            commands: ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            wmi_classes: ALLOWED_WMI_CLASSES
                .iter()
                .map(|(namespace, class)| WmiAllowEntry {
                    namespace: namespace.to_string(),
                    class: class.to_string(),
                })
                .collect(),
        }
    }
}

impl SecurityAllowlists {
    /// Empty lists: every target is denied.
    pub fn deny_all() -> Self {
        Self {
            registry_prefixes: vec![],
            file_prefixes: vec![],
            commands: vec![],
            wmi_classes: vec![],
        }
    }

    /// Add extra filesystem prefixes.
    pub fn with_file_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_prefixes.extend(prefixes.into_iter().map(Into::into));
        self
    }
}

/// Security audit event types.
#[derive(Debug, Clone, Serialize)]
pub enum SecurityEvent {
    /// A rule target failed an allowlist check
    TargetDenied {
        rule_id: String,
        kind: String,
        target: String,
        reason: String,
    },

    /// An allowlist entry could not be normalized and was dropped
    AllowlistEntryInvalid { entry: String, reason: String },
}

/// Log a security event.
pub fn log_security_event(event: SecurityEvent) {
    use log::warn;

    match event {
        SecurityEvent::TargetDenied { rule_id, kind, target, reason } => {
            warn!(
                "Security: Denied {} target '{}' for rule '{}': {}",
                kind, target, rule_id, reason
            );
        }
        SecurityEvent::AllowlistEntryInvalid { entry, reason } => {
            warn!("Security: Ignoring invalid allowlist entry '{}': {}", entry, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allowlists_populated() {
        let lists = SecurityAllowlists::default();
        assert!(lists.registry_prefixes.len() >= 10);
        assert!(lists.file_prefixes.iter().any(|p| p.ends_with("IntuneManagementExtension\\Logs")));
        assert!(lists.commands.contains(&"dsregcmd /status".to_string()));
        assert!(lists.wmi_classes.iter().any(|e| e.class == "Win32_Tpm"));
    }

    #[test]
    fn test_deny_all_is_empty() {
        let lists = SecurityAllowlists::deny_all();
        assert!(lists.registry_prefixes.is_empty());
        assert!(lists.file_prefixes.is_empty());
        assert!(lists.commands.is_empty());
        assert!(lists.wmi_classes.is_empty());
    }

    #[test]
    fn test_with_file_prefixes_extends() {
        let lists = SecurityAllowlists::deny_all().with_file_prefixes(["/tmp/logs"]);
        assert_eq!(lists.file_prefixes, vec!["/tmp/logs".to_string()]);
    }
}
