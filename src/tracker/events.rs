//! Event log records the tracker reacts to.

use std::fmt;

use crate::windows::EventRecord;

/// Device registration channel, source of Hello provisioning outcomes
pub const DEVICE_REGISTRATION_CHANNEL: &str = "Microsoft-Windows-User Device Registration/Admin";

/// Shell-Core channel, source of wizard and ESP progress
pub const SHELL_CORE_CHANNEL: &str = "Microsoft-Windows-Shell-Core/Operational";

pub const HELLO_PROVISIONING_SUCCEEDED: u32 = 300;
pub const HELLO_PROVISIONING_FAILED: u32 = 301;
pub const HELLO_PREREQUISITES_PASSED: u32 = 358;
pub const HELLO_PREREQUISITES_NOT_MET: u32 = 360;
pub const HELLO_PROVISIONING_BLOCKED: u32 = 362;

pub const SHELL_CORE_WIZARD_PAGE: u32 = 62404;
pub const SHELL_CORE_ESP_EXIT: u32 = 62407;

/// Event ids watched on the device registration channel
pub const DEVICE_REGISTRATION_EVENT_IDS: [u32; 5] = [
    HELLO_PROVISIONING_SUCCEEDED,
    HELLO_PROVISIONING_FAILED,
    HELLO_PREREQUISITES_PASSED,
    HELLO_PREREQUISITES_NOT_MET,
    HELLO_PROVISIONING_BLOCKED,
];

/// Terminal Hello outcomes, the only ids replayed by backfill
pub const TERMINAL_HELLO_EVENT_IDS: [u32; 3] =
    [HELLO_PROVISIONING_SUCCEEDED, HELLO_PROVISIONING_FAILED, HELLO_PROVISIONING_BLOCKED];

/// Event ids watched on the Shell-Core channel
pub const SHELL_CORE_EVENT_IDS: [u32; 2] = [SHELL_CORE_WIZARD_PAGE, SHELL_CORE_ESP_EXIT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    Succeeded,
    Failed,
    Blocked,
}

impl fmt::Display for HelloOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HelloOutcome::Succeeded => "succeeded",
            HelloOutcome::Failed => "failed",
            HelloOutcome::Blocked => "blocked",
        })
    }
}

/// What a watched record means for provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    HelloOutcome(HelloOutcome),
    /// Snapshot only; a later attempt may still succeed
    PrerequisitesNotMet,
    PrerequisitesPassed,
    WizardStarted,
    EspExited,
    PreProvisioningSucceeded,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Classify a record from one of the two watched channels.
pub fn classify(record: &EventRecord) -> Option<TrackerEvent> {
    if record.channel.eq_ignore_ascii_case(DEVICE_REGISTRATION_CHANNEL) {
        return match record.event_id {
            HELLO_PROVISIONING_SUCCEEDED => Some(TrackerEvent::HelloOutcome(HelloOutcome::Succeeded)),
            HELLO_PROVISIONING_FAILED => Some(TrackerEvent::HelloOutcome(HelloOutcome::Failed)),
            HELLO_PROVISIONING_BLOCKED => Some(TrackerEvent::HelloOutcome(HelloOutcome::Blocked)),
            HELLO_PREREQUISITES_NOT_MET => Some(TrackerEvent::PrerequisitesNotMet),
            HELLO_PREREQUISITES_PASSED => Some(TrackerEvent::PrerequisitesPassed),
            _ => None,
        };
    }

    if record.channel.eq_ignore_ascii_case(SHELL_CORE_CHANNEL) {
        // Pre-provisioning reports success on the ESP exit record itself
        if contains_ci(&record.message, "whiteglove") && contains_ci(&record.message, "success") {
            return Some(TrackerEvent::PreProvisioningSucceeded);
        }
        return match record.event_id {
            SHELL_CORE_WIZARD_PAGE
                if contains_ci(&record.message, "ngc") || contains_ci(&record.message, "hello") =>
            {
                Some(TrackerEvent::WizardStarted)
            }
            SHELL_CORE_ESP_EXIT => Some(TrackerEvent::EspExited),
            _ => None,
        };
    }

    None
}
