//! Provisioning state and its transition function.
//!
//! All tracker decisions happen here, in [`ProvisioningState::apply`], which
//! takes one input and returns the effects to carry out. Every flag only
//! ever moves from unset to set. An input that would change nothing returns
//! no effects, which is what makes duplicate events and late timers harmless.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::TrackerConfig;
use crate::models::Severity;
use crate::tracker::events::{HelloOutcome, TrackerEvent};

/// Hello policy as far as it is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PolicyState {
    #[default]
    Unknown,
    Known { enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Short wait after the account setup phase for the wizard to show up
    HelloWait,
    /// Long wait for a terminal Hello outcome
    HelloCompletion,
}

/// The armed timer. A firing whose generation differs is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingTimer {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Where an event record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Live,
    Backfill,
}

/// A classified event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub event: TrackerEvent,
    pub event_id: u32,
    pub record_id: u64,
    pub time_created: DateTime<Utc>,
    pub origin: Origin,
}

impl ObservedEvent {
    fn data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("event_id".to_string(), json!(self.event_id));
        data.insert("record_id".to_string(), json!(self.record_id));
        data.insert("event_time".to_string(), json!(self.time_created.to_rfc3339()));
        data.insert("origin".to_string(), json!(self.origin));
        data
    }
}

/// Lifecycle notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerSignal {
    HelloCompleted,
    FinalizingSetup { reason: String },
    PreProvisioningCompleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    PolicyResolved { enabled: bool, source: String },
    Event(ObservedEvent),
    ArmHelloWait,
    TimerFired(PendingTimer),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit {
        event_type: &'static str,
        severity: Severity,
        message: String,
        data: Map<String, Value>,
    },
    Signal(TrackerSignal),
    /// Replace whatever timer is armed
    ArmTimer { timer: PendingTimer, after: Duration },
    CancelTimer,
}

/// Monotonic provisioning state plus the single timer slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisioningState {
    pub policy: PolicyState,
    pub wizard_started: bool,
    pub hello_completed: bool,
    pub esp_exited: bool,
    pub whiteglove_detected: bool,
    pub timer: Option<PendingTimer>,
    #[serde(skip)]
    next_generation: u64,
}

fn emit(event_type: &'static str, severity: Severity, message: impl Into<String>, data: Map<String, Value>) -> Effect {
    Effect::Emit { event_type, severity, message: message.into(), data }
}

impl ProvisioningState {
    pub fn policy_enabled(&self) -> bool {
        self.policy == PolicyState::Known { enabled: true }
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) -> Effect {
        self.next_generation += 1;
        let timer = PendingTimer { kind, generation: self.next_generation };
        self.timer = Some(timer);
        Effect::ArmTimer { timer, after }
    }

    fn complete_hello(&mut self, effects: &mut Vec<Effect>) {
        self.hello_completed = true;
        if self.timer.take().is_some() {
            effects.push(Effect::CancelTimer);
        }
        effects.push(Effect::Signal(TrackerSignal::HelloCompleted));
    }

    /// Apply one input.
    pub fn apply(&mut self, input: Input, timings: &TrackerConfig) -> Vec<Effect> {
        match input {
            Input::PolicyResolved { enabled, source } => self.on_policy(enabled, source),
            Input::Event(observed) => self.on_event(observed, timings),
            Input::ArmHelloWait => self.on_arm_wait(timings),
            Input::TimerFired(timer) => self.on_timer(timer, timings),
        }
    }

    fn on_policy(&mut self, enabled: bool, source: String) -> Vec<Effect> {
        if self.policy != PolicyState::Unknown {
            return Vec::new();
        }
        self.policy = PolicyState::Known { enabled };

        let mut data = Map::new();
        data.insert("enabled".to_string(), json!(enabled));
        data.insert("policy_source".to_string(), json!(source));
        vec![emit(
            "hello_policy_detected",
            Severity::Info,
            format!("Windows Hello policy detected (enabled: {})", enabled),
            data,
        )]
    }

    fn on_arm_wait(&mut self, timings: &TrackerConfig) -> Vec<Effect> {
        if self.wizard_started || self.hello_completed || self.timer.is_some() {
            return Vec::new();
        }
        vec![self.arm(TimerKind::HelloWait, timings.hello_wait_timeout())]
    }

    fn on_timer(&mut self, fired: PendingTimer, timings: &TrackerConfig) -> Vec<Effect> {
        if self.timer != Some(fired) {
            return Vec::new();
        }
        self.timer = None;

        let mut effects = Vec::new();
        match fired.kind {
            TimerKind::HelloWait => {
                if self.wizard_started || self.hello_completed {
                    return effects;
                }
                if self.policy_enabled() {
                    let after = timings.hello_completion_timeout();
                    effects.push(self.arm(TimerKind::HelloCompletion, after));

                    let mut data = Map::new();
                    data.insert("timeout_secs".to_string(), json!(after.as_secs()));
                    effects.push(emit(
                        "hello_wait_extended",
                        Severity::Info,
                        "Hello policy is enabled but the wizard has not started yet, extending wait",
                        data,
                    ));
                } else {
                    let mut data = Map::new();
                    data.insert("policy".to_string(), json!(self.policy));
                    effects.push(emit(
                        "hello_not_applicable",
                        Severity::Info,
                        "Hello wizard did not start and no enabled policy was found",
                        data,
                    ));
                    self.complete_hello(&mut effects);
                }
            }
            TimerKind::HelloCompletion => {
                if self.hello_completed {
                    return effects;
                }
                let mut data = Map::new();
                data.insert("timeout_secs".to_string(), json!(timings.hello_completion_timeout().as_secs()));
                data.insert("wizard_started".to_string(), json!(self.wizard_started));
                effects.push(emit(
                    "hello_completion_timeout",
                    Severity::Warning,
                    "No Hello provisioning outcome before the completion timeout, marking Hello complete",
                    data,
                ));
                self.complete_hello(&mut effects);
            }
        }
        effects
    }

    fn on_event(&mut self, observed: ObservedEvent, timings: &TrackerConfig) -> Vec<Effect> {
        let mut effects = Vec::new();
        match observed.event {
            TrackerEvent::HelloOutcome(outcome) => {
                if self.hello_completed {
                    return effects;
                }
                let mut data = observed.data();
                data.insert("outcome".to_string(), json!(outcome.to_string()));
                let severity = match outcome {
                    HelloOutcome::Succeeded => Severity::Info,
                    HelloOutcome::Failed | HelloOutcome::Blocked => Severity::Warning,
                };
                effects.push(emit(
                    "hello_completed",
                    severity,
                    format!("Windows Hello provisioning {}", outcome),
                    data,
                ));
                self.complete_hello(&mut effects);
            }
            TrackerEvent::PrerequisitesNotMet => {
                effects.push(emit(
                    "hello_prerequisites_not_met",
                    Severity::Info,
                    "Windows Hello prerequisites not met",
                    observed.data(),
                ));
            }
            TrackerEvent::PrerequisitesPassed => {}
            TrackerEvent::WizardStarted => {
                if self.wizard_started {
                    return effects;
                }
                self.wizard_started = true;
                effects.push(emit(
                    "hello_wizard_started",
                    Severity::Info,
                    "Windows Hello provisioning wizard started",
                    observed.data(),
                ));
                if !self.hello_completed {
                    if self.timer.take().is_some() {
                        effects.push(Effect::CancelTimer);
                    }
                    effects.push(self.arm(TimerKind::HelloCompletion, timings.hello_completion_timeout()));
                }
            }
            TrackerEvent::EspExited => {
                if self.esp_exited {
                    return effects;
                }
                self.esp_exited = true;
                effects.push(emit("esp_exited", Severity::Info, "Enrollment Status Page exited", observed.data()));
                effects.push(Effect::Signal(TrackerSignal::FinalizingSetup { reason: "esp_exited".to_string() }));
            }
            TrackerEvent::PreProvisioningSucceeded => {
                if self.whiteglove_detected {
                    return effects;
                }
                self.whiteglove_detected = true;
                effects.push(emit(
                    "whiteglove_complete",
                    Severity::Info,
                    "Pre-provisioning completed successfully",
                    observed.data(),
                ));
                effects.push(Effect::Signal(TrackerSignal::PreProvisioningCompleted));
            }
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(event: TrackerEvent) -> Input {
        Input::Event(ObservedEvent {
            event,
            event_id: 0,
            record_id: 1,
            time_created: Utc::now(),
            origin: Origin::Live,
        })
    }

    fn armed(effects: &[Effect]) -> Option<PendingTimer> {
        effects.iter().find_map(|e| match e {
            Effect::ArmTimer { timer, .. } => Some(*timer),
            _ => None,
        })
    }

    fn signals(effects: &[Effect]) -> Vec<TrackerSignal> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Signal(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn emitted(effects: &[Effect]) -> Vec<&'static str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit { event_type, .. } => Some(*event_type),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_wait_expiry_with_policy_enabled_extends() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();
        s.apply(Input::PolicyResolved { enabled: true, source: "gpo".into() }, &t);

        let wait = armed(&s.apply(Input::ArmHelloWait, &t)).unwrap();
        let effects = s.apply(Input::TimerFired(wait), &t);

        assert_eq!(emitted(&effects), vec!["hello_wait_extended"]);
        assert!(signals(&effects).is_empty());
        let completion = armed(&effects).unwrap();
        assert_eq!(completion.kind, TimerKind::HelloCompletion);
        assert!(matches!(
            effects.iter().find(|e| matches!(e, Effect::ArmTimer { .. })),
            Some(Effect::ArmTimer { after, .. }) if *after == Duration::from_secs(1500)
        ));

        let effects = s.apply(Input::TimerFired(completion), &t);
        assert_eq!(emitted(&effects), vec!["hello_completion_timeout"]);
        assert_eq!(signals(&effects), vec![TrackerSignal::HelloCompleted]);
    }

    #[test]
    fn test_wait_expiry_without_policy_is_not_applicable() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();
        let wait = armed(&s.apply(Input::ArmHelloWait, &t)).unwrap();

        let effects = s.apply(Input::TimerFired(wait), &t);
        assert_eq!(emitted(&effects), vec!["hello_not_applicable"]);
        assert_eq!(signals(&effects), vec![TrackerSignal::HelloCompleted]);
        assert!(s.hello_completed);
        assert!(s.timer.is_none());
    }

    #[test]
    fn test_wizard_start_replaces_wait_timer() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();
        let wait = armed(&s.apply(Input::ArmHelloWait, &t)).unwrap();

        let effects = s.apply(observed(TrackerEvent::WizardStarted), &t);
        assert!(effects.contains(&Effect::CancelTimer));
        let completion = armed(&effects).unwrap();
        assert_eq!(completion.kind, TimerKind::HelloCompletion);

        // The cancelled wait timer firing late changes nothing
        assert!(s.apply(Input::TimerFired(wait), &t).is_empty());
        assert!(!s.hello_completed);
        assert_eq!(s.timer, Some(completion));
    }

    #[test]
    fn test_terminal_outcome_is_idempotent() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();
        s.apply(observed(TrackerEvent::WizardStarted), &t);

        let first = s.apply(observed(TrackerEvent::HelloOutcome(HelloOutcome::Succeeded)), &t);
        assert_eq!(signals(&first), vec![TrackerSignal::HelloCompleted]);
        assert!(first.contains(&Effect::CancelTimer));

        assert!(s.apply(observed(TrackerEvent::HelloOutcome(HelloOutcome::Failed)), &t).is_empty());
        assert!(s.apply(Input::ArmHelloWait, &t).is_empty());
    }

    #[test]
    fn test_prerequisites_snapshot_does_not_complete() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();
        let effects = s.apply(observed(TrackerEvent::PrerequisitesNotMet), &t);
        assert_eq!(emitted(&effects), vec!["hello_prerequisites_not_met"]);
        assert!(!s.hello_completed);
        assert!(s.apply(observed(TrackerEvent::PrerequisitesPassed), &t).is_empty());
    }

    #[test]
    fn test_esp_and_whiteglove_gated() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();

        let esp = s.apply(observed(TrackerEvent::EspExited), &t);
        assert_eq!(signals(&esp), vec![TrackerSignal::FinalizingSetup { reason: "esp_exited".into() }]);
        assert!(s.apply(observed(TrackerEvent::EspExited), &t).is_empty());

        let wg = s.apply(observed(TrackerEvent::PreProvisioningSucceeded), &t);
        assert_eq!(signals(&wg), vec![TrackerSignal::PreProvisioningCompleted]);
        assert!(s.apply(observed(TrackerEvent::PreProvisioningSucceeded), &t).is_empty());
    }

    #[test]
    fn test_policy_resolves_once() {
        let t = TrackerConfig::default();
        let mut s = ProvisioningState::default();
        assert_eq!(s.apply(Input::PolicyResolved { enabled: false, source: "mdm".into() }, &t).len(), 1);
        assert!(s.apply(Input::PolicyResolved { enabled: true, source: "gpo".into() }, &t).is_empty());
        assert!(!s.policy_enabled());
    }
}
