//! Scheduling, dispatch and guard enforcement of the collection engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use autopilot_monitor::collectors::CollectionRuleEngine;
use autopilot_monitor::config::{CollectionRule, CollectionSettings, CollectorSpec, Trigger};
use autopilot_monitor::constants::SECURITY_WARNING_EVENT;
use autopilot_monitor::models::{EnrollmentPhase, Severity};
use autopilot_monitor::security::SecurityGuard;
use autopilot_monitor::telemetry::{EventEmitter, MemorySink};
use autopilot_monitor::windows::{Backends, CommandOutput, CommandRunner, RegValue};

use common::Fixture;

fn engine_for(backends: Backends) -> (CollectionRuleEngine, MemorySink) {
    let sink = MemorySink::new();
    let engine = CollectionRuleEngine::new(
        SecurityGuard::default(),
        backends,
        EventEmitter::new(Arc::new(sink.clone())),
        CollectionSettings::default(),
    )
    .unwrap();
    (engine, sink)
}

fn command_rule(id: &str, command_line: &str, trigger: Trigger) -> CollectionRule {
    CollectionRule::new(id, CollectorSpec::Command { command_line: command_line.to_string() }, trigger)
}

fn results_for(sink: &MemorySink, rule_id: &str) -> usize {
    sink.events_of_type("collection_result")
        .iter()
        .filter(|e| e.data_str("rule_id") == Some(rule_id))
        .count()
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn startup_runs_immediately_and_interval_after_one_period() {
    let fixture = Fixture::new();
    let (engine, sink) = engine_for(fixture.backends());

    engine.update_rules(&[
        command_rule("boot", "dsregcmd /status", Trigger::Startup),
        command_rule("every-minute", "ipconfig /all", Trigger::Interval { seconds: 60 }),
    ]);
    assert!(engine.wait_for_startup_rules(Duration::from_secs(5)).await);
    assert_eq!(results_for(&sink, "boot"), 1);
    assert_eq!(results_for(&sink, "every-minute"), 0);

    advance(59).await;
    assert_eq!(results_for(&sink, "every-minute"), 0);

    advance(2).await;
    assert_eq!(results_for(&sink, "every-minute"), 1);

    advance(60).await;
    assert_eq!(results_for(&sink, "every-minute"), 2);
    assert_eq!(results_for(&sink, "boot"), 1);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn replacing_rules_cancels_old_interval_timers() {
    let fixture = Fixture::new();
    let (engine, sink) = engine_for(fixture.backends());

    engine.update_rules(&[command_rule("poll", "route print", Trigger::Interval { seconds: 30 })]);
    advance(31).await;
    assert_eq!(results_for(&sink, "poll"), 1);

    engine.update_rules(&[]);
    advance(300).await;
    assert_eq!(results_for(&sink, "poll"), 1);
    assert!(engine.active_rules().is_empty());
}

/// Takes 90 seconds per run.
#[derive(Default)]
struct SlowRunner {
    started: Mutex<usize>,
}

#[async_trait]
impl CommandRunner for SlowRunner {
    async fn run(&self, _command_line: &str, _timeout: Duration) -> Result<CommandOutput> {
        *self.started.lock() += 1;
        tokio::time::sleep(Duration::from_secs(90)).await;
        Ok(CommandOutput { exit_code: Some(0), ..Default::default() })
    }
}

#[tokio::test(start_paused = true)]
async fn overlapping_runs_of_one_rule_are_skipped() {
    let fixture = Fixture::new();
    let runner = Arc::new(SlowRunner::default());
    let mut backends = fixture.backends();
    backends.commands = runner.clone() as Arc<dyn CommandRunner>;
    let (engine, _sink) = engine_for(backends);

    engine.update_rules(&[command_rule("slow", "systeminfo", Trigger::Interval { seconds: 60 })]);

    // Runs start at 60; the 120 trigger lands mid-run and is skipped
    advance(170).await;
    assert_eq!(*runner.started.lock(), 1);

    // The 180 trigger finds the rule idle again
    advance(15).await;
    assert_eq!(*runner.started.lock(), 2);

    engine.stop();
}

#[tokio::test]
async fn denied_registry_rule_emits_exactly_one_security_warning() {
    let fixture = Fixture::new();
    let (engine, sink) = engine_for(fixture.backends());

    let rule = CollectionRule::new(
        "sneaky",
        CollectorSpec::Registry { path: "C:\\NotAllowed\\Key".to_string(), value_name: None },
        Trigger::Startup,
    )
    .with_title("Sneaky registry read");

    engine.update_rules(&[rule]);
    assert!(engine.wait_for_startup_rules(Duration::from_secs(5)).await);

    let warnings = sink.events_of_type(SECURITY_WARNING_EVENT);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, Severity::Warning);
    assert_eq!(warnings[0].data_str("rule_id"), Some("sneaky"));
    assert_eq!(warnings[0].data_str("rule_title"), Some("Sneaky registry read"));
    assert_eq!(warnings[0].data_str("target_kind"), Some("registry"));
    assert_eq!(warnings[0].data_str("target"), Some("C:\\NotAllowed\\Key"));
    assert_eq!(sink.len(), 1);
    assert!(fixture.registry.reads.lock().is_empty());
}

#[tokio::test]
async fn command_variants_outside_the_allowlist_never_run() {
    let fixture = Fixture::new();
    let (engine, sink) = engine_for(fixture.backends());

    let variants = [
        "IPCONFIG /ALL",
        "ipconfig  /all",
        "ipconfig",
        "ipconfig /all & whoami",
        "ipconfig /all; del C:\\Windows",
        "powershell -c Get-Process",
        "cmd /c dsregcmd /status",
    ];
    for (i, variant) in variants.iter().enumerate() {
        let rule = command_rule(&format!("variant-{}", i), variant, Trigger::Startup);
        assert_eq!(engine.execute_rule(&rule).await, 0);
    }

    assert!(fixture.runner.calls.lock().is_empty());
    let warnings = sink.events_of_type(SECURITY_WARNING_EVENT);
    assert_eq!(warnings.len(), variants.len());
    for (warning, variant) in warnings.iter().zip(variants.iter()) {
        assert_eq!(warning.data_str("target_kind"), Some("command"));
        assert_eq!(warning.data_str("target"), Some(*variant));
    }

    // Surrounding whitespace is trimmed before matching
    let rule = command_rule("padded", "  ipconfig /all  ", Trigger::Startup);
    assert_eq!(engine.execute_rule(&rule).await, 1);
    assert_eq!(*fixture.runner.calls.lock(), vec!["ipconfig /all".to_string()]);
}

#[tokio::test]
async fn phase_change_updates_stamped_phase_and_runs_rules() {
    let fixture = Fixture::new();
    let (engine, sink) = engine_for(fixture.backends());

    engine.update_rules(&[
        command_rule("apps", "dsregcmd /status", Trigger::PhaseChange { phase: "app_installation".into() }),
        command_rule("user", "whoami /all", Trigger::PhaseChange { phase: "UserSetup".into() }),
    ]);
    engine.on_phase_changed(EnrollmentPhase::AppInstallation);

    for _ in 0..200 {
        if results_for(&sink, "apps") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let events = sink.events_of_type("collection_result");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data_str("rule_id"), Some("apps"));
    assert_eq!(events[0].phase, EnrollmentPhase::AppInstallation);
}

#[tokio::test]
async fn registry_rule_reads_allowlisted_key() {
    let fixture = Fixture::new();
    fixture.registry.set("HKLM\\SOFTWARE\\Microsoft\\Enrollments", "Count", RegValue::Dword(2));
    let (engine, sink) = engine_for(fixture.backends());

    let rule = CollectionRule::new(
        "enrollments",
        CollectorSpec::Registry {
            path: "HKLM\\SOFTWARE\\Microsoft\\Enrollments".to_string(),
            value_name: Some("Count".to_string()),
        },
        Trigger::Startup,
    )
    .with_event_type("enrollment_state");

    assert_eq!(engine.execute_rule(&rule).await, 1);
    let events = sink.events_of_type("enrollment_state");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data_str("collector"), Some("registry"));
}
