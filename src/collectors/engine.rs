//! Collection rule engine.
//!
//! Holds the active rule set, arms triggers, checks every target with the
//! [`SecurityGuard`] and dispatches to the collectors. Results are emitted as
//! telemetry; nothing is returned to the caller.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::collectors::command::{collect_command, CommandLimits};
use crate::collectors::eventlog::{collect_eventlog, EventLogRequest};
use crate::collectors::file::{collect_file, FileOptions};
use crate::collectors::log_parser::{CursorStore, IncrementalLogScanner};
use crate::collectors::registry::collect_registry;
use crate::collectors::rule::{compile_rule, compile_rules, CompiledRule, CompiledTrigger};
use crate::collectors::wmi::collect_wmi;
use crate::config::{CollectionRule, CollectionSettings, CollectorSpec};
use crate::constants::{MAX_LOG_FILES_PER_RULE, SECURITY_WARNING_EVENT, SOURCE_COLLECTION_ENGINE};
use crate::models::{EnrollmentPhase, Severity};
use crate::security::{
    log_security_event, wildcard_matches, ApprovedTarget, SecurityDecision, SecurityEvent, SecurityGuard, TargetKind,
};
use crate::telemetry::EventEmitter;
use crate::windows::Backends;

type StartupJoin = Shared<BoxFuture<'static, ()>>;

fn completed_join() -> StartupJoin {
    future::ready(()).boxed().shared()
}

struct EngineState {
    rules: Vec<Arc<CompiledRule>>,
    interval_tasks: Vec<JoinHandle<()>>,
    /// Startup rules already run in this process
    executed_startup: HashSet<String>,
    startup_join: StartupJoin,
}

struct EngineInner {
    guard: SecurityGuard,
    backends: Backends,
    scanner: IncrementalLogScanner,
    emitter: EventEmitter,
    settings: CollectionSettings,
    runtime: Handle,
    state: Mutex<EngineState>,
    /// Rule ids with an execution in progress
    in_flight: Mutex<HashSet<String>>,
}

/// Marks a rule as running until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    rule_id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, rule_id: &str) -> Option<Self> {
        if set.lock().insert(rule_id.to_string()) {
            Some(Self { set, rule_id: rule_id.to_string() })
        } else {
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.rule_id);
    }
}

/// Schedules and executes collection rules.
pub struct CollectionRuleEngine {
    inner: Arc<EngineInner>,
}

impl CollectionRuleEngine {
    /// Create an engine on the current tokio runtime.
    pub fn new(
        guard: SecurityGuard,
        backends: Backends,
        emitter: EventEmitter,
        settings: CollectionSettings,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("Collection engine needs a tokio runtime")?;

        let cursors = match &settings.cursor_state_path {
            Some(path) => CursorStore::persistent(path),
            None => CursorStore::in_memory(),
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                guard,
                backends,
                scanner: IncrementalLogScanner::new(cursors),
                emitter,
                settings,
                runtime,
                state: Mutex::new(EngineState {
                    rules: Vec::new(),
                    interval_tasks: Vec::new(),
                    executed_startup: HashSet::new(),
                    startup_join: completed_join(),
                }),
                in_flight: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Replace the active rule set.
    ///
    /// Interval timers of the previous set are cancelled first. Startup rules
    /// not yet run in this process are started right away; interval rules
    /// first fire one full period after this call.
    pub fn update_rules(&self, rules: &[CollectionRule]) {
        let compiled = compile_rules(rules);
        let mut state = self.inner.state.lock();

        for handle in state.interval_tasks.drain(..) {
            handle.abort();
        }

        let mut startup_handles = Vec::new();
        for rule in &compiled {
            match &rule.trigger {
                CompiledTrigger::Startup => {
                    if state.executed_startup.insert(rule.id().to_string()) {
                        startup_handles.push(self.inner.spawn_rule(rule.clone()));
                    }
                }
                CompiledTrigger::Interval(period) => {
                    let handle = self.inner.spawn_interval(rule.clone(), *period);
                    state.interval_tasks.push(handle);
                }
                _ => {}
            }
        }

        if !startup_handles.is_empty() {
            let previous = state.startup_join.clone();
            state.startup_join = async move {
                previous.await;
                future::join_all(startup_handles).await;
            }
            .boxed()
            .shared();
        }

        info!(
            "Activated {} collection rules ({} interval timers)",
            compiled.len(),
            state.interval_tasks.len()
        );
        state.rules = compiled;
    }

    /// Wait for startup rules to finish. Returns `false` on timeout.
    pub async fn wait_for_startup_rules(&self, timeout: Duration) -> bool {
        let join = self.inner.state.lock().startup_join.clone();
        match time::timeout(timeout, join).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Startup collection rules still running after {:?}", timeout);
                false
            }
        }
    }

    /// Report a phase change: updates the stamped phase and runs matching rules.
    pub fn on_phase_changed(&self, phase: EnrollmentPhase) {
        self.inner.emitter.set_phase(phase);

        let matching: Vec<_> = self
            .active_rules()
            .into_iter()
            .filter(|r| matches!(&r.trigger, CompiledTrigger::PhaseChange(m) if m.matches(phase)))
            .collect();

        debug!("Phase changed to {}, {} rules triggered", phase, matching.len());
        for rule in matching {
            self.inner.spawn_rule(rule);
        }
    }

    /// Report a host event; runs rules listening for `event_type`.
    pub fn on_event(&self, event_type: &str) {
        let event_type = event_type.trim();
        let matching: Vec<_> = self
            .active_rules()
            .into_iter()
            .filter(|r| matches!(&r.trigger, CompiledTrigger::OnEvent(t) if t.eq_ignore_ascii_case(event_type)))
            .collect();

        if !matching.is_empty() {
            debug!("Event {} triggered {} rules", event_type, matching.len());
        }
        for rule in matching {
            self.inner.spawn_rule(rule);
        }
    }

    /// Run one rule now, regardless of its trigger.
    ///
    /// Returns the number of telemetry events emitted.
    pub async fn execute_rule(&self, rule: &CollectionRule) -> usize {
        match compile_rule(rule) {
            Ok(compiled) => EngineInner::run(self.inner.clone(), Arc::new(compiled)).await,
            Err(e) => {
                warn!("Not executing rule {}: {:#}", rule.id, e);
                0
            }
        }
    }

    pub fn active_rules(&self) -> Vec<Arc<CompiledRule>> {
        self.inner.state.lock().rules.clone()
    }

    /// Cancel interval timers and drop the rule set. In-flight executions
    /// run to completion.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        for handle in state.interval_tasks.drain(..) {
            handle.abort();
        }
        state.rules.clear();
    }
}

impl Drop for CollectionRuleEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EngineInner {
    fn spawn_rule(self: &Arc<Self>, rule: Arc<CompiledRule>) -> JoinHandle<()> {
        let inner = self.clone();
        self.runtime.spawn(async move {
            EngineInner::run(inner, rule).await;
        })
    }

    fn spawn_interval(self: &Arc<Self>, rule: Arc<CompiledRule>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<EngineInner> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.spawn_rule(rule.clone());
            }
        })
    }

    /// Execute a rule and emit its results. Overlapping runs of the same
    /// rule are skipped.
    async fn run(inner: Arc<Self>, rule: Arc<CompiledRule>) -> usize {
        let Some(_running) = InFlight::acquire(&inner.in_flight, rule.id()) else {
            debug!("Rule {} is still running, skipping this trigger", rule.id());
            return 0;
        };

        let approved = match inner.check_target(&rule) {
            Ok(approved) => approved,
            Err(reason) => {
                inner.report_denied(&rule, &reason);
                return 0;
            }
        };

        debug!("Executing rule {} ({})", rule.id(), rule.rule.collector.kind());
        let results = match (&rule.rule.collector, approved) {
            (CollectorSpec::Command { .. }, Some(approved)) => {
                let limits = CommandLimits {
                    timeout: inner.settings.command_timeout(),
                    stdout_budget: inner.settings.stdout_budget,
                    stderr_budget: inner.settings.stderr_budget,
                };
                vec![collect_command(inner.backends.commands.as_ref(), &approved, limits).await]
            }
            (_, approved) => {
                let worker = inner.clone();
                let blocking_rule = rule.clone();
                match task::spawn_blocking(move || worker.collect_blocking(&blocking_rule, approved.as_ref())).await {
                    Ok(results) => results,
                    Err(e) => {
                        warn!("Collection task for rule {} failed: {}", rule.id(), e);
                        Vec::new()
                    }
                }
            }
        };

        for data in &results {
            inner.emit_result(&rule, data.clone());
        }
        results.len()
    }

    /// Guard-check the rule's target.
    fn check_target(&self, rule: &CompiledRule) -> std::result::Result<Option<ApprovedTarget>, String> {
        let decision = match &rule.rule.collector {
            CollectorSpec::Registry { path, .. } => self.guard.check_registry_path(path),
            CollectorSpec::Wmi { namespace, query } => self.guard.check_wmi_query(namespace.as_deref(), query),
            CollectorSpec::Command { command_line } => self.guard.check_command(command_line),
            CollectorSpec::File { path, .. } | CollectorSpec::LogParser { path, .. } => {
                self.guard.check_file_path(path)
            }
            CollectorSpec::EventLog { channel, providers, .. } => self.guard.check_event_log(channel, providers),
        };

        match decision {
            SecurityDecision::Allow(approved) => Ok(Some(approved)),
            SecurityDecision::Deny { reason } => Err(reason),
        }
    }

    fn collect_blocking(&self, rule: &CompiledRule, approved: Option<&ApprovedTarget>) -> Vec<Map<String, Value>> {
        match (&rule.rule.collector, approved) {
            (CollectorSpec::Registry { value_name, .. }, Some(approved)) => {
                vec![collect_registry(self.backends.registry.as_ref(), approved, value_name.as_deref())]
            }
            (CollectorSpec::Wmi { .. }, Some(approved)) => {
                collect_wmi(self.backends.wmi.as_ref(), approved).into_iter().collect()
            }
            (CollectorSpec::File { read_content, tail_chars, .. }, Some(approved)) => {
                let options = FileOptions { read_content: *read_content, tail_chars: *tail_chars };
                vec![collect_file(approved, options)]
            }
            (CollectorSpec::EventLog { providers, event_ids, message_filter, max_entries, .. }, Some(approved)) => {
                let request = EventLogRequest {
                    channel: approved.target(),
                    providers,
                    event_ids,
                    message_filter: message_filter.as_deref(),
                    max_entries: *max_entries,
                    filter_window: Some(self.settings.eventlog_filter_window),
                };
                collect_eventlog(self.backends.event_log.as_ref(), &request).into_iter().collect()
            }
            (CollectorSpec::LogParser { max_lines, .. }, Some(approved)) => {
                self.scan_log(rule, approved, max_lines.unwrap_or(self.settings.max_log_lines))
            }
            (spec, _) => {
                warn!("Rule {} has no approved target for {}", rule.id(), spec.kind());
                Vec::new()
            }
        }
    }

    /// Scan an approved log path. A wildcard in the final segment scans
    /// every matching file in the directory, each with its own cursor.
    fn scan_log(&self, rule: &CompiledRule, approved: &ApprovedTarget, max_lines: usize) -> Vec<Map<String, Value>> {
        let Some(pattern) = &rule.pattern else {
            return Vec::new();
        };

        match approved.wildcard() {
            Some(wildcard) => matching_logs(approved.target(), wildcard)
                .iter()
                .flat_map(|path| self.scan_file(rule, pattern, path, max_lines))
                .collect(),
            None => self.scan_file(rule, pattern, approved.target(), max_lines),
        }
    }

    fn scan_file(&self, rule: &CompiledRule, pattern: &Regex, path: &str, max_lines: usize) -> Vec<Map<String, Value>> {
        if !Path::new(path).exists() {
            debug!("Log file {} does not exist yet", path);
            return Vec::new();
        }

        match self.scanner.scan(rule.id(), path, pattern, max_lines) {
            Ok(result) => result
                .matches
                .iter()
                .map(|m| {
                    let mut data = m.to_data();
                    data.insert("path".to_string(), json!(path));
                    data
                })
                .collect(),
            Err(e) => {
                debug!("Failed to scan {}: {:#}", path, e);
                let mut data = Map::new();
                data.insert("path".to_string(), json!(path));
                data.insert("error".to_string(), json!(format!("{:#}", e)));
                vec![data]
            }
        }
    }

    fn emit_result(&self, rule: &CompiledRule, mut data: Map<String, Value>) {
        let kind = rule.rule.collector.kind();
        data.insert("rule_id".to_string(), json!(rule.id()));
        data.insert("rule_title".to_string(), json!(rule.title()));
        data.insert("collector".to_string(), json!(kind.to_string()));

        self.emitter.emit(
            SOURCE_COLLECTION_ENGINE,
            &rule.rule.event_type,
            rule.rule.severity,
            format!("{}: {} collection result", rule.title(), kind),
            data,
        );
    }

    fn report_denied(&self, rule: &CompiledRule, reason: &str) {
        let kind = target_kind(&rule.rule.collector);
        let target = rule.rule.collector.target();

        log_security_event(SecurityEvent::TargetDenied {
            rule_id: rule.id().to_string(),
            kind: kind.to_string(),
            target: target.to_string(),
            reason: reason.to_string(),
        });

        let mut data = Map::new();
        data.insert("rule_id".to_string(), json!(rule.id()));
        data.insert("rule_title".to_string(), json!(rule.title()));
        data.insert("target_kind".to_string(), json!(kind.to_string()));
        data.insert("target".to_string(), json!(target));
        data.insert("reason".to_string(), json!(reason));

        self.emitter.emit(
            SOURCE_COLLECTION_ENGINE,
            SECURITY_WARNING_EVENT,
            Severity::Warning,
            format!("Blocked {} target for rule {}: {}", kind, rule.title(), reason),
            data,
        );
    }
}

fn target_kind(spec: &CollectorSpec) -> TargetKind {
    match spec {
        CollectorSpec::Registry { .. } => TargetKind::Registry,
        CollectorSpec::Wmi { .. } => TargetKind::Wmi,
        CollectorSpec::Command { .. } => TargetKind::Command,
        CollectorSpec::File { .. } | CollectorSpec::LogParser { .. } => TargetKind::File,
        CollectorSpec::EventLog { .. } => TargetKind::EventLog,
    }
}

/// Regular files in `dir` whose names match `wildcard`, sorted by path.
fn matching_logs(dir: &str, wildcard: &str) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to list log directory {}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut paths: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| wildcard_matches(wildcard, &entry.file_name().to_string_lossy()))
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();
    paths.sort();

    if paths.len() > MAX_LOG_FILES_PER_RULE {
        warn!("{} files in {} match {}, scanning the first {}", paths.len(), dir, wildcard, MAX_LOG_FILES_PER_RULE);
        paths.truncate(MAX_LOG_FILES_PER_RULE);
    }
    paths
}
