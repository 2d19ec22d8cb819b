use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use regex::{Regex, RegexBuilder};

use crate::config::{CollectionRule, CollectorSpec, Trigger};
use crate::constants::PATTERN_SIZE_LIMIT;
use crate::models::EnrollmentPhase;
use crate::security::is_event_log_name;

/// Phase a phase-change rule listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseMatch {
    Any,
    Exact(EnrollmentPhase),
}

impl PhaseMatch {
    pub fn matches(&self, phase: EnrollmentPhase) -> bool {
        match self {
            PhaseMatch::Any => true,
            PhaseMatch::Exact(p) => *p == phase,
        }
    }
}

/// Trigger after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledTrigger {
    Startup,
    Interval(Duration),
    PhaseChange(PhaseMatch),
    OnEvent(String),
}

/// A validated rule, ready to schedule.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: CollectionRule,
    pub trigger: CompiledTrigger,
    /// Compiled pattern for logparser rules
    pub pattern: Option<Regex>,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    /// Title, falling back to the id.
    pub fn title(&self) -> &str {
        if self.rule.title.trim().is_empty() {
            &self.rule.id
        } else {
            &self.rule.title
        }
    }
}

/// Compile a rule pattern with a bounded program size.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .context(format!("Invalid pattern '{}'", pattern))
}

fn compile_trigger(trigger: &Trigger) -> Result<CompiledTrigger> {
    Ok(match trigger {
        Trigger::Startup => CompiledTrigger::Startup,
        Trigger::Interval { seconds } => {
            if *seconds == 0 {
                bail!("Interval trigger needs a period of at least one second");
            }
            CompiledTrigger::Interval(Duration::from_secs(*seconds))
        }
        Trigger::PhaseChange { phase } => {
            let phase = phase.trim();
            if phase == "*" {
                CompiledTrigger::PhaseChange(PhaseMatch::Any)
            } else {
                CompiledTrigger::PhaseChange(PhaseMatch::Exact(phase.parse()?))
            }
        }
        Trigger::OnEvent { event_type } => {
            let event_type = event_type.trim();
            if event_type.is_empty() {
                bail!("On-event trigger has an empty event type");
            }
            CompiledTrigger::OnEvent(event_type.to_string())
        }
    })
}

/// Validate one rule. Errors are configuration failures.
pub fn compile_rule(rule: &CollectionRule) -> Result<CompiledRule> {
    if rule.id.trim().is_empty() {
        bail!("Rule has an empty id");
    }
    if rule.collector.target().trim().is_empty() {
        bail!("Rule {} has an empty {} target", rule.id, rule.collector.kind());
    }

    let trigger = compile_trigger(&rule.trigger).context(format!("Rule {} has an invalid trigger", rule.id))?;

    let pattern = match &rule.collector {
        CollectorSpec::LogParser { pattern, .. } => Some(compile_pattern(pattern)?),
        CollectorSpec::EventLog { channel, providers, .. } => {
            if !is_event_log_name(channel.trim()) {
                bail!("Rule {} names an invalid event log channel", rule.id);
            }
            if let Some(bad) = providers.iter().find(|p| !is_event_log_name(p.trim())) {
                bail!("Rule {} names an invalid event log provider {:?}", rule.id, bad);
            }
            None
        }
        _ => None,
    };

    Ok(CompiledRule { rule: rule.clone(), trigger, pattern })
}

/// Compile a rule set, dropping disabled, duplicate and invalid rules.
///
/// Invalid rules are logged and left out; they are not retried.
pub fn compile_rules(rules: &[CollectionRule]) -> Vec<Arc<CompiledRule>> {
    let mut seen = HashSet::new();
    let mut compiled = Vec::new();

    for rule in rules {
        if !rule.enabled {
            debug!("Skipping disabled rule {}", rule.id);
            continue;
        }
        if !seen.insert(rule.id.clone()) {
            warn!("Disabling rule {}: duplicate rule id", rule.id);
            continue;
        }
        match compile_rule(rule) {
            Ok(c) => compiled.push(Arc::new(c)),
            Err(e) => warn!("Disabling rule {}: {:#}", rule.id, e),
        }
    }

    compiled
}
