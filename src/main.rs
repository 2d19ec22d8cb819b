use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;

use autopilot_monitor::cli::{Args, Commands};
use autopilot_monitor::collectors::{compile_rules, CollectionRuleEngine};
use autopilot_monitor::config::{AgentConfig, RuleSet};
use autopilot_monitor::security::SecurityGuard;
use autopilot_monitor::telemetry::{EventEmitter, LogSink};
use autopilot_monitor::tracker::{ProvisioningTracker, TrackerSignal};
use autopilot_monitor::windows::Backends;

/// How long startup rules may hold up the main loop
const STARTUP_RULES_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load_or_default(args.config.as_deref())?;

    initialize_logging(&args, &config)?;

    if let Some(cmd) = &args.command {
        return handle_subcommand(cmd);
    }

    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run_agent(args, config))
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Initialize the terminal logger, plus a file logger when requested
fn initialize_logging(args: &Args, config: &AgentConfig) -> Result<()> {
    let log_level = if args.verbose { LevelFilter::Debug } else { parse_level(&config.logging.level) };

    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![TermLogger::new(log_level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)];

    if let Some(path) = args.log_file.as_ref().or(config.logging.file.as_ref()) {
        let file = File::create(path).context(format!("Failed to create log file: {}", path.display()))?;
        loggers.push(WriteLogger::new(log_level, Config::default(), file));
    }

    CombinedLogger::init(loggers).context("Failed to initialize logger")?;
    Ok(())
}

/// Handle subcommands (validate-rules, check-target, init-config)
fn handle_subcommand(cmd: &Commands) -> Result<()> {
    match cmd {
        Commands::ValidateRules { path } => {
            let rule_set = RuleSet::from_file(path)?;
            let compiled = compile_rules(&rule_set.rules);
            let active: Vec<&str> = compiled.iter().map(|r| r.id()).collect();

            for rule in &rule_set.rules {
                let state = if active.contains(&rule.id.as_str()) { "active" } else { "disabled" };
                println!("{:<8} {:<40} {} {}", state, rule.id, rule.collector.kind(), rule.collector.target());
            }
            println!("{} of {} rules active", compiled.len(), rule_set.rules.len());
            Ok(())
        }
        Commands::CheckTarget { kind, target, namespace } => {
            let guard = SecurityGuard::default();
            let decision = guard.check((*kind).into(), target, namespace.as_deref());
            match decision.approved() {
                Some(approved) => println!("ALLOW {}", approved.target()),
                None => println!("DENY  {}", decision.reason().unwrap_or("denied")),
            }
            Ok(())
        }
        Commands::InitConfig { path } => {
            info!("Creating default configuration file at {}", path.display());
            AgentConfig::default().save_to_yaml_file(path)?;
            info!("Configuration created successfully");
            Ok(())
        }
    }
}

fn load_rules(args: &Args, config: &AgentConfig) -> Result<RuleSet> {
    match args.rules.as_deref().or(config.rules_path.as_deref()) {
        Some(path) => RuleSet::from_file(Path::new(path)),
        None => {
            info!("No rule set configured, running the tracker only");
            Ok(RuleSet::default())
        }
    }
}

async fn run_agent(args: Args, config: AgentConfig) -> Result<()> {
    info!("Starting enrollment monitoring agent");

    let rules = load_rules(&args, &config)?;
    let backends = Backends::system();
    let emitter = EventEmitter::new(Arc::new(LogSink));

    let tracker = ProvisioningTracker::new(&backends, emitter.clone(), config.tracker.clone())?;
    let mut signals = tracker.subscribe();
    tracker.start().await;

    let engine = CollectionRuleEngine::new(SecurityGuard::default(), backends, emitter, config.collection.clone())?;
    engine.update_rules(&rules.rules);
    if !engine.wait_for_startup_rules(STARTUP_RULES_TIMEOUT).await {
        warn!("Continuing while startup rules finish in the background");
    }

    if args.hello_wait {
        tracker.start_hello_wait_timer();
    }

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Ok(TrackerSignal::FinalizingSetup { reason }) => {
                    info!("Finalizing setup ({})", reason);
                    engine.on_event("finalizing_setup");
                }
                Ok(TrackerSignal::HelloCompleted) => {
                    info!("Windows Hello phase complete");
                    engine.on_event("hello_completed");
                }
                Ok(TrackerSignal::PreProvisioningCompleted) => {
                    info!("Pre-provisioning complete");
                    engine.on_event("whiteglove_complete");
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} provisioning signals", missed),
                Err(RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    engine.stop();
    tracker.stop();
    Ok(())
}
