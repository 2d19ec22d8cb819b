use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::security::TargetKind;

/// Command-line arguments for the monitoring agent.
///
/// Without a subcommand the agent runs until interrupted: the provisioning
/// tracker and the collection engine are started and telemetry is written
/// to the log.
#[derive(Parser, Debug)]
#[clap(name = "autopilot-monitor", about = "Enrollment monitoring agent")]
pub struct Args {
    /// Path to agent configuration YAML file
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Collection rule set (YAML or JSON), overrides the config's rules_path
    #[clap(short, long)]
    pub rules: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    pub verbose: bool,

    /// Also write the log to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Arm the Hello wait timer right after startup
    #[clap(long)]
    pub hello_wait: bool,

    /// Subcommands
    #[clap(subcommand)]
    pub command: Option<Commands>,
}

/// Target kinds accepted by `check-target`.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum TargetKindArg {
    Registry,
    Wmi,
    Command,
    File,
    #[value(name = "eventlog")]
    EventLog,
}

impl From<TargetKindArg> for TargetKind {
    fn from(kind: TargetKindArg) -> Self {
        match kind {
            TargetKindArg::Registry => TargetKind::Registry,
            TargetKindArg::Wmi => TargetKind::Wmi,
            TargetKindArg::Command => TargetKind::Command,
            TargetKindArg::File => TargetKind::File,
            TargetKindArg::EventLog => TargetKind::EventLog,
        }
    }
}

/// Available subcommands for the agent.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a rule set and report which rules would be disabled
    ValidateRules {
        /// Rule set file (YAML or JSON)
        path: PathBuf,
    },

    /// Show the security guard decision for one target
    CheckTarget {
        /// Kind of target
        #[clap(value_enum)]
        kind: TargetKindArg,

        /// Registry path, WMI query, command line, file path or event log channel
        target: String,

        /// WMI namespace (wmi targets only)
        #[clap(long)]
        namespace: Option<String>,
    },

    /// Write the default agent configuration
    InitConfig {
        /// Path to output configuration file
        #[clap(default_value = "agent.yaml")]
        path: PathBuf,
    },
}
