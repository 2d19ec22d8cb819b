mod agent_config;
mod env_vars;
mod rule_config;

// Re-export agent configuration
pub use agent_config::{AgentConfig, CollectionSettings, LoggingConfig, TrackerConfig};

// Re-export rule definitions
pub use rule_config::{
    CollectionRule,
    CollectorKind,
    CollectorSpec,
    RuleSet,
    Trigger,
    DEFAULT_OUTPUT_EVENT_TYPE,
};

// Re-export environment variable functions
pub use env_vars::{has_unexpanded_vars, parse_windows_env_vars};
