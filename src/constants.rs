//! Global constants for the monitoring agent.
//!
//! Caps, budgets and default timer lengths live here so the collectors and
//! the tracker agree on them.

// Collection engine caps
/// Maximum registry values returned when a whole key is read
pub const MAX_REGISTRY_VALUES: usize = 50;

/// Maximum WMI result objects per query
pub const MAX_WMI_RESULTS: usize = 20;

/// Maximum event log entries returned by an eventlog rule
pub const MAX_EVENTLOG_ENTRIES: usize = 50;

/// Default number of event log entries read when a rule sets no limit
pub const DEFAULT_EVENTLOG_ENTRIES: usize = 20;

/// Newest entries searched when an eventlog rule has a message filter
pub const DEFAULT_EVENTLOG_FILTER_WINDOW: usize = 500;

/// Maximum directory entries listed by a file rule
pub const MAX_DIRECTORY_ENTRIES: usize = 100;

/// Largest file whose content may be read by a file rule (5MB)
pub const MAX_FILE_CONTENT_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of trailing characters read from a file
pub const DEFAULT_FILE_TAIL_CHARS: usize = 4000;

/// Upper bound for the trailing characters a rule may ask for
pub const MAX_FILE_TAIL_CHARS: usize = 64 * 1024;

// Command execution
/// Hard wall-clock timeout for allowlisted commands in seconds
pub const COMMAND_TIMEOUT_SECS: u64 = 30;

/// Byte budget for captured stdout (64KB)
pub const COMMAND_STDOUT_BUDGET: usize = 64 * 1024;

/// Byte budget for captured stderr (16KB)
pub const COMMAND_STDERR_BUDGET: usize = 16 * 1024;

/// Marker appended to truncated output
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

// Incremental log scanner
/// Default maximum lines read per scan
pub const DEFAULT_MAX_LOG_LINES: usize = 1000;

/// Lines longer than this are skipped unread (64KB)
pub const MAX_LOG_LINE_BYTES: usize = 64 * 1024;

/// Files scanned per wildcard log parser rule
pub const MAX_LOG_FILES_PER_RULE: usize = 32;

/// Messages longer than this are cut before pattern matching
pub const MAX_MATCH_INPUT_LEN: usize = 8 * 1024;

/// Compiled size limit for rule patterns (bounds pathological patterns)
pub const PATTERN_SIZE_LIMIT: usize = 1024 * 1024;

// Provisioning tracker timers
/// Short wait after the account setup phase exits before Hello is judged
pub const HELLO_WAIT_TIMEOUT_SECS: u64 = 30;

/// Long wait for a terminal Hello outcome once the wizard is expected
pub const HELLO_COMPLETION_TIMEOUT_SECS: u64 = 1500;

/// Interval between policy checks while the Hello policy is unresolved
pub const POLICY_POLL_INTERVAL_SECS: u64 = 10;

/// Interval between event log watcher polls
pub const WATCHER_POLL_INTERVAL_SECS: u64 = 2;

/// Look-back window for terminal Hello events at startup
pub const BACKFILL_LOOKBACK_MINUTES: i64 = 60;

/// Event source names stamped on emitted telemetry
pub const SOURCE_COLLECTION_ENGINE: &str = "collection_engine";
pub const SOURCE_PROVISIONING_TRACKER: &str = "provisioning_tracker";

/// Event type of the security warning emitted on guard denial
pub const SECURITY_WARNING_EVENT: &str = "security_warning";
