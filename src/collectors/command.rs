use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::{json, Map, Value};

use crate::security::ApprovedTarget;
use crate::utils::truncate::truncate_bytes;
use crate::windows::CommandRunner;

/// Output budgets for one command execution.
#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    pub timeout: Duration,
    pub stdout_budget: usize,
    pub stderr_budget: usize,
}

/// Run an approved command and capture its output.
///
/// stdout and stderr are truncated independently. A launch failure is
/// reported in an `error` field.
pub async fn collect_command(
    runner: &dyn CommandRunner,
    approved: &ApprovedTarget,
    limits: CommandLimits,
) -> Map<String, Value> {
    let command_line = approved.target();
    let mut data = Map::new();
    data.insert("command".to_string(), json!(command_line));

    info!("Running diagnostic command: {}", command_line);
    let started = Instant::now();

    match runner.run(command_line, limits.timeout).await {
        Ok(output) => {
            let (stdout, stdout_truncated) = truncate_bytes(&output.stdout, limits.stdout_budget);
            let (stderr, stderr_truncated) = truncate_bytes(&output.stderr, limits.stderr_budget);

            data.insert("exit_code".to_string(), json!(output.exit_code));
            data.insert("timed_out".to_string(), json!(output.timed_out));
            data.insert("stdout".to_string(), json!(stdout));
            data.insert("stdout_truncated".to_string(), json!(stdout_truncated));
            data.insert("stderr".to_string(), json!(stderr));
            data.insert("stderr_truncated".to_string(), json!(stderr_truncated));
        }
        Err(e) => {
            debug!("Failed to run {}: {:#}", command_line, e);
            data.insert("error".to_string(), json!(format!("{:#}", e)));
        }
    }

    data.insert("duration_ms".to_string(), json!(started.elapsed().as_millis() as u64));
    data
}
