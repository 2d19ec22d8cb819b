use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

use crate::windows::{CommandOutput, CommandRunner};

/// Runs approved command lines as child processes.
///
/// The line is split on whitespace into program and arguments; no shell is
/// involved. A process still running at the deadline is killed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command_line: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("Empty command line");
        };

        debug!("Executing command: {}", command_line);
        let child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to start {}", program))?;

        // Dropping the future on timeout drops the child, which kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                let output = result.context(format!("Failed to collect output of {}", program))?;
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    timed_out: false,
                })
            }
            Err(_) => {
                warn!("Command '{}' timed out after {:?}", command_line, timeout);
                Ok(CommandOutput { timed_out: true, ..CommandOutput::default() })
            }
        }
    }
}
