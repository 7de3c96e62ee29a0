//! Bounded subprocess execution for skill-declared commands.
//!
//! `post_apply` hooks, skill tests, and the dependency installer all run as
//! blocking subprocesses with a 120-second budget; a timeout kills the child
//! and fails the step.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::EngineError;

/// Budget for skill-declared commands and the dependency installer.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Run a shell command line in `cwd` under the standard budget.
pub fn run_shell(command: &str, cwd: &Path) -> anyhow::Result<()> {
    debug!(%command, "running shell command");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    run_bounded(cmd, command)
}

/// Run a program with arguments in `cwd` under the standard budget.
pub fn run_program(program: &str, args: &[&str], cwd: &Path) -> anyhow::Result<()> {
    let display_str = format!("{program} {}", args.join(" "));
    debug!(command = %display_str, "running command");
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    run_bounded(cmd, &display_str)
}

fn run_bounded(mut cmd: Command, display: &str) -> anyhow::Result<()> {
    // Capture combined output in a scratch file; piping would deadlock on
    // chatty children once the pipe buffer fills
    let capture = tempfile::tempfile().context("Failed to create output capture file")?;
    let capture_err = capture
        .try_clone()
        .context("Failed to clone output capture handle")?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(capture))
        .stderr(Stdio::from(capture_err));

    let mut child = cmd
        .spawn()
        .map_err(|err| EngineError::Subprocess {
            command: display.to_string(),
            detail: err.to_string(),
        })?;

    let status = match child
        .wait_timeout(COMMAND_TIMEOUT)
        .context("Failed waiting on subprocess")?
    {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Timeout {
                command: display.to_string(),
                timeout_secs: COMMAND_TIMEOUT.as_secs(),
            }
            .into());
        }
    };

    if !status.success() {
        return Err(EngineError::Subprocess {
            command: display.to_string(),
            detail: format!("exit status {status}"),
        }
        .into());
    }
    Ok(())
}
