// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local agent launcher: spawn-with-abort and terminal stewardship.
//!
//! The launched CLI may own the terminal; its state is captured before the
//! spawn and restored in a deferred cleanup regardless of how the child
//! exits. Abort escalates SIGTERM → (2 s grace) → SIGKILL.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How to launch an agent CLI in the foreground.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Abort signal: cancelling it tears the child down.
    pub signal: CancellationToken,
}

/// Launch failures surfaced before the child ran at all.
#[derive(Debug)]
pub enum LaunchError {
    /// The binary is not installed; `hint` is user-visible.
    MissingBinary { hint: String },
    Io(String),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBinary { hint } => f.write_str(hint),
            Self::Io(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for LaunchError {}

/// How the launched child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchResult {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl LaunchResult {
    /// A non-zero exit is recorded as a local launch failure.
    pub fn failure_reason(&self) -> Option<String> {
        match (self.code, self.signal) {
            (Some(0), _) => None,
            (Some(code), _) => Some(format!("local launch failure: exit code {code}")),
            (None, Some(signal)) => Some(format!("local launch failure: signal {signal}")),
            (None, None) => Some("local launch failure: unknown exit".to_owned()),
        }
    }
}

// -- Terminal state ------------------------------------------------------------

/// Captures the terminal state on construction and restores it on drop, so
/// a crashed or killed agent cannot leave the terminal raw.
struct TerminalGuard {
    #[cfg(unix)]
    saved: Option<rustix::termios::Termios>,
}

impl TerminalGuard {
    fn capture() -> Self {
        #[cfg(unix)]
        {
            let stdin = std::io::stdin();
            let saved = if rustix::termios::isatty(&stdin) {
                rustix::termios::tcgetattr(&stdin).ok()
            } else {
                None
            };
            Self { saved }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref saved) = self.saved {
            let stdin = std::io::stdin();
            if let Err(e) =
                rustix::termios::tcsetattr(&stdin, rustix::termios::OptionalActions::Now, saved)
            {
                debug!(err = %e, "terminal state restore failed");
            }
        }
    }
}

// -- Spawn ---------------------------------------------------------------------

fn build_command(spec: &LaunchSpec) -> Command {
    // Shell invocation only on Windows, where CLIs ship as .cmd shims.
    #[cfg(windows)]
    let mut command = {
        let mut c = Command::new("cmd");
        let mut line = spec.command.clone();
        for arg in &spec.args {
            line.push(' ');
            line.push_str(arg);
        }
        c.args(["/C", &line]);
        c
    };
    #[cfg(not(windows))]
    let mut command = {
        let mut c = Command::new(&spec.command);
        c.args(&spec.args);
        c
    };

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command
}

/// Spawn the agent CLI and wait for it, honoring the abort signal.
pub async fn spawn_with_abort(spec: LaunchSpec) -> Result<LaunchResult, LaunchError> {
    let _terminal = TerminalGuard::capture();

    let mut child = build_command(&spec).spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::MissingBinary {
                hint: format!(
                    "`{}` was not found; install the agent CLI and make sure it is on PATH",
                    spec.command
                ),
            }
        } else {
            LaunchError::Io(format!("failed to spawn `{}`: {e}", spec.command))
        }
    })?;

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| LaunchError::Io(e.to_string()))?,
        _ = spec.signal.cancelled() => {
            terminate(&mut child).await.map_err(LaunchError::Io)?
        }
    };

    Ok(LaunchResult { code: status.code(), signal: exit_signal(&status) })
}

/// SIGTERM, a short grace, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) -> Result<std::process::ExitStatus, String> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(status) => return status.map_err(|e| e.to_string()),
            Err(_) => warn!("child ignored SIGTERM, escalating"),
        }
    }

    child.start_kill().map_err(|e| e.to_string())?;
    child.wait().await.map_err(|e| e.to_string())
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
#[path = "launcher_tests.rs"]
mod tests;
