// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner heartbeat and self-update.
//!
//! On every heartbeat the runner compares the version declared in the
//! install manifest against the version baked into its own binary. A
//! mismatch means a new binary was installed: the runner spawns a
//! replacement with the same invocation, and the replacement SIGTERMs the
//! old process when it takes over the state lock. The heartbeat interval
//! therefore bounds how long a fresh install waits to go live.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state_file::{is_process_alive, RunnerState, StateFile, StateLock};

/// Version baked into this binary.
pub const BUILT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long take-over waits for the old runner to release the lock.
const TAKE_OVER_ATTEMPTS: u32 = 50;
const TAKE_OVER_DELAY: Duration = Duration::from_millis(200);

/// Read the version declared by the installed package manifest.
pub fn installed_version(manifest_path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(manifest_path).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&contents).ok()?;
    manifest.get("version").and_then(|v| v.as_str()).map(str::to_owned)
}

/// Spawn a replacement runner with this process's own invocation, detached
/// into its own process group so it survives us.
pub fn spawn_replacement() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut command = std::process::Command::new(exe);
    command
        .args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn()?;
    Ok(())
}

/// Acquire the exclusive runner lock, taking over from a stale or outdated
/// runner. A healthy runner of the same version wins: the caller gets the
/// observable "already running" error.
pub async fn acquire_runner_lock(state_file: &StateFile) -> anyhow::Result<StateLock> {
    state_file.collect_stale();

    for attempt in 0..TAKE_OVER_ATTEMPTS {
        if let Some(lock) = state_file.try_lock()? {
            return Ok(lock);
        }

        let Some(state) = state_file.read() else {
            // Lock held but no state yet: the other runner is mid-startup.
            tokio::time::sleep(TAKE_OVER_DELAY).await;
            continue;
        };

        if state.version == BUILT_VERSION && is_process_alive(state.pid) {
            anyhow::bail!("runner already running (pid {})", state.pid);
        }

        if attempt == 0 {
            info!(
                old_pid = state.pid,
                old_version = %state.version,
                "taking over from outdated runner"
            );
            terminate_pid(state.pid);
        }
        tokio::time::sleep(TAKE_OVER_DELAY).await;
    }

    anyhow::bail!("timed out waiting for the previous runner to release its lock")
}

fn terminate_pid(pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Run the heartbeat loop: refresh the state file and watch for a newer
/// installed binary.
pub async fn run(
    state_file: &StateFile,
    state: RunnerState,
    manifest_path: &Path,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }

        if let Err(e) = state_file.write(&state) {
            debug!(err = %e, "heartbeat state refresh failed");
        }

        let Some(installed) = installed_version(manifest_path) else {
            continue;
        };
        if installed != BUILT_VERSION {
            info!(
                installed = %installed,
                running = BUILT_VERSION,
                "installed version changed, spawning replacement runner"
            );
            if let Err(e) = spawn_replacement() {
                warn!(err = %e, "replacement spawn failed");
                continue;
            }
            // The replacement SIGTERMs us once it is ready to take the
            // lock; nothing more to do here.
            return;
        }
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
