// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner state file (`runner.state.json`) guarded by a lockfile.
//!
//! Exactly one runner per data root: the lock is held for the process
//! lifetime. A SIGKILLed runner leaves the state file behind; the next
//! start garbage-collects it after checking the recorded pid.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted runner process state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerState {
    pub pid: u32,
    /// Version baked into the running binary.
    pub version: String,
    pub control_port: u16,
    pub started_at: i64,
}

/// Exclusive lock on the runner state. Held for the process lifetime;
/// released when dropped.
pub struct StateLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // The OS releases the lock with the fd; removing the lockfile is
        // cosmetic.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The runner state file and its lock.
pub struct StateFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StateFile {
    pub fn new(home: &Path) -> Self {
        Self {
            path: home.join("runner.state.json"),
            lock_path: home.join("runner.state.lock"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the exclusive runner lock. `None` means another runner
    /// holds it.
    pub fn try_lock(&self) -> anyhow::Result<Option<StateLock>> {
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        match file.try_lock_exclusive() {
            Ok(true) => Ok(Some(StateLock { _file: file, path: self.lock_path.clone() })),
            Ok(false) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, state: &RunnerState) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn read(&self) -> Option<RunnerState> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn delete(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(err = %e, "state file delete failed");
            }
        }
    }

    /// Drop a leftover state file whose recorded process is gone (SIGKILL
    /// leaves one behind). Returns whether a stale file was collected.
    pub fn collect_stale(&self) -> bool {
        let Some(state) = self.read() else {
            return false;
        };
        if is_process_alive(state.pid) {
            return false;
        }
        debug!(pid = state.pid, "collecting stale runner state file");
        self.delete();
        true
    }
}

/// Checks whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid_i32) = i32::try_from(pid) else {
            return false;
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid_i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
#[path = "state_file_tests.rs"]
mod tests;
