// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Per-machine supervisor for agent coding sessions.
#[derive(Debug, Parser)]
#[command(name = "hapi-runner", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: RunnerCommand,

    #[command(flatten)]
    pub config: RunnerConfig,
}

#[derive(Debug, Subcommand)]
pub enum RunnerCommand {
    /// Start the runner in the background (detached).
    Start,
    /// Start the runner in the foreground.
    StartSync,
    /// Launch an agent CLI in this terminal (no hub involvement).
    Launch {
        /// Agent CLI to run (claude, codex, gemini, opencode).
        agent: String,
        /// Working directory for the agent.
        #[arg(long)]
        directory: Option<PathBuf>,
        /// Extra arguments passed through to the agent CLI.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Parser)]
pub struct RunnerConfig {
    /// Data root directory (state file, settings).
    #[arg(long, env = "HAPI_HOME")]
    pub home: Option<PathBuf>,

    /// Hub base URL.
    #[arg(long, env = "HAPI_API_URL", default_value = "http://127.0.0.1:9900")]
    pub api_url: String,

    /// Base API token; a namespace may be suffixed `:ns`.
    #[arg(long, env = "CLI_API_TOKEN")]
    pub api_token: Option<String>,

    /// Stable machine id. Generated and persisted on first start.
    #[arg(long, env = "HAPI_MACHINE_ID")]
    pub machine_id: Option<String>,

    /// Heartbeat interval in milliseconds (also bounds how quickly a newly
    /// installed binary takes over).
    #[arg(long, env = "HAPI_RUNNER_HEARTBEAT_INTERVAL", default_value = "30000")]
    pub heartbeat_interval_ms: u64,

    /// HTTP control port (0 = pick a free port).
    #[arg(long, env = "HAPI_RUNNER_PORT", default_value = "9901")]
    pub control_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "HAPI_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl RunnerConfig {
    /// Resolve the data root: `--home`/`HAPI_HOME`, else `~/.hapi`.
    pub fn home_dir(&self) -> PathBuf {
        if let Some(ref home) = self.home {
            return home.clone();
        }
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".hapi"))
            .unwrap_or_else(|| PathBuf::from(".hapi"))
    }

    /// WebSocket URL of the hub's runner endpoint.
    pub fn runner_ws_url(&self, token: &str, machine_id: &str) -> String {
        let base = self.api_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{base}")
        };
        format!("{ws_base}/api/runner?token={token}&machineId={machine_id}")
    }

    /// The install manifest consulted by the heartbeat for self-update.
    pub fn manifest_path(&self) -> PathBuf {
        self.home_dir().join("manifest.json")
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
