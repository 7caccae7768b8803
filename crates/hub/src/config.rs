// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Control-plane hub for agent coding sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "hapi-hub", version, about)]
pub struct HubConfig {
    /// Host address to bind to.
    #[arg(long, env = "HAPI_HUB_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port to listen on.
    #[arg(long, env = "HAPI_HUB_PORT", default_value = "9900")]
    pub port: u16,

    /// Data root directory (database, settings).
    #[arg(long, env = "HAPI_HOME")]
    pub home: Option<PathBuf>,

    /// Bearer token for API authentication. Overrides the persisted token.
    #[arg(long, env = "HAPI_HUB_TOKEN")]
    pub auth_token: Option<String>,

    /// Web UI origin used to build deep links in push notifications.
    #[arg(long, env = "HAPI_WEB_ORIGIN", default_value = "http://localhost:3000")]
    pub web_origin: String,

    /// Session/machine keepalive expiry in milliseconds.
    #[arg(long, env = "HAPI_SESSION_TIMEOUT", default_value = "30000")]
    pub session_timeout_ms: u64,

    /// How long spawn waits for a new session to report alive before giving
    /// up on initial-prompt delivery, in milliseconds.
    #[arg(long, env = "HAPI_SPAWN_ACTIVE_TIMEOUT", default_value = "10000")]
    pub spawn_active_timeout_ms: u64,

    /// Ack timeout for RPC calls to runners, in milliseconds.
    #[arg(long, env = "HAPI_RPC_TIMEOUT", default_value = "15000")]
    pub rpc_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "HAPI_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl HubConfig {
    /// Resolve the data root: `--home`/`HAPI_HOME`, else `~/.hapi`.
    pub fn home_dir(&self) -> PathBuf {
        if let Some(ref home) = self.home {
            return home.clone();
        }
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".hapi"))
            .unwrap_or_else(|| PathBuf::from(".hapi"))
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.home_dir().join("hub.db")
    }

    /// Path of the persisted settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.home_dir().join("settings.json")
    }
}
