// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! hapi-runner: per-machine supervisor for agent coding sessions.
//!
//! Hosts agent CLI children over JSON-RPC stdio, normalizes their event
//! dialects, and bridges everything to the hub over a WebSocket. One runner
//! per data root, enforced with a lockfile; a newly installed binary takes
//! over at the next heartbeat.

pub mod agent;
pub mod config;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod hub_client;
pub mod state_file;
pub mod supervisor;
pub mod token;
pub mod wire;

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::state_file::{RunnerState, StateFile};
use crate::supervisor::Supervisor;
use crate::wire::epoch_ms;

/// The subset of the shared `settings.json` the runner reads when it is
/// co-located with a hub.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedSettings {
    machine_id: Option<String>,
    cli_api_token: Option<String>,
}

fn read_shared_settings(config: &RunnerConfig) -> SharedSettings {
    let path = config.home_dir().join("settings.json");
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|contents| serde_json::from_str(&contents).ok())
        .unwrap_or_default()
}

/// Resolve the stable machine id: flag/env, shared settings, or a
/// generated one persisted under the data root.
fn resolve_machine_id(config: &RunnerConfig, shared: &SharedSettings) -> anyhow::Result<String> {
    if let Some(ref id) = config.machine_id {
        return Ok(id.clone());
    }
    if let Some(ref id) = shared.machine_id {
        return Ok(id.clone());
    }
    let path = config.home_dir().join("machine-id");
    if let Ok(id) = std::fs::read_to_string(&path) {
        let id = id.trim().to_owned();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::create_dir_all(config.home_dir())?;
    std::fs::write(&path, &id)?;
    Ok(id)
}

/// Run the runner in the foreground until shutdown.
pub async fn run(config: RunnerConfig) -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shared = read_shared_settings(&config);
    let api_token = config
        .api_token
        .clone()
        .or(shared.cli_api_token.clone())
        .ok_or_else(|| anyhow::anyhow!("CLI_API_TOKEN is not set and no settings.json found"))?;
    let machine_id = resolve_machine_id(&config, &shared)?;

    let state_file = StateFile::new(&config.home_dir());
    let _lock = heartbeat::acquire_runner_lock(&state_file).await?;

    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(&machine_id, outbound_tx.clone());

    // Control surface. Port 0 picks a free one; the state file records it.
    let control_listener =
        tokio::net::TcpListener::bind(("127.0.0.1", config.control_port)).await?;
    let control_port = control_listener.local_addr()?.port();

    let state = RunnerState {
        pid: std::process::id(),
        version: heartbeat::BUILT_VERSION.to_owned(),
        control_port,
        started_at: epoch_ms(),
    };
    state_file.write(&state)?;

    // Hub link.
    {
        let (base_token, namespace) = token::split_token(&api_token);
        let ws_token = token::with_namespace(base_token, namespace);
        let ws_url = config.runner_ws_url(&ws_token, &machine_id);
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms);
        tokio::spawn(async move {
            hub_client::run(
                ws_url,
                supervisor,
                outbound_tx,
                outbound_rx,
                heartbeat_interval,
                shutdown,
            )
            .await;
        });
    }

    // Heartbeat / self-update watcher.
    {
        let state_file = StateFile::new(&config.home_dir());
        let manifest = config.manifest_path();
        let interval = Duration::from_millis(config.heartbeat_interval_ms);
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            heartbeat::run(&state_file, state, &manifest, interval, shutdown).await;
        });
    }

    // Signals: SIGTERM and ctrl-c both run the graceful path.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let term = async {
                #[cfg(unix)]
                {
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(mut stream) => {
                            stream.recv().await;
                        }
                        Err(_) => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                std::future::pending::<()>().await
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term => {}
            }
            shutdown.cancel();
        });
    }

    info!(machine_id = %machine_id, control_port, "hapi-runner started");
    let router = control::build_router(supervisor.clone());
    let serve = axum::serve(control_listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    if let Err(e) = serve.await {
        warn!(err = %e, "control server error");
    }

    // Graceful cleanup: stop sessions, drop the state file. The lock is
    // released when `_lock` drops.
    supervisor.kill_all().await;
    state_file.delete();
    info!("hapi-runner stopped");
    Ok(())
}

/// Launch an agent CLI in the foreground terminal. Ctrl-C aborts the
/// child (SIGTERM, then SIGKILL); a non-zero exit is a local launch
/// failure and maps to this process's exit code 1.
pub async fn launch_foreground(
    agent: &str,
    directory: Option<std::path::PathBuf>,
    args: Vec<String>,
) -> anyhow::Result<()> {
    let signal = CancellationToken::new();
    {
        let signal = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.cancel();
            }
        });
    }

    let result = agent::launcher::spawn_with_abort(agent::launcher::LaunchSpec {
        command: agent.to_owned(),
        args,
        cwd: directory,
        env: vec![],
        signal,
    })
    .await?;

    if let Some(reason) = result.failure_reason() {
        warn!(agent = %agent, reason = %reason, "agent exited abnormally");
        anyhow::bail!("{reason}");
    }
    Ok(())
}

/// Detach a background runner (`start`). Refuses when one is already
/// running; the message is part of the CLI contract.
pub fn start_detached(config: &RunnerConfig) -> anyhow::Result<()> {
    let state_file = StateFile::new(&config.home_dir());
    state_file.collect_stale();
    if let Some(state) = state_file.read() {
        if state_file.try_lock()?.is_none() && state_file::is_process_alive(state.pid) {
            anyhow::bail!("runner already running (pid {})", state.pid);
        }
    }

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("start-sync")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command.spawn()?;
    println!("runner started (pid {})", child.id());
    Ok(())
}
