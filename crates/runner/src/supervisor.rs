// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session supervisor: hosts agent CLI children and bridges them to the hub.
//!
//! Each spawned session owns one JSON-RPC stdio transport and one event
//! converter. Converted events stream to the hub as frames; turn
//! boundaries drive the `thinking` flag on keepalives. The wrapped
//! dialect's step marker deliberately leaves `thinking` alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::convert::{AgentEvent, EventConverter};
use crate::agent::transport::{AgentLaunch, JsonRpcTransport, TransportError};
use crate::wire::{epoch_ms, RunnerFrame};

/// Keepalive cadence while a session is running.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for in-session control requests to the agent.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

/// Who started a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartedBy {
    Runner,
    Terminal,
}

/// A spawn request from the hub or the control surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub directory: String,
    pub agent: Option<String>,
    #[serde(default)]
    pub worktree_name: Option<String>,
    #[serde(default)]
    pub yolo: bool,
    #[serde(default)]
    pub resume_session_id: Option<String>,
    #[serde(default = "default_started_by")]
    pub started_by: StartedBy,
}

fn default_started_by() -> StartedBy {
    StartedBy::Runner
}

/// Summary of a tracked session for the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub directory: String,
    pub agent: String,
    pub started_by: StartedBy,
}

struct TrackedSession {
    info: SessionInfo,
    transport: Arc<JsonRpcTransport>,
    cancel: CancellationToken,
}

/// The runner's session host.
pub struct Supervisor {
    machine_id: String,
    outbound: mpsc::UnboundedSender<RunnerFrame>,
    sessions: RwLock<HashMap<String, Arc<TrackedSession>>>,
    permissions: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

/// Build the CLI invocation for an agent flavor.
pub fn agent_launch(request: &SpawnRequest) -> AgentLaunch {
    let agent = request.agent.as_deref().unwrap_or("claude");
    let mut args = Vec::new();
    if let Some(ref resume) = request.resume_session_id {
        args.push("--resume".to_owned());
        args.push(resume.clone());
    }
    if request.yolo {
        args.push("--dangerously-skip-permissions".to_owned());
    }
    AgentLaunch {
        command: agent.to_owned(),
        args,
        cwd: Some(request.directory.clone().into()),
        env: vec![],
    }
}

impl Supervisor {
    pub fn new(machine_id: &str, outbound: mpsc::UnboundedSender<RunnerFrame>) -> Arc<Self> {
        Arc::new(Self {
            machine_id: machine_id.to_owned(),
            outbound,
            sessions: RwLock::new(HashMap::new()),
            permissions: Mutex::new(HashMap::new()),
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn send(&self, frame: RunnerFrame) {
        let _ = self.outbound.send(frame);
    }

    /// RPC method names for one session.
    fn session_methods(session_id: &str) -> Vec<String> {
        ["killSession", "abort", "setPermissionMode", "setModel", "archive"]
            .iter()
            .map(|op| format!("{session_id}:{op}"))
            .collect()
    }

    /// Method names to re-register after a reconnect.
    pub async fn registered_methods(&self) -> Vec<String> {
        let mut methods = vec![format!("{}:spawn-happy-session", self.machine_id)];
        for id in self.sessions.read().await.keys() {
            methods.extend(Self::session_methods(id));
        }
        methods
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().map(|s| s.info.clone()).collect()
    }

    // -- Spawn -----------------------------------------------------------------

    /// Spawn a session with the default launch derived from the request.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<String, TransportError> {
        let launch = agent_launch(&request);
        self.spawn_with_launch(request, launch).await
    }

    /// Spawn a session with an explicit launch (tests, custom CLIs).
    pub async fn spawn_with_launch(
        self: &Arc<Self>,
        request: SpawnRequest,
        launch: AgentLaunch,
    ) -> Result<String, TransportError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (transport, notifications, stderr_events) = JsonRpcTransport::spawn(launch)?;
        let transport = Arc::new(transport);

        // Route agent-side permission requests through the hub and block on
        // the viewer's reply.
        {
            let supervisor = Arc::clone(self);
            let session_id = session_id.clone();
            transport
                .set_handler(
                    "session/request_permission",
                    Arc::new(move |params: Value| {
                        let supervisor = Arc::clone(&supervisor);
                        let session_id = session_id.clone();
                        Box::pin(async move {
                            Ok(supervisor.permission_round_trip(&session_id, params).await)
                        })
                    }),
                )
                .await;
        }

        let cancel = CancellationToken::new();
        let tracked = Arc::new(TrackedSession {
            info: SessionInfo {
                id: session_id.clone(),
                directory: request.directory.clone(),
                agent: request.agent.clone().unwrap_or_else(|| "claude".to_owned()),
                started_by: request.started_by,
            },
            transport: Arc::clone(&transport),
            cancel: cancel.clone(),
        });
        self.sessions.write().await.insert(session_id.clone(), tracked);

        self.send(RunnerFrame::Register { methods: Self::session_methods(&session_id) });
        self.send(RunnerFrame::SessionAlive {
            session_id: session_id.clone(),
            time: epoch_ms(),
            thinking: None,
        });

        // Event pump: converter output, stderr classification, keepalives.
        {
            let supervisor = Arc::clone(self);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                supervisor
                    .pump_session(session_id, notifications, stderr_events, cancel)
                    .await;
            });
        }

        info!(session_id = %session_id, "session spawned");
        Ok(session_id)
    }

    async fn pump_session(
        self: Arc<Self>,
        session_id: String,
        mut notifications: mpsc::UnboundedReceiver<crate::agent::transport::AgentNotification>,
        mut stderr_events: mpsc::UnboundedReceiver<crate::agent::stderr::StderrEvent>,
        cancel: CancellationToken,
    ) {
        let mut converter = EventConverter::new();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        // The first tick fires immediately; the spawn path already sent the
        // initial keepalive.
        keepalive.tick().await;
        let mut stderr_open = true;
        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    let Some(notification) = notification else { break };
                    for event in converter.handle(&notification) {
                        let thinking = match event {
                            AgentEvent::TaskStarted => Some(true),
                            AgentEvent::TaskComplete
                            | AgentEvent::TaskFailed { .. }
                            | AgentEvent::TurnAborted => Some(false),
                            // Mid-turn marker keeps the spinner running.
                            AgentEvent::CodexStepComplete => None,
                            _ => None,
                        };
                        if thinking.is_some() {
                            self.send(RunnerFrame::SessionAlive {
                                session_id: session_id.clone(),
                                time: epoch_ms(),
                                thinking,
                            });
                        }
                        match serde_json::to_value(&event) {
                            Ok(value) => self.send(RunnerFrame::AgentEvent {
                                session_id: session_id.clone(),
                                event: value,
                            }),
                            Err(e) => warn!(err = %e, "event serialization failed"),
                        }
                    }
                }
                stderr_event = stderr_events.recv(), if stderr_open => {
                    let Some(stderr_event) = stderr_event else {
                        stderr_open = false;
                        continue;
                    };
                    match serde_json::to_value(&stderr_event) {
                        Ok(mut value) => {
                            value["type"] = json!("stderr");
                            self.send(RunnerFrame::AgentEvent {
                                session_id: session_id.clone(),
                                event: value,
                            });
                        }
                        Err(e) => debug!(err = %e, "stderr event serialization failed"),
                    }
                }
                _ = keepalive.tick() => {
                    self.send(RunnerFrame::SessionAlive {
                        session_id: session_id.clone(),
                        time: epoch_ms(),
                        thinking: None,
                    });
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.teardown_session(&session_id).await;
    }

    async fn teardown_session(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            session.transport.kill();
            self.send(RunnerFrame::Unregister { methods: Self::session_methods(session_id) });
            self.send(RunnerFrame::SessionEnd {
                session_id: session_id.to_owned(),
                time: epoch_ms(),
            });
            info!(session_id = %session_id, "session ended");
        }
    }

    /// Stop a tracked session. Returns whether it was known.
    pub async fn kill(&self, session_id: &str) -> bool {
        let session = self.sessions.read().await.get(session_id).cloned();
        match session {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Tear down every session (shutdown path).
    pub async fn kill_all(&self) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.cancel.cancel();
        }
    }

    // -- Permissions -----------------------------------------------------------

    async fn permission_round_trip(&self, session_id: &str, request: Value) -> Value {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.permissions.lock().await.insert(request_id.clone(), tx);
        self.send(RunnerFrame::PermissionRequest {
            session_id: session_id.to_owned(),
            request_id,
            request,
        });
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => json!({ "outcome": { "outcome": "cancelled" } }),
        }
    }

    /// Deliver the hub's reply to the blocked agent request.
    pub async fn resolve_permission(&self, request_id: &str, outcome: Value) {
        match self.permissions.lock().await.remove(request_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(request_id = %request_id, "reply for unknown permission request"),
        }
    }

    // -- RPC dispatch ----------------------------------------------------------

    /// Handle an RPC request from the hub. Method names are
    /// `"<scope>:<op>"` where scope is this machine or a session id.
    pub async fn handle_rpc(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, String> {
        let Some((scope, op)) = method.split_once(':') else {
            return Err(format!("malformed method: {method}"));
        };

        if op == "spawn-happy-session" {
            if scope != self.machine_id {
                return Err(format!("wrong machine: {scope}"));
            }
            return Ok(self.spawn_from_rpc(params).await);
        }

        let session = self.sessions.read().await.get(scope).cloned();
        let Some(session) = session else {
            return Err(format!("unknown session: {scope}"));
        };

        match op {
            "killSession" | "archive" => {
                session.cancel.cancel();
                Ok(json!({ "type": "success" }))
            }
            "abort" => {
                session.transport.notify("session/abort", json!({}));
                Ok(json!({ "type": "success" }))
            }
            "setPermissionMode" => {
                self.control_request(&session, "session/set_permission_mode", params).await
            }
            "setModel" => self.control_request(&session, "session/set_model", params).await,
            other => Err(format!("unknown operation: {other}")),
        }
    }

    async fn control_request(
        &self,
        session: &Arc<TrackedSession>,
        method: &str,
        params: Value,
    ) -> Result<Value, String> {
        session
            .transport
            .request_with_timeout(method, params, Some(CONTROL_TIMEOUT))
            .await
            .map(|result| json!({ "type": "success", "result": result }))
            .map_err(|e| e.to_string())
    }

    async fn spawn_from_rpc(self: &Arc<Self>, params: Value) -> Value {
        let request: SpawnRequest = match serde_json::from_value(params) {
            Ok(request) => request,
            Err(e) => {
                return json!({
                    "type": "error",
                    "errorCode": "bad_request",
                    "errorMessage": format!("malformed spawn request: {e}"),
                })
            }
        };
        let resuming = request.resume_session_id.is_some();
        match self.spawn(request).await {
            Ok(session_id) => json!({ "type": "success", "sessionId": session_id }),
            Err(e) => {
                let code = if resuming { "resume_failed" } else { "spawn_failed" };
                warn!(err = %e, "spawn failed");
                json!({
                    "type": "error",
                    "errorCode": code,
                    "errorMessage": e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
