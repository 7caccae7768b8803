// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The sync engine: session spawn/restart orchestration, permission routing,
//! message appends, and canonical event publication.
//!
//! Every mutating path follows the same order: write the store, reconcile the
//! in-memory mirror, then broadcast. Restarts are strictly sequential —
//! runners serialize spawns, so the only concurrency is inside a single
//! session's kill + resume pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::events::{Publisher, SyncEvent};
use crate::store::sessions::{NewSession, SessionRecord};
use crate::store::{Store, StoreError, VersionedWrite};
use crate::sync::cache::SessionCache;
use crate::sync::rpc::{RpcError, RpcRegistry};

/// Delay before the single retry of a retryable resume failure.
const RESUME_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Supported agent CLI flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

impl AgentKind {
    /// Metadata key carrying this flavor's resume token.
    pub fn resume_token_key(&self) -> &'static str {
        match self {
            Self::Claude => "claudeSessionId",
            Self::Codex => "codexSessionId",
            Self::Gemini => "geminiSessionId",
            Self::Opencode => "opencodeSessionId",
        }
    }

    pub fn all() -> [AgentKind; 4] {
        [Self::Claude, Self::Codex, Self::Gemini, Self::Opencode]
    }
}

/// Recognized spawn options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    /// Filled from the URL path when spawning via the machines API.
    #[serde(default)]
    pub machine_id: String,
    pub directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_name: Option<String>,
    #[serde(default)]
    pub yolo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
}

/// How the one-shot initial prompt fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPromptDelivery {
    Delivered,
    TimedOut,
}

/// Successful spawn result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt_delivery: Option<InitialPromptDelivery>,
}

/// Per-session restart result. Results preserve input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartOutcome {
    pub session_id: String,
    pub status: RestartStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStatus {
    Restarted,
    Skipped,
    Failed,
}

/// Viewer's answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionReply {
    Selected { option_id: String },
    Cancelled,
}

impl PermissionReply {
    /// The outcome envelope written back to the agent.
    pub fn to_outcome(&self) -> serde_json::Value {
        match self {
            Self::Selected { option_id } => {
                json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
            }
            Self::Cancelled => json!({ "outcome": { "outcome": "cancelled" } }),
        }
    }
}

/// Engine-level failures.
#[derive(Debug)]
pub enum EngineError {
    Rpc(RpcError),
    Store(StoreError),
    /// The runner answered a spawn with a structured error.
    Runner { code: Option<String>, message: String },
    NotFound,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Runner { code, message } => match code {
                Some(code) => write!(f, "{code}: {message}"),
                None => f.write_str(message),
            },
            Self::NotFound => f.write_str("not found"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RpcError> for EngineError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// The orchestrator. One per hub process.
pub struct SyncEngine {
    pub store: Arc<Store>,
    pub cache: Arc<SessionCache>,
    pub publisher: Arc<Publisher>,
    pub rpc: Arc<RpcRegistry>,
    spawn_active_timeout: Duration,
    permissions: Mutex<HashMap<String, oneshot::Sender<PermissionReply>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<SessionCache>,
        publisher: Arc<Publisher>,
        rpc: Arc<RpcRegistry>,
        spawn_active_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            rpc,
            spawn_active_timeout,
            permissions: Mutex::new(HashMap::new()),
        }
    }

    // -- Session registration --------------------------------------------------

    /// Register a session observed by a runner (tag claim). Publishes
    /// `session-added` on first observation.
    pub async fn observe_session(
        &self,
        new: NewSession,
    ) -> Result<SessionRecord, EngineError> {
        let namespace = new.namespace.clone();
        let (session, created) = self.store.get_or_create_session(new)?;
        if created {
            info!(session_id = %session.id, namespace = %namespace, "session registered");
            self.publisher
                .publish(&SyncEvent::SessionAdded {
                    namespace,
                    session: Box::new(session.clone()),
                })
                .await;
        }
        Ok(session)
    }

    /// Versioned metadata update + broadcast on success.
    pub async fn update_session_metadata(
        &self,
        session_id: &str,
        namespace: &str,
        value: &serde_json::Value,
        expected_version: i64,
    ) -> Result<VersionedWrite, EngineError> {
        let result =
            self.store.update_session_metadata(session_id, value, expected_version, namespace, true)?;
        if let VersionedWrite::Success { version, ref value } = result {
            self.publisher
                .publish(&SyncEvent::SessionUpdated {
                    namespace: namespace.to_owned(),
                    session_id: session_id.to_owned(),
                    data: json!({ "metadata": value, "metadataVersion": version }),
                })
                .await;
        }
        Ok(result)
    }

    /// Delete a session and announce the removal.
    pub async fn delete_session(
        &self,
        session_id: &str,
        namespace: &str,
    ) -> Result<bool, EngineError> {
        // Best-effort kill; a session with no live runner is deleted anyway.
        let kill = format!("{session_id}:killSession");
        if self.rpc.has_handler(&kill).await {
            if let Err(e) = self.rpc.call(&kill, json!({}), None).await {
                debug!(session_id = %session_id, err = %e, "kill before delete failed");
            }
        }
        let removed = self.store.delete_session(session_id, namespace)?;
        if removed {
            self.publisher
                .publish(&SyncEvent::SessionRemoved {
                    namespace: namespace.to_owned(),
                    session_id: session_id.to_owned(),
                })
                .await;
        }
        Ok(removed)
    }

    // -- Messages --------------------------------------------------------------

    /// Append a message and publish `message-received`.
    pub async fn add_message(
        &self,
        session_id: &str,
        namespace: &str,
        content: &serde_json::Value,
        local_id: Option<&str>,
    ) -> Result<crate::store::messages::MessageRecord, EngineError> {
        self.store
            .get_session_by_namespace(session_id, namespace)?
            .ok_or(EngineError::NotFound)?;
        let (message, created) = self.store.add_message(session_id, content, local_id)?;
        if created {
            self.publisher
                .publish(&SyncEvent::MessageReceived {
                    namespace: namespace.to_owned(),
                    session_id: session_id.to_owned(),
                    message: Box::new(message.clone()),
                })
                .await;
        }
        Ok(message)
    }

    // -- RPC dispatch ----------------------------------------------------------

    /// Dispatch an in-session operation (`abort`, `setPermissionMode`,
    /// `setModel`, …) to the runner hosting the session.
    pub async fn session_rpc(
        &self,
        session_id: &str,
        op: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let method = format!("{session_id}:{op}");
        Ok(self.rpc.call(&method, params, None).await?)
    }

    // -- Spawn -----------------------------------------------------------------

    /// Spawn a session on a machine, then deliver the initial prompt once the
    /// session reports alive (or report the timeout without inserting it).
    pub async fn spawn_session(
        &self,
        namespace: &str,
        options: SpawnOptions,
    ) -> Result<SpawnOutcome, EngineError> {
        let method = format!("{}:spawn-happy-session", options.machine_id);
        let mut params = json!({
            "type": "spawn-in-directory",
            "directory": options.directory.clone(),
            "yolo": options.yolo,
        });
        if let Some(agent) = options.agent {
            params["agent"] = serde_json::to_value(agent).unwrap_or_default();
        }
        if let Some(ref worktree) = options.worktree_name {
            params["worktreeName"] = json!(worktree);
        }
        if let Some(ref resume) = options.resume_session_id {
            params["resumeSessionId"] = json!(resume);
        }

        let reply = self.rpc.call(&method, params, None).await?;
        let session_id = parse_spawn_reply(&reply)?;

        // First observation: claim the runner's session id so keepalives
        // and messages have a row to land on.
        self.observe_session(NewSession {
            id: None,
            tag: Some(session_id.clone()),
            namespace: namespace.to_owned(),
            machine_id: Some(options.machine_id.clone()),
            metadata: json!({
                "directory": options.directory,
                "agent": options.agent,
            }),
            agent_state: None,
        })
        .await?;

        let prompt = options
            .initial_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let Some(prompt) = prompt else {
            return Ok(SpawnOutcome { session_id, initial_prompt_delivery: None });
        };

        let became_active = self
            .cache
            .wait_for_session_active(&session_id, self.spawn_active_timeout)
            .await;
        if !became_active {
            warn!(session_id = %session_id, "initial prompt timed out waiting for session");
            return Ok(SpawnOutcome {
                session_id,
                initial_prompt_delivery: Some(InitialPromptDelivery::TimedOut),
            });
        }

        let content = json!({
            "role": "user",
            "text": prompt,
            "meta": { "sentFrom": "spawn" },
        });
        self.add_message(&session_id, namespace, &content, None).await?;
        Ok(SpawnOutcome {
            session_id,
            initial_prompt_delivery: Some(InitialPromptDelivery::Delivered),
        })
    }

    // -- Restart ---------------------------------------------------------------

    /// Restart sessions sequentially: preflight resumability, kill, resume
    /// with a single retry for retryable failures.
    pub async fn restart_sessions(
        &self,
        namespace: &str,
        filter: Option<&[String]>,
    ) -> Result<Vec<RestartOutcome>, EngineError> {
        let all = self.store.list_sessions(namespace)?;
        let selected: Vec<SessionRecord> = match filter {
            Some(ids) => ids
                .iter()
                .filter_map(|id| all.iter().find(|s| &s.id == id).cloned())
                .collect(),
            None => all,
        };

        let mut outcomes = Vec::with_capacity(selected.len());
        for session in selected {
            outcomes.push(self.restart_one(&session).await);
        }
        Ok(outcomes)
    }

    async fn restart_one(&self, session: &SessionRecord) -> RestartOutcome {
        let session_id = session.id.clone();
        let Some((_, resume_token)) = resume_token(session) else {
            return RestartOutcome {
                session_id,
                status: RestartStatus::Skipped,
                error: Some("not_resumable".to_owned()),
            };
        };
        let Some(machine_id) = session.machine_id.clone() else {
            return RestartOutcome {
                session_id,
                status: RestartStatus::Failed,
                error: Some("no_machine_online".to_owned()),
            };
        };

        // Kill first. A failed kill leaves a possibly-dead runner process;
        // mark the session inactive ourselves and resume anyway.
        let kill = format!("{session_id}:killSession");
        if let Err(e) = self.rpc.call(&kill, json!({}), None).await {
            warn!(session_id = %session_id, err = %e, "kill failed, forcing inactive");
            self.cache.force_inactive(&session_id).await;
        }

        let spawn = format!("{machine_id}:spawn-happy-session");
        let directory = session
            .metadata
            .get("directory")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let params = json!({
            "type": "spawn-in-directory",
            "directory": directory,
            "resumeSessionId": resume_token,
        });

        let mut attempt = self.resume_once(&spawn, &params).await;
        if let Err(ResumeFailure::Retryable(ref message)) = attempt {
            debug!(session_id = %session_id, err = %message, "resume failed, retrying once");
            tokio::time::sleep(RESUME_RETRY_DELAY).await;
            attempt = self.resume_once(&spawn, &params).await;
        }

        match attempt {
            Ok(()) => {
                RestartOutcome { session_id, status: RestartStatus::Restarted, error: None }
            }
            Err(ResumeFailure::Retryable(message))
            | Err(ResumeFailure::Permanent(message)) => RestartOutcome {
                session_id,
                status: RestartStatus::Failed,
                error: Some(message),
            },
        }
    }

    async fn resume_once(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<(), ResumeFailure> {
        match self.rpc.call(method, params.clone(), None).await {
            Ok(reply) => match reply.get("type").and_then(|v| v.as_str()) {
                Some("success") => Ok(()),
                _ => {
                    let code = reply
                        .get("errorCode")
                        .and_then(|v| v.as_str())
                        .unwrap_or("resume_failed")
                        .to_owned();
                    if code == "resume_failed" {
                        Err(ResumeFailure::Retryable(code))
                    } else {
                        Err(ResumeFailure::Permanent(code))
                    }
                }
            },
            Err(e) => Err(ResumeFailure::Permanent(e.to_string())),
        }
    }

    // -- Permission requests ---------------------------------------------------

    /// Register a pending permission request and return the reply receiver
    /// the caller blocks on.
    pub async fn create_permission_request(
        &self,
        request_id: &str,
    ) -> oneshot::Receiver<PermissionReply> {
        let (tx, rx) = oneshot::channel();
        self.permissions.lock().await.insert(request_id.to_owned(), tx);
        rx
    }

    /// Resolve a pending permission request. Returns whether one was waiting.
    pub async fn resolve_permission(&self, request_id: &str, reply: PermissionReply) -> bool {
        match self.permissions.lock().await.remove(request_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a pending request (agent went away). The waiter sees `Cancelled`.
    pub async fn cancel_permission(&self, request_id: &str) {
        if let Some(tx) = self.permissions.lock().await.remove(request_id) {
            let _ = tx.send(PermissionReply::Cancelled);
        }
    }
}

enum ResumeFailure {
    Retryable(String),
    Permanent(String),
}

/// Resume token for a session: the first flavor key present in metadata.
pub fn resume_token(session: &SessionRecord) -> Option<(AgentKind, String)> {
    for kind in AgentKind::all() {
        if let Some(token) = session
            .metadata
            .get(kind.resume_token_key())
            .and_then(|v| v.as_str())
        {
            return Some((kind, token.to_owned()));
        }
    }
    None
}

fn parse_spawn_reply(reply: &serde_json::Value) -> Result<String, EngineError> {
    match reply.get("type").and_then(|v| v.as_str()) {
        Some("success") => reply
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or(EngineError::Runner {
                code: None,
                message: "spawn reply missing sessionId".to_owned(),
            }),
        _ => Err(EngineError::Runner {
            code: reply.get("errorCode").and_then(|v| v.as_str()).map(str::to_owned),
            message: reply
                .get("errorMessage")
                .and_then(|v| v.as_str())
                .unwrap_or("spawn failed")
                .to_owned(),
        }),
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
