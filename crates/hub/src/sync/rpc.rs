// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC routing between the hub and connected runner sockets.
//!
//! Runners register method names (`"<machine>:spawn-happy-session"`,
//! `"<session>:killSession"`); the registry maps each name to the socket that
//! owns it. Calls are request/response over the socket with a pending table
//! keyed by integer id and a per-call deadline. A socket that disconnects
//! fails its pending calls and releases its method names.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};

/// Frames sent from the hub to a runner socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    RpcRequest { id: u64, method: String, params: serde_json::Value },
    /// Answer to a runner-initiated permission request.
    PermissionReply { request_id: String, outcome: serde_json::Value },
}

/// Frames received from a runner socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerFrame {
    /// Claim ownership of RPC method names.
    Register { methods: Vec<String> },
    /// Release method names (e.g. a session ended).
    Unregister { methods: Vec<String> },
    RpcResponse { id: u64, result: serde_json::Value },
    RpcError { id: u64, message: String },
    SessionAlive {
        session_id: String,
        time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<bool>,
    },
    SessionEnd { session_id: String, time: i64 },
    MachineAlive { machine_id: String, time: i64 },
    AgentEvent { session_id: String, event: serde_json::Value },
    /// An agent asked for permission; blocks runner-side until the hub
    /// replies with a `PermissionReply` frame.
    PermissionRequest { session_id: String, request_id: String, request: serde_json::Value },
}

/// RPC failure modes surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No connected socket has registered the method.
    NoHandler(String),
    /// The ack deadline passed.
    Timeout(String),
    /// The owning socket went away mid-call.
    Disconnected,
    /// The runner answered with an error.
    Remote(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHandler(method) => write!(f, "no handler registered for {method}"),
            Self::Timeout(method) => write!(f, "rpc timeout for {method}"),
            Self::Disconnected => f.write_str("runner socket disconnected"),
            Self::Remote(message) => write!(f, "runner error: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// One connected runner socket.
pub struct RunnerSocket {
    pub id: String,
    pub namespace: String,
    pub machine_id: String,
    outbound: mpsc::UnboundedSender<HubFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>>,
    next_id: AtomicU64,
}

impl RunnerSocket {
    /// Push a frame onto the socket's outbound stream.
    pub fn send_frame(&self, frame: HubFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = HubFrame::RpcRequest { id, method: method.to_owned(), params };
        if self.outbound.send(frame).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Timeout(method.to_owned()))
            }
        }
    }

    async fn resolve(&self, id: u64, result: Result<serde_json::Value, RpcError>) {
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(rpc_id = id, "response for unknown rpc id"),
        }
    }

    async fn fail_all_pending(&self) {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::Disconnected));
        }
    }
}

/// Registry of runner sockets and the RPC method names they own.
pub struct RpcRegistry {
    sockets: RwLock<HashMap<String, Arc<RunnerSocket>>>,
    methods: RwLock<HashMap<String, String>>,
    default_timeout: Duration,
}

impl RpcRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
            methods: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Attach a new runner socket. The returned receiver is the outbound
    /// frame stream the transport writes to the wire.
    pub async fn attach_socket(
        &self,
        namespace: &str,
        machine_id: &str,
    ) -> (Arc<RunnerSocket>, mpsc::UnboundedReceiver<HubFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let socket = Arc::new(RunnerSocket {
            id: uuid::Uuid::new_v4().to_string(),
            namespace: namespace.to_owned(),
            machine_id: machine_id.to_owned(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        self.sockets.write().await.insert(socket.id.clone(), Arc::clone(&socket));
        (socket, rx)
    }

    /// Detach a socket: releases its methods and fails its pending calls.
    pub async fn detach_socket(&self, socket_id: &str) {
        let socket = self.sockets.write().await.remove(socket_id);
        self.methods.write().await.retain(|_, owner| owner != socket_id);
        if let Some(socket) = socket {
            socket.fail_all_pending().await;
        }
    }

    pub async fn register_methods(&self, socket_id: &str, names: &[String]) {
        let mut methods = self.methods.write().await;
        for name in names {
            if let Some(previous) = methods.insert(name.clone(), socket_id.to_owned()) {
                if previous != socket_id {
                    warn!(method = %name, "rpc method re-registered by a different socket");
                }
            }
        }
    }

    pub async fn unregister_methods(&self, socket_id: &str, names: &[String]) {
        let mut methods = self.methods.write().await;
        for name in names {
            if methods.get(name).map(String::as_str) == Some(socket_id) {
                methods.remove(name);
            }
        }
    }

    /// Whether any socket currently owns the method.
    pub async fn has_handler(&self, method: &str) -> bool {
        self.methods.read().await.contains_key(method)
    }

    /// Issue an RPC to whichever socket owns `method`.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        let socket = {
            let methods = self.methods.read().await;
            let owner = methods.get(method).ok_or_else(|| {
                RpcError::NoHandler(method.to_owned())
            })?;
            let sockets = self.sockets.read().await;
            sockets.get(owner).cloned().ok_or(RpcError::Disconnected)?
        };
        socket.call(method, params, timeout.unwrap_or(self.default_timeout)).await
    }

    /// Route an inbound RPC response/error frame to its pending call.
    pub async fn handle_reply(&self, socket_id: &str, id: u64, reply: Result<serde_json::Value, String>) {
        let socket = self.sockets.read().await.get(socket_id).cloned();
        if let Some(socket) = socket {
            socket.resolve(id, reply.map_err(RpcError::Remote)).await;
        }
    }

    /// Machine id of the socket owning a method, for diagnostics.
    pub async fn owner_machine(&self, method: &str) -> Option<String> {
        let methods = self.methods.read().await;
        let owner = methods.get(method)?;
        let sockets = self.sockets.read().await;
        sockets.get(owner).map(|s| s.machine_id.clone())
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
