// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Newline-delimited JSON-RPC 2.0 over an agent CLI's stdio.
//!
//! The child is spawned once; a reader task pumps stdout lines, a writer
//! task owns stdin. Outgoing requests carry increasing integer ids (from 1)
//! and wait in a pending table with a per-request deadline. Incoming
//! requests dispatch to registered handlers; notifications stream to a
//! single receiver.
//!
//! Protocol errors are fatal per connection: the first unparseable (or
//! non-object) stdout line rejects every pending request, closes stdin,
//! kills the child, and discards the rest of the stream.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stderr::{classify, StderrEvent};

/// Default request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A notification from the agent (no id).
#[derive(Debug, Clone)]
pub struct AgentNotification {
    pub method: String,
    pub params: Value,
}

/// Transport-level failures.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The request deadline passed.
    Timeout { method: String },
    /// The stdout stream produced something that is not JSON-RPC.
    Protocol(String),
    /// The child exited with pending requests outstanding.
    ChildExited { code: Option<i32>, signal: Option<i32> },
    /// The agent binary could not be started.
    SpawnFailed(String),
    /// The agent answered with a JSON-RPC error object.
    Remote { code: i64, message: String },
    /// Transport already torn down.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { method } => write!(f, "request {method} timed out"),
            Self::Protocol(message) => write!(f, "protocol error: {message}"),
            Self::ChildExited { code, signal } => {
                write!(
                    f,
                    "process exited (code={}, signal={})",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_owned()),
                    signal.map(|s| s.to_string()).unwrap_or_else(|| "none".to_owned()),
                )
            }
            Self::SpawnFailed(message) => f.write_str(message),
            Self::Remote { code, message } => write!(f, "agent error {code}: {message}"),
            Self::Closed => f.write_str("transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<Result<Value, TransportError>>>>;

/// Handler for an incoming agent request. Returns `Ok(result)` or an error
/// message mapped to JSON-RPC `-32603`.
pub type RequestHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync,
>;

/// How to launch the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

struct TransportInner {
    writer_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicI64,
    /// First fatal protocol error, sticky for the connection's lifetime.
    protocol_error: Mutex<Option<String>>,
    handlers: RwLock<HashMap<String, RequestHandler>>,
    kill: CancellationToken,
}

impl TransportInner {
    async fn fail_all_pending(&self, error: TransportError) {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Fence the connection: record the sticky error, reject everything,
    /// close stdin, and kill the child.
    async fn fatal(&self, reason: String) {
        {
            let mut sticky = self.protocol_error.lock().await;
            if sticky.is_some() {
                return;
            }
            *sticky = Some(reason.clone());
        }
        warn!(err = %reason, "agent stdout protocol error, fencing connection");
        self.fail_all_pending(TransportError::Protocol(reason)).await;
        self.kill.cancel();
    }
}

/// One JSON-RPC stdio connection to a spawned agent CLI.
pub struct JsonRpcTransport {
    inner: Arc<TransportInner>,
}

impl JsonRpcTransport {
    /// Spawn the agent and wire up the stdio pumps. Returns the transport
    /// plus the notification and stderr-event streams.
    pub fn spawn(
        launch: AgentLaunch,
    ) -> Result<
        (Self, mpsc::UnboundedReceiver<AgentNotification>, mpsc::UnboundedReceiver<StderrEvent>),
        TransportError,
    > {
        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = launch.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::SpawnFailed(format!(
                    "`{}` was not found; install the agent CLI and make sure it is on PATH",
                    launch.command
                ))
            } else {
                TransportError::SpawnFailed(format!("failed to spawn `{}`: {e}", launch.command))
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TransportInner {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            protocol_error: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            kill: CancellationToken::new(),
        });

        // Writer task: owns stdin. Closing the channel (or the kill token)
        // drops stdin, which is how the fence closes the pipe.
        if let Some(mut stdin) = stdin {
            let kill = inner.kill.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        line = writer_rx.recv() => {
                            let Some(mut line) = line else { break };
                            line.push('\n');
                            if stdin.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                            if stdin.flush().await.is_err() {
                                break;
                            }
                        }
                        _ = kill.cancelled() => break,
                    }
                }
            });
        }

        // Reader task: the stdout pump.
        if let Some(stdout) = stdout {
            let inner = Arc::clone(&inner);
            let notification_tx = notification_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let parsed: Value = match serde_json::from_str(trimmed) {
                        Ok(value) => value,
                        Err(e) => {
                            inner.fatal(format!("unparseable line: {e}")).await;
                            return;
                        }
                    };
                    if !parsed.is_object() {
                        inner.fatal("non-object JSON-RPC message".to_owned()).await;
                        return;
                    }
                    inner_route(&inner, &notification_tx, parsed).await;
                }
                debug!("agent stdout closed");
            });
        }

        // Stderr task: classify chunks, one event max per chunk.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match classify(&line) {
                        Some(kind) => {
                            let _ = stderr_tx.send(StderrEvent { kind, message: line });
                        }
                        None => debug!(line = %line, "agent stderr"),
                    }
                }
            });
        }

        // Exit watcher: owns the child; kills it when the fence fires.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status.ok(),
                    _ = inner.kill.cancelled() => {
                        let _ = child.start_kill();
                        child.wait().await.ok()
                    }
                };
                let (code, signal) = match status {
                    Some(status) => (status.code(), exit_signal(&status)),
                    None => (None, None),
                };
                inner
                    .fail_all_pending(TransportError::ChildExited { code, signal })
                    .await;
            });
        }

        Ok((Self { inner }, notification_rx, stderr_rx))
    }

    /// Register a handler for an incoming request method.
    pub async fn set_handler(&self, method: &str, handler: RequestHandler) {
        self.inner.handlers.write().await.insert(method.to_owned(), handler);
    }

    /// Issue a request with the default 120 s deadline.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.request_with_timeout(method, params, Some(DEFAULT_REQUEST_TIMEOUT)).await
    }

    /// Issue a request. `timeout: None` waits forever (long prompts).
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        if let Some(ref reason) = *self.inner.protocol_error.lock().await {
            return Err(TransportError::Protocol(reason.clone()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if self.inner.writer_tx.send(frame.to_string()).is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }

        let wait = async {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Closed),
            }
        };
        match timeout {
            None => wait.await,
            Some(deadline) => match tokio::time::timeout(deadline, wait).await {
                Ok(result) => result,
                Err(_) => {
                    self.inner.pending.lock().await.remove(&id);
                    Err(TransportError::Timeout { method: method.to_owned() })
                }
            },
        }
    }

    /// Fire-and-forget notification to the agent.
    pub fn notify(&self, method: &str, params: Value) {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let _ = self.inner.writer_tx.send(frame.to_string());
    }

    /// The sticky protocol error, if the connection has been fenced.
    pub async fn protocol_error(&self) -> Option<String> {
        self.inner.protocol_error.lock().await.clone()
    }

    /// Tear the connection down (SIGKILL path; graceful stop goes through
    /// the agent's own shutdown request first).
    pub fn kill(&self) {
        self.inner.kill.cancel();
    }
}

/// Route one parsed stdout object.
async fn inner_route(
    inner: &Arc<TransportInner>,
    notification_tx: &mpsc::UnboundedSender<AgentNotification>,
    message: Value,
) {
    let id = message.get("id").and_then(|v| v.as_i64());
    let method = message.get("method").and_then(|v| v.as_str()).map(str::to_owned);

    match (id, method) {
        // Incoming request from the agent.
        (Some(id), Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let handler = inner.handlers.read().await.get(&method).cloned();
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let reply = match handler {
                    None => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": format!("method not found: {method}") },
                    }),
                    Some(handler) => match handler(params).await {
                        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                        Err(message) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32603, "message": message },
                        }),
                    },
                };
                let _ = inner.writer_tx.send(reply.to_string());
            });
        }
        // Response to one of our requests.
        (Some(id), None) => {
            let result = if let Some(error) = message.get("error") {
                Err(TransportError::Remote {
                    code: error.get("code").and_then(|v| v.as_i64()).unwrap_or(-32603),
                    message: error
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error")
                        .to_owned(),
                })
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };
            match inner.pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!(rpc_id = id, "response for unknown request id"),
            }
        }
        // Notification.
        (None, Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let _ = notification_tx.send(AgentNotification { method, params });
        }
        (None, None) => {
            inner.fatal("message with neither id nor method".to_owned()).await;
        }
    }
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
#[path = "transport_tests.rs"]
mod tests;
