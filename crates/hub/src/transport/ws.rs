// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner WebSocket endpoint.
//!
//! One socket per connected runner. Outbound frames are RPC requests and
//! permission replies; inbound frames register RPC methods, answer calls,
//! stream keepalives, and deliver converted agent events. Connect and
//! disconnect both publish `connection-changed`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::events::SyncEvent;
use crate::push::PushIntent;
use crate::store::Store;
use crate::sync::cache::KeepAlive;
use crate::sync::rpc::{HubFrame, RunnerFrame, RunnerSocket};

use super::auth;
use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerQuery {
    pub token: Option<String>,
    pub machine_id: String,
}

/// `GET /api/runner` — WebSocket upgrade for a runner connection.
pub async fn runner_socket(
    State(s): State<Arc<AppState>>,
    Query(query): Query<RunnerQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate_token_param(query.token.as_deref(), s.api_token()) else {
        return crate::error::HubError::Unauthorized
            .to_http_response("missing or invalid token")
            .into_response();
    };
    let machine_id = query.machine_id;
    ws.on_upgrade(move |socket| handle_runner(s, ctx.namespace, machine_id, socket))
        .into_response()
}

async fn handle_runner(
    s: Arc<AppState>,
    namespace: String,
    machine_id: String,
    socket: WebSocket,
) {
    if let Err(e) = s
        .store
        .get_or_create_machine(&machine_id, &json!({}), None, &namespace)
    {
        warn!(machine_id = %machine_id, err = %e, "machine registration rejected");
        return;
    }

    let (runner, mut outbound) = s.rpc.attach_socket(&namespace, &machine_id).await;
    let now = Store::now_ms();
    s.cache.handle_machine_alive(&machine_id, &namespace, now).await;
    s.publisher
        .publish(&SyncEvent::ConnectionChanged {
            namespace: namespace.clone(),
            machine_id: machine_id.clone(),
            connected: true,
        })
        .await;
    info!(machine_id = %machine_id, namespace = %namespace, "runner connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RunnerFrame>(&text) {
                            Ok(frame) => {
                                handle_frame(&s, &runner, &namespace, frame).await;
                            }
                            Err(e) => {
                                debug!(machine_id = %machine_id, err = %e, "bad runner frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = s.shutdown.cancelled() => break,
        }
    }

    s.rpc.detach_socket(&runner.id).await;
    let now = Store::now_ms();
    s.cache.handle_machine_end(&machine_id, &namespace, now).await;
    s.publisher
        .publish(&SyncEvent::ConnectionChanged {
            namespace: namespace.clone(),
            machine_id: machine_id.clone(),
            connected: false,
        })
        .await;
    info!(machine_id = %machine_id, "runner disconnected");
}

async fn handle_frame(
    s: &Arc<AppState>,
    runner: &Arc<RunnerSocket>,
    namespace: &str,
    frame: RunnerFrame,
) {
    match frame {
        RunnerFrame::Register { methods } => {
            s.rpc.register_methods(&runner.id, &methods).await;
        }
        RunnerFrame::Unregister { methods } => {
            s.rpc.unregister_methods(&runner.id, &methods).await;
        }
        RunnerFrame::RpcResponse { id, result } => {
            s.rpc.handle_reply(&runner.id, id, Ok(result)).await;
        }
        RunnerFrame::RpcError { id, message } => {
            s.rpc.handle_reply(&runner.id, id, Err(message)).await;
        }
        RunnerFrame::SessionAlive { session_id, time, thinking } => {
            s.cache
                .handle_session_alive(KeepAlive {
                    session_id,
                    namespace: namespace.to_owned(),
                    time,
                    thinking,
                })
                .await;
        }
        RunnerFrame::SessionEnd { session_id, time } => {
            s.cache.handle_session_end(&session_id, namespace, time).await;
        }
        RunnerFrame::MachineAlive { machine_id, time } => {
            s.cache.handle_machine_alive(&machine_id, namespace, time).await;
        }
        RunnerFrame::AgentEvent { session_id, event } => {
            let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if let Err(e) = s.engine.add_message(&session_id, namespace, &event, None).await {
                debug!(session_id = %session_id, err = %e, "agent event append failed");
                return;
            }
            if event_type == "task_complete" {
                s.push
                    .notify(
                        namespace,
                        &session_id,
                        PushIntent::Ready,
                        "Session ready",
                        "The agent finished its turn",
                    )
                    .await;
            }
        }
        RunnerFrame::PermissionRequest { session_id, request_id, request } => {
            let reply_rx = s.engine.create_permission_request(&request_id).await;
            let body = request
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("The agent is waiting for permission")
                .to_owned();
            s.push
                .notify(
                    namespace,
                    &session_id,
                    PushIntent::PermissionRequest,
                    "Permission request",
                    &body,
                )
                .await;

            let runner = Arc::clone(runner);
            tokio::spawn(async move {
                let reply = match reply_rx.await {
                    Ok(reply) => reply,
                    Err(_) => crate::sync::engine::PermissionReply::Cancelled,
                };
                runner.send_frame(HubFrame::PermissionReply {
                    request_id,
                    outcome: reply.to_outcome(),
                });
            });
        }
    }
}
