// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hub connection client.
//!
//! Maintains the runner's WebSocket to the hub: registers RPC methods on
//! every (re)connect, pumps outbound frames, dispatches inbound RPC
//! requests to the supervisor, and heartbeats machine liveness. Reconnects
//! with exponential backoff — a late-started hub picks the runner up
//! automatically.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;
use crate::wire::{epoch_ms, HubFrame, RunnerFrame};

/// Cap for the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Run the hub link until shutdown.
pub async fn run(
    ws_url: String,
    supervisor: Arc<Supervisor>,
    outbound_tx: mpsc::UnboundedSender<RunnerFrame>,
    mut outbound_rx: mpsc::UnboundedReceiver<RunnerFrame>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((stream, _)) => {
                attempt = 0;
                info!("connected to hub");
                connected_loop(
                    stream,
                    &supervisor,
                    &outbound_tx,
                    &mut outbound_rx,
                    heartbeat,
                    &shutdown,
                )
                .await;
                if shutdown.is_cancelled() {
                    return;
                }
                warn!("hub connection lost, reconnecting");
            }
            Err(e) => {
                debug!(err = %e, attempt, "hub connection failed");
            }
        }

        let delay = Duration::from_millis(500 * 2u64.pow(attempt.min(5))).min(MAX_BACKOFF);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn connected_loop(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    supervisor: &Arc<Supervisor>,
    outbound_tx: &mpsc::UnboundedSender<RunnerFrame>,
    outbound_rx: &mut mpsc::UnboundedReceiver<RunnerFrame>,
    heartbeat: Duration,
    shutdown: &CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = stream.split();

    // Re-register everything this runner owns.
    let register = RunnerFrame::Register { methods: supervisor.registered_methods().await };
    if send_frame(&mut ws_tx, &register).await.is_err() {
        return;
    }
    let alive = RunnerFrame::MachineAlive {
        machine_id: supervisor.machine_id().to_owned(),
        time: epoch_ms(),
    };
    if send_frame(&mut ws_tx, &alive).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(heartbeat);
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return };
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    return;
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<HubFrame>(&text) {
                            Ok(frame) => dispatch(supervisor, outbound_tx, frame).await,
                            Err(e) => debug!(err = %e, "bad hub frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(e)) => {
                        debug!(err = %e, "hub socket error");
                        return;
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                let alive = RunnerFrame::MachineAlive {
                    machine_id: supervisor.machine_id().to_owned(),
                    time: epoch_ms(),
                };
                if send_frame(&mut ws_tx, &alive).await.is_err() {
                    return;
                }
            }
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn send_frame<S>(
    ws_tx: &mut S,
    frame: &RunnerFrame,
) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(frame) else {
        return Ok(());
    };
    ws_tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn dispatch(
    supervisor: &Arc<Supervisor>,
    outbound_tx: &mpsc::UnboundedSender<RunnerFrame>,
    frame: HubFrame,
) {
    match frame {
        HubFrame::RpcRequest { id, method, params } => {
            let supervisor = Arc::clone(supervisor);
            let outbound_tx = outbound_tx.clone();
            tokio::spawn(async move {
                let reply = match supervisor.handle_rpc(&method, params).await {
                    Ok(result) => RunnerFrame::RpcResponse { id, result },
                    Err(message) => RunnerFrame::RpcError { id, message },
                };
                let _ = outbound_tx.send(reply);
            });
        }
        HubFrame::PermissionReply { request_id, outcome } => {
            supervisor.resolve_permission(&request_id, outcome).await;
        }
    }
}
