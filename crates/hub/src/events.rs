// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Canonical sync events, the subscription registry, and visibility tracking.
//!
//! Every observable mutation publishes exactly one `SyncEvent`. Subscriptions
//! carry a namespace filter, an optional session/machine filter, and a
//! visibility flag; the router fans each event out to the matching ones.
//! Toast delivery additionally reports how many *visible* subscriptions
//! received it, which is what the push channel uses to decide on remote
//! fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::machines::MachineRecord;
use crate::store::messages::MessageRecord;
use crate::store::sessions::SessionRecord;

/// How often each subscription receives a heartbeat frame.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-subscription outbound buffer. Slow consumers that fall this far
/// behind are dropped rather than stalling the fan-out.
const SUBSCRIPTION_BUFFER: usize = 256;

// -- Wire-format event types ---------------------------------------------------

/// Toast payload fanned out to viewers and forwarded to web push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToastPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Canonical events emitted by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    SessionAdded { namespace: String, session: Box<SessionRecord> },
    SessionUpdated { namespace: String, session_id: String, data: serde_json::Value },
    SessionRemoved { namespace: String, session_id: String },
    MachineUpdated { namespace: String, machine: Box<MachineRecord> },
    MessageReceived { namespace: String, session_id: String, message: Box<MessageRecord> },
    Toast {
        namespace: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: ToastPayload,
    },
    ConnectionChanged { namespace: String, machine_id: String, connected: bool },
    Heartbeat,
}

impl SyncEvent {
    /// Namespace the event belongs to. Heartbeats are per-subscription and
    /// carry none.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::SessionAdded { namespace, .. }
            | Self::SessionUpdated { namespace, .. }
            | Self::SessionRemoved { namespace, .. }
            | Self::MachineUpdated { namespace, .. }
            | Self::MessageReceived { namespace, .. }
            | Self::Toast { namespace, .. }
            | Self::ConnectionChanged { namespace, .. } => Some(namespace),
            Self::Heartbeat => None,
        }
    }

    /// Session the event targets, when any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionAdded { session, .. } => Some(&session.id),
            Self::SessionUpdated { session_id, .. }
            | Self::SessionRemoved { session_id, .. }
            | Self::MessageReceived { session_id, .. } => Some(session_id),
            Self::Toast { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }

    /// Machine the event targets, when any.
    pub fn machine_id(&self) -> Option<&str> {
        match self {
            Self::MachineUpdated { machine, .. } => Some(&machine.id),
            Self::ConnectionChanged { machine_id, .. } => Some(machine_id),
            _ => None,
        }
    }
}

// -- Subscriptions -------------------------------------------------------------

/// Whether the subscribing surface is currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Shape of a new subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub namespace: String,
    /// Receive every event in the namespace.
    pub all: bool,
    pub session_id: Option<String>,
    pub machine_id: Option<String>,
    pub visibility: Visibility,
}

struct Subscription {
    id: String,
    namespace: String,
    all: bool,
    session_id: Option<String>,
    machine_id: Option<String>,
    visible: AtomicBool,
    sender: mpsc::Sender<SyncEvent>,
}

impl Subscription {
    /// Whether this subscription wants the event.
    fn matches(&self, event: &SyncEvent) -> bool {
        let Some(namespace) = event.namespace() else {
            return true; // heartbeat
        };
        if namespace != self.namespace {
            return false;
        }
        if self.all {
            return true;
        }
        let session_match = match (&self.session_id, event.session_id()) {
            (Some(want), Some(got)) => want == got,
            _ => false,
        };
        let machine_match = match (&self.machine_id, event.machine_id()) {
            (Some(want), Some(got)) => want == got,
            _ => false,
        };
        session_match || machine_match
    }
}

/// Subscription registry and event router.
pub struct Publisher {
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self { subscriptions: RwLock::new(HashMap::new()) }
    }

    /// Register a subscription; returns its id and the event receiver.
    pub async fn subscribe(
        &self,
        options: SubscribeOptions,
    ) -> (String, mpsc::Receiver<SyncEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = uuid::Uuid::new_v4().to_string();
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            namespace: options.namespace,
            all: options.all,
            session_id: options.session_id,
            machine_id: options.machine_id,
            visible: AtomicBool::new(options.visibility == Visibility::Visible),
            sender,
        });
        self.subscriptions.write().await.insert(id.clone(), subscription);
        (id, receiver)
    }

    /// Remove a subscription. Idempotent.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.subscriptions.write().await.remove(id).is_some()
    }

    /// Flip a subscription's visibility flag.
    pub async fn set_visibility(&self, id: &str, visibility: Visibility) -> bool {
        let subscriptions = self.subscriptions.read().await;
        match subscriptions.get(id) {
            Some(sub) => {
                sub.visible.store(visibility == Visibility::Visible, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Fan an event out to all matching subscriptions. Returns how many
    /// received it. Dead receivers are pruned as they are discovered.
    pub async fn publish(&self, event: &SyncEvent) -> usize {
        let (delivered, _) = self.fan_out(event).await;
        delivered
    }

    /// Deliver a toast and report the number of *visible* subscriptions it
    /// reached. The push channel treats zero as "nobody is watching".
    pub async fn send_toast(
        &self,
        namespace: &str,
        session_id: Option<&str>,
        payload: ToastPayload,
    ) -> usize {
        let event = SyncEvent::Toast {
            namespace: namespace.to_owned(),
            session_id: session_id.map(str::to_owned),
            data: payload,
        };
        let (_, visible) = self.fan_out(&event).await;
        visible
    }

    async fn fan_out(&self, event: &SyncEvent) -> (usize, usize) {
        let mut delivered = 0usize;
        let mut visible = 0usize;
        let mut dead: Vec<String> = Vec::new();
        {
            let subscriptions = self.subscriptions.read().await;
            for sub in subscriptions.values() {
                if !sub.matches(event) {
                    continue;
                }
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        if sub.visible.load(Ordering::Relaxed) {
                            visible += 1;
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscription = %sub.id, "subscription buffer full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(sub.id.clone()),
                }
            }
        }
        if !dead.is_empty() {
            let mut subscriptions = self.subscriptions.write().await;
            for id in dead {
                subscriptions.remove(&id);
            }
        }
        (delivered, visible)
    }

    /// Emit heartbeat frames to every subscription until shutdown.
    pub fn spawn_heartbeats(self: &Arc<Self>, shutdown: CancellationToken) {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
                publisher.publish(&SyncEvent::Heartbeat).await;
            }
        });
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
