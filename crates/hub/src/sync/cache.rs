// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory liveness mirror for sessions and machines.
//!
//! Runners send keepalives; the cache flips `active`/`thinking`, reconciles
//! the store, then broadcasts. Expiry runs on a timer. Every broadcast that
//! carries `active: false` also carries `thinking: false` — an expired
//! session must never leave a spinner running on a viewer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{Publisher, SyncEvent};
use crate::store::Store;

/// How often the expiry sweep runs.
const EXPIRE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A keepalive from a runner.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub session_id: String,
    pub namespace: String,
    /// Sender-side epoch millis. Stale keepalives (older than the last one
    /// seen) are ignored.
    pub time: i64,
    pub thinking: Option<bool>,
}

#[derive(Debug, Clone)]
struct LiveSession {
    namespace: String,
    active: bool,
    active_at: i64,
    thinking: bool,
}

#[derive(Debug, Clone)]
struct LiveMachine {
    namespace: String,
    active: bool,
    active_at: i64,
}

/// Liveness cache: the in-memory sibling of the store.
pub struct SessionCache {
    store: Arc<Store>,
    publisher: Arc<Publisher>,
    sessions: RwLock<HashMap<String, LiveSession>>,
    machines: RwLock<HashMap<String, LiveMachine>>,
    timeout_ms: i64,
}

impl SessionCache {
    pub fn new(store: Arc<Store>, publisher: Arc<Publisher>, timeout_ms: i64) -> Self {
        Self {
            store,
            publisher,
            sessions: RwLock::new(HashMap::new()),
            machines: RwLock::new(HashMap::new()),
            timeout_ms,
        }
    }

    /// Whether the session is currently marked active.
    pub async fn is_active(&self, session_id: &str) -> bool {
        self.sessions.read().await.get(session_id).map(|s| s.active).unwrap_or(false)
    }

    /// Force a session inactive in memory without touching the store. Used
    /// when a kill RPC fails and the runner can no longer be trusted to
    /// report the end itself.
    pub async fn force_inactive(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.active = false;
            entry.thinking = false;
        }
    }

    /// Handle a keepalive. Updates `active`/`activeAt`, folds in a changed
    /// `thinking` flag, reconciles the store, and broadcasts the delta.
    pub async fn handle_session_alive(&self, alive: KeepAlive) {
        let mut data = json!({ "active": true });
        let thinking_now;
        {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.entry(alive.session_id.clone()).or_insert_with(|| LiveSession {
                namespace: alive.namespace.clone(),
                active: false,
                active_at: 0,
                thinking: false,
            });
            if alive.time < entry.active_at {
                debug!(session_id = %alive.session_id, "stale keepalive ignored");
                return;
            }
            entry.active = true;
            entry.active_at = alive.time;
            if let Some(thinking) = alive.thinking {
                if thinking != entry.thinking {
                    entry.thinking = thinking;
                    data["thinking"] = json!(thinking);
                }
            }
            thinking_now = entry.thinking;
        }

        let thinking_changed = data.get("thinking").is_some();
        let stored = self.store.set_session_liveness(
            &alive.session_id,
            &alive.namespace,
            true,
            Some(alive.time),
            thinking_now,
            if thinking_changed { Some(alive.time) } else { None },
        );
        match stored {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %alive.session_id, "keepalive for unknown session row");
                return;
            }
            Err(e) => {
                warn!(session_id = %alive.session_id, err = %e, "liveness reconcile failed");
                return;
            }
        }

        self.publisher
            .publish(&SyncEvent::SessionUpdated {
                namespace: alive.namespace,
                session_id: alive.session_id,
                data,
            })
            .await;
    }

    /// Handle an explicit session end: both flags drop together.
    pub async fn handle_session_end(&self, session_id: &str, namespace: &str, time: i64) {
        {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.entry(session_id.to_owned()).or_insert_with(|| LiveSession {
                namespace: namespace.to_owned(),
                active: false,
                active_at: 0,
                thinking: false,
            });
            entry.active = false;
            entry.thinking = false;
            entry.active_at = entry.active_at.max(time);
        }

        if let Err(e) = self.store.set_session_liveness(
            session_id,
            namespace,
            false,
            Some(time),
            false,
            Some(time),
        ) {
            warn!(session_id = %session_id, err = %e, "session end reconcile failed");
        }

        self.publisher
            .publish(&SyncEvent::SessionUpdated {
                namespace: namespace.to_owned(),
                session_id: session_id.to_owned(),
                data: json!({ "active": false, "thinking": false }),
            })
            .await;
    }

    /// Expire sessions whose last keepalive is older than the timeout.
    /// Returns the expired session ids.
    pub async fn expire_inactive(&self, now: i64) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            for (id, entry) in sessions.iter_mut() {
                if entry.active && now - entry.active_at > self.timeout_ms {
                    entry.active = false;
                    entry.thinking = false;
                    expired.push((id.clone(), entry.namespace.clone()));
                }
            }
        }

        let mut ids = Vec::with_capacity(expired.len());
        for (session_id, namespace) in expired {
            if let Err(e) =
                self.store.set_session_liveness(&session_id, &namespace, false, None, false, None)
            {
                warn!(session_id = %session_id, err = %e, "expiry reconcile failed");
            }
            self.publisher
                .publish(&SyncEvent::SessionUpdated {
                    namespace,
                    session_id: session_id.clone(),
                    data: json!({ "active": false, "thinking": false }),
                })
                .await;
            ids.push(session_id);
        }
        ids
    }

    // -- Machine liveness ------------------------------------------------------

    pub async fn handle_machine_alive(&self, machine_id: &str, namespace: &str, time: i64) {
        {
            let mut machines = self.machines.write().await;
            let entry = machines.entry(machine_id.to_owned()).or_insert_with(|| LiveMachine {
                namespace: namespace.to_owned(),
                active: false,
                active_at: 0,
            });
            if time < entry.active_at {
                return;
            }
            entry.active = true;
            entry.active_at = time;
        }

        if let Err(e) = self.store.set_machine_liveness(machine_id, namespace, true, Some(time)) {
            warn!(machine_id = %machine_id, err = %e, "machine liveness reconcile failed");
            return;
        }
        self.broadcast_machine(machine_id, namespace).await;
    }

    pub async fn handle_machine_end(&self, machine_id: &str, namespace: &str, time: i64) {
        {
            let mut machines = self.machines.write().await;
            if let Some(entry) = machines.get_mut(machine_id) {
                entry.active = false;
                entry.active_at = entry.active_at.max(time);
            }
        }
        if let Err(e) = self.store.set_machine_liveness(machine_id, namespace, false, Some(time)) {
            warn!(machine_id = %machine_id, err = %e, "machine end reconcile failed");
        }
        self.broadcast_machine(machine_id, namespace).await;
    }

    pub async fn is_machine_active(&self, machine_id: &str) -> bool {
        self.machines.read().await.get(machine_id).map(|m| m.active).unwrap_or(false)
    }

    async fn broadcast_machine(&self, machine_id: &str, namespace: &str) {
        let record = match self.store.get_machine_by_namespace(machine_id, namespace) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(machine_id = %machine_id, err = %e, "machine read failed");
                return;
            }
        };
        self.publisher
            .publish(&SyncEvent::MachineUpdated {
                namespace: namespace.to_owned(),
                machine: Box::new(record),
            })
            .await;
    }

    /// Expire machines past the keepalive window, in the same sweep cadence
    /// as sessions.
    pub async fn expire_inactive_machines(&self, now: i64) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let mut machines = self.machines.write().await;
            for (id, entry) in machines.iter_mut() {
                if entry.active && now - entry.active_at > self.timeout_ms {
                    entry.active = false;
                    expired.push((id.clone(), entry.namespace.clone()));
                }
            }
        }
        let mut ids = Vec::with_capacity(expired.len());
        for (machine_id, namespace) in expired {
            if let Err(e) = self.store.set_machine_liveness(&machine_id, &namespace, false, None) {
                warn!(machine_id = %machine_id, err = %e, "machine expiry reconcile failed");
            }
            self.broadcast_machine(&machine_id, &namespace).await;
            ids.push(machine_id);
        }
        ids
    }

    /// Run the periodic expiry sweep until shutdown.
    pub fn spawn_expiry(self: &Arc<Self>, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(EXPIRE_SWEEP_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
                let now = Store::now_ms();
                cache.expire_inactive(now).await;
                cache.expire_inactive_machines(now).await;
            }
        });
    }

    /// Await a session reporting alive, polling the mirror. Returns whether
    /// it became active within `timeout`.
    pub async fn wait_for_session_active(&self, session_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_active(session_id).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
