// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Push notification channel.
//!
//! Toast intents are delivered locally first via the subscription router;
//! only when no visible subscription received the toast does the channel
//! fall back to the web-push provider. Subscriptions the provider reports
//! gone (404/410) are removed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::events::{Publisher, ToastPayload};
use crate::store::users::PushSubscriptionRecord;
use crate::store::Store;

/// Why the user is being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushIntent {
    /// The agent finished a turn and is waiting.
    Ready,
    /// The agent asked for permission.
    PermissionRequest,
}

impl PushIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::PermissionRequest => "permission-request",
        }
    }
}

/// Provider-side delivery failure.
#[derive(Debug)]
pub enum PushError {
    /// The endpoint no longer exists; the subscription should be dropped.
    Gone,
    Failed(String),
}

/// A web-push delivery backend.
pub trait PushProvider: Send + Sync {
    fn deliver<'a>(
        &'a self,
        subscription: &'a PushSubscriptionRecord,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), PushError>> + Send + 'a>>;
}

/// Default provider: posts the payload to the subscription endpoint.
pub struct WebPushProvider {
    client: reqwest::Client,
}

impl WebPushProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebPushProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PushProvider for WebPushProvider {
    fn deliver<'a>(
        &'a self,
        subscription: &'a PushSubscriptionRecord,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), PushError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&subscription.endpoint)
                .json(payload)
                .send()
                .await
                .map_err(|e| PushError::Failed(e.to_string()))?;
            match response.status().as_u16() {
                404 | 410 => Err(PushError::Gone),
                status if response.status().is_success() => {
                    debug!(endpoint = %subscription.endpoint, status, "push delivered");
                    Ok(())
                }
                status => Err(PushError::Failed(format!("push endpoint returned {status}"))),
            }
        })
    }
}

/// The channel: local toast first, remote push as fallback.
pub struct PushChannel {
    store: Arc<Store>,
    publisher: Arc<Publisher>,
    provider: Arc<dyn PushProvider>,
    web_origin: String,
}

impl PushChannel {
    pub fn new(
        store: Arc<Store>,
        publisher: Arc<Publisher>,
        provider: Arc<dyn PushProvider>,
        web_origin: impl Into<String>,
    ) -> Self {
        Self { store, publisher, provider, web_origin: web_origin.into() }
    }

    /// Deep link into the web UI for a session.
    fn session_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{session_id}", self.web_origin.trim_end_matches('/'))
    }

    /// Notify about a session. Returns the number of visible local
    /// deliveries (zero means the push provider was consulted).
    pub async fn notify(
        &self,
        namespace: &str,
        session_id: &str,
        intent: PushIntent,
        title: &str,
        body: &str,
    ) -> usize {
        let data = json!({
            "type": intent.as_str(),
            "sessionId": session_id,
            "url": self.session_url(session_id),
        });
        let payload = ToastPayload {
            title: title.to_owned(),
            body: body.to_owned(),
            tag: Some(session_id.to_owned()),
            data: Some(data.clone()),
        };

        let delivered = self
            .publisher
            .send_toast(namespace, Some(session_id), payload)
            .await;
        if delivered > 0 {
            return delivered;
        }

        let subscriptions = match self.store.list_push_subscriptions(namespace) {
            Ok(subs) => subs,
            Err(e) => {
                warn!(namespace = %namespace, err = %e, "push subscription read failed");
                return 0;
            }
        };
        if subscriptions.is_empty() {
            return 0;
        }

        let push_payload = json!({
            "title": title,
            "body": body,
            "tag": session_id,
            "data": data,
        });
        for subscription in &subscriptions {
            match self.provider.deliver(subscription, &push_payload).await {
                Ok(()) => {}
                Err(PushError::Gone) => {
                    debug!(endpoint = %subscription.endpoint, "push endpoint gone, removing");
                    let _ = self
                        .store
                        .remove_push_subscription(namespace, &subscription.endpoint);
                }
                Err(PushError::Failed(message)) => {
                    warn!(endpoint = %subscription.endpoint, err = %message, "push delivery failed");
                }
            }
        }
        0
    }
}

#[cfg(test)]
#[path = "push_tests.rs"]
mod tests;
