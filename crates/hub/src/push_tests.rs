// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::events::{Publisher, SubscribeOptions, Visibility};
use crate::store::users::PushSubscriptionRecord;
use crate::store::Store;

use super::*;

/// Records deliveries; optionally reports every endpoint as gone.
struct MockProvider {
    sent: Mutex<Vec<String>>,
    gone: bool,
}

impl MockProvider {
    fn new(gone: bool) -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()), gone })
    }
}

impl PushProvider for MockProvider {
    fn deliver<'a>(
        &'a self,
        subscription: &'a PushSubscriptionRecord,
        _payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), PushError>> + Send + 'a>> {
        Box::pin(async move {
            self.sent.lock().push(subscription.endpoint.clone());
            if self.gone {
                Err(PushError::Gone)
            } else {
                Ok(())
            }
        })
    }
}

fn channel(
    provider: Arc<MockProvider>,
) -> anyhow::Result<(PushChannel, Arc<Store>, Arc<Publisher>)> {
    let store = Arc::new(Store::open_in_memory()?);
    let publisher = Arc::new(Publisher::new());
    let channel = PushChannel::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        provider,
        "https://ui.example",
    );
    Ok((channel, store, publisher))
}

#[tokio::test]
async fn visible_toast_suppresses_push() -> anyhow::Result<()> {
    let provider = MockProvider::new(false);
    let (channel, store, publisher) = channel(Arc::clone(&provider))?;
    store.add_push_subscription("default", "https://push/ep", &json!({}))?;

    let (_sub, mut rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;

    let delivered = channel
        .notify("default", "s1", PushIntent::Ready, "Ready", "Session is waiting")
        .await;
    assert_eq!(delivered, 1);
    assert!(provider.sent.lock().is_empty());

    // The toast carried the deep link.
    match rx.try_recv()? {
        crate::events::SyncEvent::Toast { data, .. } => {
            let url = data
                .data
                .as_ref()
                .and_then(|d| d.get("url"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            assert_eq!(url, "https://ui.example/sessions/s1");
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn zero_visible_deliveries_falls_back_to_push() -> anyhow::Result<()> {
    let provider = MockProvider::new(false);
    let (channel, store, _publisher) = channel(Arc::clone(&provider))?;
    store.add_push_subscription("default", "https://push/ep", &json!({}))?;

    let delivered = channel
        .notify(
            "default",
            "s1",
            PushIntent::PermissionRequest,
            "Permission",
            "Agent wants to run a command",
        )
        .await;
    assert_eq!(delivered, 0);
    assert_eq!(provider.sent.lock().as_slice(), ["https://push/ep"]);
    Ok(())
}

#[tokio::test]
async fn no_subscriptions_means_no_provider_call() -> anyhow::Result<()> {
    let provider = MockProvider::new(false);
    let (channel, _store, _publisher) = channel(Arc::clone(&provider))?;

    channel
        .notify("default", "s1", PushIntent::Ready, "Ready", "waiting")
        .await;
    assert!(provider.sent.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn gone_endpoint_is_removed() -> anyhow::Result<()> {
    let provider = MockProvider::new(true);
    let (channel, store, _publisher) = channel(Arc::clone(&provider))?;
    store.add_push_subscription("default", "https://push/dead", &json!({}))?;

    channel
        .notify("default", "s1", PushIntent::Ready, "Ready", "waiting")
        .await;
    assert!(store.list_push_subscriptions("default")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn hidden_subscription_does_not_suppress_push() -> anyhow::Result<()> {
    let provider = MockProvider::new(false);
    let (channel, store, publisher) = channel(Arc::clone(&provider))?;
    store.add_push_subscription("default", "https://push/ep", &json!({}))?;

    let (_sub, _rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Hidden,
        })
        .await;

    let delivered = channel
        .notify("default", "s1", PushIntent::Ready, "Ready", "waiting")
        .await;
    assert_eq!(delivered, 0);
    assert_eq!(provider.sent.lock().len(), 1);
    Ok(())
}
