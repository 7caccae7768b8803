// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn toast(title: &str) -> ToastPayload {
    ToastPayload { title: title.to_owned(), body: "body".to_owned(), tag: None, data: None }
}

fn updated(namespace: &str, session_id: &str) -> SyncEvent {
    SyncEvent::SessionUpdated {
        namespace: namespace.to_owned(),
        session_id: session_id.to_owned(),
        data: serde_json::json!({"active": true}),
    }
}

#[tokio::test]
async fn namespace_filter_gates_delivery() {
    let publisher = Publisher::new();
    let (_id, mut alpha_rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "alpha".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;

    assert_eq!(publisher.publish(&updated("alpha", "s1")).await, 1);
    assert_eq!(publisher.publish(&updated("beta", "s1")).await, 0);

    let event = alpha_rx.recv().await;
    assert!(matches!(event, Some(SyncEvent::SessionUpdated { .. })));
    assert!(alpha_rx.try_recv().is_err());
}

#[tokio::test]
async fn session_filter_matches_only_target() {
    let publisher = Publisher::new();
    let (_id, mut rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: false,
            session_id: Some("s1".to_owned()),
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;

    assert_eq!(publisher.publish(&updated("default", "s1")).await, 1);
    assert_eq!(publisher.publish(&updated("default", "s2")).await, 0);
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn toast_counts_only_visible_subscriptions() {
    let publisher = Publisher::new();
    let (_hidden, mut hidden_rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Hidden,
        })
        .await;

    // Hidden subscriptions still receive the event, but don't count.
    assert_eq!(publisher.send_toast("default", None, toast("t")).await, 0);
    assert!(matches!(hidden_rx.recv().await, Some(SyncEvent::Toast { .. })));

    let (visible_id, _visible_rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;
    assert_eq!(publisher.send_toast("default", None, toast("t")).await, 1);

    // Flipping visibility changes the count.
    assert!(publisher.set_visibility(&visible_id, Visibility::Hidden).await);
    assert_eq!(publisher.send_toast("default", None, toast("t")).await, 0);
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let publisher = Publisher::new();
    let (id, _rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;

    assert!(publisher.unsubscribe(&id).await);
    assert!(!publisher.unsubscribe(&id).await);
    assert_eq!(publisher.subscription_count().await, 0);
}

#[tokio::test]
async fn dropped_receiver_is_pruned_on_next_publish() {
    let publisher = Publisher::new();
    let (_id, rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;
    drop(rx);

    assert_eq!(publisher.publish(&updated("default", "s1")).await, 0);
    assert_eq!(publisher.subscription_count().await, 0);
}

#[tokio::test]
async fn heartbeat_reaches_every_subscription() {
    let publisher = Publisher::new();
    let (_a, mut rx_a) = publisher
        .subscribe(SubscribeOptions {
            namespace: "alpha".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;
    let (_b, mut rx_b) = publisher
        .subscribe(SubscribeOptions {
            namespace: "beta".to_owned(),
            all: false,
            session_id: Some("s".to_owned()),
            machine_id: None,
            visibility: Visibility::Hidden,
        })
        .await;

    assert_eq!(publisher.publish(&SyncEvent::Heartbeat).await, 2);
    assert!(matches!(rx_a.recv().await, Some(SyncEvent::Heartbeat)));
    assert!(matches!(rx_b.recv().await, Some(SyncEvent::Heartbeat)));
}
