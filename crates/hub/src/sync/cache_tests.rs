// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::events::{Publisher, SubscribeOptions, SyncEvent, Visibility};
use crate::store::sessions::NewSession;
use crate::store::Store;

use super::{KeepAlive, SessionCache};

const TIMEOUT_MS: i64 = 30_000;

async fn harness() -> anyhow::Result<(
    Arc<SessionCache>,
    Arc<Store>,
    mpsc::Receiver<SyncEvent>,
    String,
)> {
    let store = Arc::new(Store::open_in_memory()?);
    let publisher = Arc::new(Publisher::new());
    let (_sub, rx) = publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;
    let (session, _) = store.get_or_create_session(NewSession {
        tag: Some("live".to_owned()),
        namespace: "default".to_owned(),
        metadata: json!({}),
        ..Default::default()
    })?;
    let cache = Arc::new(SessionCache::new(Arc::clone(&store), publisher, TIMEOUT_MS));
    Ok((cache, store, rx, session.id))
}

fn alive(session_id: &str, time: i64, thinking: Option<bool>) -> KeepAlive {
    KeepAlive {
        session_id: session_id.to_owned(),
        namespace: "default".to_owned(),
        time,
        thinking,
    }
}

#[tokio::test]
async fn keepalive_marks_active_and_broadcasts() -> anyhow::Result<()> {
    let (cache, store, mut rx, sid) = harness().await?;

    cache.handle_session_alive(alive(&sid, 1_000, None)).await;
    assert!(cache.is_active(&sid).await);

    let event = rx.try_recv()?;
    match event {
        SyncEvent::SessionUpdated { session_id, data, .. } => {
            assert_eq!(session_id, sid);
            assert_eq!(data, json!({"active": true}));
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }

    let row = store.get_session(&sid)?.ok_or_else(|| anyhow::anyhow!("gone"))?;
    assert!(row.active);
    assert_eq!(row.active_at, Some(1_000));
    Ok(())
}

#[tokio::test]
async fn stale_keepalive_is_ignored() -> anyhow::Result<()> {
    let (cache, _store, mut rx, sid) = harness().await?;

    cache.handle_session_alive(alive(&sid, 2_000, None)).await;
    let _ = rx.try_recv()?;

    cache.handle_session_alive(alive(&sid, 1_000, Some(true))).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn thinking_change_is_included_in_broadcast() -> anyhow::Result<()> {
    let (cache, _store, mut rx, sid) = harness().await?;

    cache.handle_session_alive(alive(&sid, 1_000, Some(true))).await;
    match rx.try_recv()? {
        SyncEvent::SessionUpdated { data, .. } => {
            assert_eq!(data, json!({"active": true, "thinking": true}));
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }

    // Unchanged thinking flag is not repeated.
    cache.handle_session_alive(alive(&sid, 2_000, Some(true))).await;
    match rx.try_recv()? {
        SyncEvent::SessionUpdated { data, .. } => {
            assert_eq!(data, json!({"active": true}));
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn session_end_clears_both_flags() -> anyhow::Result<()> {
    let (cache, store, mut rx, sid) = harness().await?;
    cache.handle_session_alive(alive(&sid, 1_000, Some(true))).await;
    let _ = rx.try_recv()?;

    cache.handle_session_end(&sid, "default", 2_000).await;
    match rx.try_recv()? {
        SyncEvent::SessionUpdated { data, .. } => {
            assert_eq!(data, json!({"active": false, "thinking": false}));
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }

    let row = store.get_session(&sid)?.ok_or_else(|| anyhow::anyhow!("gone"))?;
    assert!(!row.active);
    assert!(!row.thinking);
    Ok(())
}

#[tokio::test]
async fn expiry_broadcast_always_clears_thinking() -> anyhow::Result<()> {
    let (cache, _store, mut rx, sid) = harness().await?;
    cache.handle_session_alive(alive(&sid, 0, Some(true))).await;
    let _ = rx.try_recv()?;

    // One millisecond inside the window: nothing expires.
    assert!(cache.expire_inactive(TIMEOUT_MS).await.is_empty());
    assert!(rx.try_recv().is_err());

    let expired = cache.expire_inactive(TIMEOUT_MS + 1_000).await;
    assert_eq!(expired, vec![sid.clone()]);
    match rx.try_recv()? {
        SyncEvent::SessionUpdated { session_id, data, .. } => {
            assert_eq!(session_id, sid);
            assert_eq!(data, json!({"active": false, "thinking": false}));
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn wait_for_session_active_observes_late_keepalive() -> anyhow::Result<()> {
    let (cache, _store, _rx, sid) = harness().await?;

    let waiter = {
        let cache = Arc::clone(&cache);
        let sid = sid.clone();
        tokio::spawn(async move {
            cache.wait_for_session_active(&sid, Duration::from_secs(2)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.handle_session_alive(alive(&sid, 1_000, None)).await;

    assert!(waiter.await?);
    Ok(())
}

#[tokio::test]
async fn wait_for_session_active_times_out() -> anyhow::Result<()> {
    let (cache, _store, _rx, sid) = harness().await?;
    assert!(!cache.wait_for_session_active(&sid, Duration::from_millis(150)).await);
    Ok(())
}
