// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::super::{Store, VersionedWrite};

#[test]
fn push_subscription_is_unique_per_endpoint() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    store.add_push_subscription("default", "https://push/ep1", &json!({"auth": "a"}))?;
    store.add_push_subscription("default", "https://push/ep1", &json!({"auth": "b"}))?;
    store.add_push_subscription("default", "https://push/ep2", &json!({"auth": "c"}))?;

    let subs = store.list_push_subscriptions("default")?;
    assert_eq!(subs.len(), 2);
    let ep1 = subs
        .iter()
        .find(|s| s.endpoint == "https://push/ep1")
        .ok_or_else(|| anyhow::anyhow!("ep1 missing"))?;
    assert_eq!(ep1.keys, json!({"auth": "b"}));

    assert!(store.remove_push_subscription("default", "https://push/ep1")?);
    assert!(!store.remove_push_subscription("default", "https://push/ep1")?);
    Ok(())
}

#[test]
fn push_subscriptions_are_namespace_scoped() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    store.add_push_subscription("alpha", "https://push/ep", &json!({}))?;
    assert!(store.list_push_subscriptions("beta")?.is_empty());
    Ok(())
}

#[test]
fn sort_preference_absent_row_reads_version_zero() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    let (value, version) = store.get_sort_preference("default", "u1")?;
    assert_eq!(value, serde_json::Value::Null);
    assert_eq!(version, 0);
    Ok(())
}

#[test]
fn sort_preference_cas_from_absent() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;

    let first = store.update_sort_preference("default", "u1", &json!(["a", "b"]), 0)?;
    assert!(matches!(first, VersionedWrite::Success { version: 1, .. }));

    // A racer that also expected the absent row loses uniformly.
    let second = store.update_sort_preference("default", "u1", &json!(["b", "a"]), 0)?;
    match second {
        VersionedWrite::Mismatch { version, value } => {
            assert_eq!(version, 1);
            assert_eq!(value, json!(["a", "b"]));
        }
        other => anyhow::bail!("expected mismatch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn draft_lww_keeps_newest() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    assert!(store.set_draft("default", "s1", "first", 100)?);
    // Older write is dropped.
    assert!(!store.set_draft("default", "s1", "stale", 50)?);
    // Equal timestamp is accepted (last writer wins within the tick).
    assert!(store.set_draft("default", "s1", "retick", 100)?);

    let (content, updated_at) = store
        .get_draft("default", "s1")?
        .ok_or_else(|| anyhow::anyhow!("draft missing"))?;
    assert_eq!(content, "retick");
    assert_eq!(updated_at, 100);
    Ok(())
}

#[test]
fn users_are_scoped_to_namespace() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    let user = store.create_user("alpha")?;
    assert!(store.get_user(&user.id, "alpha")?.is_some());
    assert!(store.get_user(&user.id, "beta")?.is_none());
    Ok(())
}
