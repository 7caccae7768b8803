// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use rusqlite::Connection;

use super::*;

#[test]
fn fresh_database_lands_on_current_version() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    let conn = store.conn.lock();
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    assert_eq!(version, SCHEMA_VERSION);
    Ok(())
}

#[test]
fn foreign_keys_enabled() -> anyhow::Result<()> {
    let store = Store::open_in_memory()?;
    let conn = store.conn.lock();
    let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    assert_eq!(fk, 1);
    Ok(())
}

#[test]
fn open_creates_file_with_owner_only_permissions() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("hub.db");
    let _store = Store::open(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
    Ok(())
}

#[test]
fn future_schema_version_is_refused() -> anyhow::Result<()> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA user_version = 99", [])?;
    let err = migrate(&conn).err().ok_or_else(|| anyhow::anyhow!("migrate accepted v99"))?;
    match err {
        StoreError::UnsupportedSchema(99) => {}
        other => anyhow::bail!("wrong error: {other}"),
    }
    Ok(())
}

#[test]
fn v1_daemon_columns_are_renamed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("legacy.db");
    {
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE machines (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                metadata_version INTEGER NOT NULL DEFAULT 1,
                daemon_state TEXT,
                daemon_state_version INTEGER NOT NULL DEFAULT 1,
                active INTEGER NOT NULL DEFAULT 0,
                active_at INTEGER,
                seq INTEGER NOT NULL DEFAULT 0
            );
            INSERT INTO machines (id, namespace, created_at, updated_at, metadata, daemon_state)
            VALUES ('m1', 'default', 1, 1, '{}', '{"pid":42}');
            CREATE TABLE sessions (id TEXT PRIMARY KEY, tag TEXT NOT NULL,
                namespace TEXT NOT NULL, machine_id TEXT, created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL, metadata TEXT NOT NULL,
                metadata_version INTEGER NOT NULL DEFAULT 1, agent_state TEXT,
                agent_state_version INTEGER NOT NULL DEFAULT 1, todos TEXT,
                todos_updated_at INTEGER, active INTEGER NOT NULL DEFAULT 0,
                active_at INTEGER, thinking INTEGER NOT NULL DEFAULT 0,
                thinking_at INTEGER, seq INTEGER NOT NULL DEFAULT 0);
            CREATE TABLE messages (id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL, content TEXT NOT NULL, local_id TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE (session_id, seq), UNIQUE (session_id, local_id));
            CREATE TABLE users (id TEXT PRIMARY KEY, namespace TEXT NOT NULL,
                created_at INTEGER NOT NULL);
            CREATE TABLE push_subscriptions (namespace TEXT NOT NULL, endpoint TEXT NOT NULL,
                keys TEXT NOT NULL, created_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, endpoint));
            CREATE TABLE drafts (namespace TEXT NOT NULL, session_id TEXT NOT NULL,
                content TEXT NOT NULL, updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, session_id));
            PRAGMA user_version = 1;
            "#,
        )?;
    }

    let store = Store::open(&path)?;
    let machine = store.get_machine("m1")?.ok_or_else(|| anyhow::anyhow!("machine lost"))?;
    assert_eq!(machine.runner_state, serde_json::json!({"pid": 42}));

    let conn = store.conn.lock();
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    assert_eq!(version, SCHEMA_VERSION);
    // v3→v4 ran too: the sort preference table exists.
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'session_sort_preferences'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(count, 1);
    Ok(())
}
