// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded relational store for sessions, machines, messages, and
//! viewer-side records.
//!
//! All durable state lives here. The store owns a single SQLite connection
//! behind a mutex; WAL mode keeps readers cheap and `busy_timeout` bounds
//! writer contention. Mutating calls return structured results so callers can
//! distinguish stale writes from hard errors.

pub mod machines;
pub mod messages;
pub mod sessions;
pub mod users;
pub mod versioned;

use std::fmt;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

/// Current schema version (`PRAGMA user_version`).
pub const SCHEMA_VERSION: i64 = 4;

/// Store-level error.
#[derive(Debug)]
pub enum StoreError {
    /// Row does not exist.
    NotFound,
    /// Row exists but belongs to a different namespace.
    NamespaceMismatch,
    /// The database carries a schema version this build does not understand.
    UnsupportedSchema(i64),
    Sql(rusqlite::Error),
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::NamespaceMismatch => f.write_str("namespace mismatch"),
            Self::UnsupportedSchema(v) => write!(
                f,
                "unsupported schema version {v}: back up the database and migrate offline"
            ),
            Self::Sql(e) => write!(f, "sql error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a version-guarded field write.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedWrite {
    /// The write applied; `version` is the new version.
    Success { version: i64, value: serde_json::Value },
    /// The expected version was stale; `value`/`version` are current.
    Mismatch { version: i64, value: serde_json::Value },
}

/// Embedded store handle. Cheap to share via `Arc`.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let existed = path.exists();
        let conn = Connection::open(path)?;
        if !existed {
            restrict_permissions(path)?;
        }
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        // journal_mode returns the resulting mode as a row; read it rather
        // than batching it ("memory" for in-memory databases).
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        migrate(&conn)?;
        Ok(())
    }

    /// Current epoch millis.
    pub(crate) fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// -- Schema migrations ---------------------------------------------------------

/// Step the schema forward to [`SCHEMA_VERSION`].
///
/// Versions: 0 = empty file (fresh create), 1 = legacy `daemon_state`
/// columns, 2 = renamed columns, 3 = same as 2, 4 = adds
/// `session_sort_preferences`. Anything newer (or otherwise unrecognized)
/// aborts — no guessing against a database written by a different build.
fn migrate(conn: &Connection) -> StoreResult<()> {
    let mut version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version == 0 {
        create_schema(conn)?;
        set_user_version(conn, SCHEMA_VERSION)?;
        return Ok(());
    }

    if version > SCHEMA_VERSION || version < 0 {
        return Err(StoreError::UnsupportedSchema(version));
    }

    while version < SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            2 => {} // v2 → v3 changed nothing durable
            3 => migrate_v3_to_v4(conn)?,
            other => return Err(StoreError::UnsupportedSchema(other)),
        }
        version += 1;
        set_user_version(conn, version)?;
    }

    Ok(())
}

fn set_user_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute(&format!("PRAGMA user_version = {version}"), [])?;
    Ok(())
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            tag TEXT NOT NULL,
            namespace TEXT NOT NULL,
            machine_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            metadata TEXT NOT NULL,
            metadata_version INTEGER NOT NULL DEFAULT 1,
            agent_state TEXT,
            agent_state_version INTEGER NOT NULL DEFAULT 1,
            todos TEXT,
            todos_updated_at INTEGER,
            active INTEGER NOT NULL DEFAULT 0,
            active_at INTEGER,
            thinking INTEGER NOT NULL DEFAULT 0,
            thinking_at INTEGER,
            seq INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_namespace ON sessions(namespace);
        CREATE INDEX IF NOT EXISTS idx_sessions_tag ON sessions(namespace, tag);

        CREATE TABLE IF NOT EXISTS machines (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            metadata TEXT NOT NULL,
            metadata_version INTEGER NOT NULL DEFAULT 1,
            runner_state TEXT,
            runner_state_version INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 0,
            active_at INTEGER,
            seq INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_machines_namespace ON machines(namespace);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            content TEXT NOT NULL,
            local_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (session_id, seq),
            UNIQUE (session_id, local_id)
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS push_subscriptions (
            namespace TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            keys TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, endpoint)
        );

        CREATE TABLE IF NOT EXISTS drafts (
            namespace TEXT NOT NULL,
            session_id TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, session_id)
        );

        CREATE TABLE IF NOT EXISTS session_sort_preferences (
            namespace TEXT NOT NULL,
            user_id TEXT NOT NULL,
            value TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            seq INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (namespace, user_id)
        );
        "#,
    )
}

/// v1 → v2: `machines.daemon_state{,_version}` became
/// `runner_state{,_version}`. Prefer the in-place column rename; fall back to
/// a table copy on engines where the ALTER is rejected.
fn migrate_v1_to_v2(conn: &Connection) -> StoreResult<()> {
    let renamed = conn
        .execute_batch(
            "ALTER TABLE machines RENAME COLUMN daemon_state TO runner_state;
             ALTER TABLE machines RENAME COLUMN daemon_state_version TO runner_state_version;",
        )
        .is_ok();
    if renamed {
        return Ok(());
    }

    conn.execute_batch(
        r#"
        CREATE TABLE machines_v2 (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            metadata TEXT NOT NULL,
            metadata_version INTEGER NOT NULL DEFAULT 1,
            runner_state TEXT,
            runner_state_version INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 0,
            active_at INTEGER,
            seq INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO machines_v2
            SELECT id, namespace, created_at, updated_at, metadata, metadata_version,
                   daemon_state, daemon_state_version, active, active_at, seq
            FROM machines;
        DROP TABLE machines;
        ALTER TABLE machines_v2 RENAME TO machines;
        CREATE INDEX IF NOT EXISTS idx_machines_namespace ON machines(namespace);
        "#,
    )?;
    Ok(())
}

/// v3 → v4: additive `session_sort_preferences` table.
fn migrate_v3_to_v4(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS session_sort_preferences (
            namespace TEXT NOT NULL,
            user_id TEXT NOT NULL,
            value TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            seq INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (namespace, user_id)
        );
        "#,
    )
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
