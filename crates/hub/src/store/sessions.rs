// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session rows: creation, versioned field updates, liveness columns,
//! timestamp-guarded todos, deletion.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::versioned::{self, SESSION_AGENT_STATE, SESSION_METADATA};
use super::{Store, StoreError, StoreResult, VersionedWrite};

/// A durable session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub tag: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: serde_json::Value,
    pub metadata_version: i64,
    pub agent_state: serde_json::Value,
    pub agent_state_version: i64,
    pub todos: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos_updated_at: Option<i64>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_at: Option<i64>,
    pub thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_at: Option<i64>,
    pub seq: i64,
}

/// Arguments for [`Store::get_or_create_session`].
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Strict lookup: when set, the session must already exist.
    pub id: Option<String>,
    /// Claim key: reuse the row carrying this tag in the namespace, or
    /// create it. New sessions with no tag use their UUID as the tag.
    pub tag: Option<String>,
    pub namespace: String,
    pub machine_id: Option<String>,
    pub metadata: serde_json::Value,
    pub agent_state: Option<serde_json::Value>,
}

const SESSION_COLUMNS: &str = "id, tag, namespace, machine_id, created_at, updated_at, \
     metadata, metadata_version, agent_state, agent_state_version, \
     todos, todos_updated_at, active, active_at, thinking, thinking_at, seq";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let metadata: String = row.get(6)?;
    let agent_state: Option<String> = row.get(8)?;
    let todos: Option<String> = row.get(10)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        tag: row.get(1)?,
        namespace: row.get(2)?,
        machine_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        metadata_version: row.get(7)?,
        agent_state: agent_state
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null),
        agent_state_version: row.get(9)?,
        todos: todos
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null),
        todos_updated_at: row.get(11)?,
        active: row.get::<_, i64>(12)? != 0,
        active_at: row.get(13)?,
        thinking: row.get::<_, i64>(14)? != 0,
        thinking_at: row.get(15)?,
        seq: row.get(16)?,
    })
}

fn select_session(conn: &Connection, id: &str) -> StoreResult<Option<SessionRecord>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_session).optional()?)
}

impl Store {
    /// Look up or create a session.
    ///
    /// With an explicit `id` the session must already exist (and match the
    /// namespace). A `tag` claims the existing row carrying it, creating the
    /// session on first observation.
    pub fn get_or_create_session(&self, new: NewSession) -> StoreResult<(SessionRecord, bool)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;
        let now = Self::now_ms();

        if let Some(ref id) = new.id {
            let existing = select_session(&tx, id)?;
            return match existing {
                Some(s) if s.namespace == new.namespace => {
                    tx.commit().map_err(StoreError::Sql)?;
                    Ok((s, false))
                }
                Some(_) => Err(StoreError::NamespaceMismatch),
                None => Err(StoreError::NotFound),
            };
        }

        if let Some(ref tag) = new.tag {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE namespace = ?1 AND tag = ?2"
            );
            let existing = tx
                .query_row(&sql, params![new.namespace, tag], row_to_session)
                .optional()
                .map_err(StoreError::Sql)?;
            if let Some(s) = existing {
                tx.commit().map_err(StoreError::Sql)?;
                return Ok((s, false));
            }
            // Runners claim sessions by their own UUID; that claim is also
            // a lookup by id.
            if uuid::Uuid::parse_str(tag).is_ok() {
                if let Some(s) = select_session(&tx, tag)? {
                    if s.namespace != new.namespace {
                        return Err(StoreError::NamespaceMismatch);
                    }
                    tx.commit().map_err(StoreError::Sql)?;
                    return Ok((s, false));
                }
            }
        }

        // New sessions claimed by a UUID tag keep it as their id; the tag
        // equals the id in every new session.
        let id = match new.tag.as_deref() {
            Some(tag) if uuid::Uuid::parse_str(tag).is_ok() => tag.to_owned(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let tag = new.tag.clone().unwrap_or_else(|| id.clone());
        let metadata = serde_json::to_string(&new.metadata).unwrap_or_else(|_| "null".to_owned());
        let agent_state = new
            .agent_state
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_owned()));
        tx.execute(
            "INSERT INTO sessions (id, tag, namespace, machine_id, created_at, updated_at,
                                   metadata, agent_state, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, 1)",
            params![id, tag, new.namespace, new.machine_id, now, metadata, agent_state],
        )
        .map_err(StoreError::Sql)?;
        let created = select_session(&tx, &id)?.ok_or(StoreError::NotFound)?;
        tx.commit().map_err(StoreError::Sql)?;
        Ok((created, true))
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        select_session(&conn, id)
    }

    /// Namespace-scoped read: a row under a different namespace is invisible.
    pub fn get_session_by_namespace(
        &self,
        id: &str,
        namespace: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        Ok(select_session(&conn, id)?.filter(|s| s.namespace == namespace))
    }

    pub fn list_sessions(&self, namespace: &str) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE namespace = ?1 ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql).map_err(StoreError::Sql)?;
        let rows = stmt
            .query_map(params![namespace], row_to_session)
            .map_err(StoreError::Sql)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sql)?;
        Ok(rows)
    }

    pub fn update_session_metadata(
        &self,
        id: &str,
        value: &serde_json::Value,
        expected_version: i64,
        namespace: &str,
        touch_updated_at: bool,
    ) -> StoreResult<VersionedWrite> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;
        let result = versioned::update_versioned_field(
            &tx,
            SESSION_METADATA,
            id,
            namespace,
            value,
            expected_version,
            touch_updated_at,
            Self::now_ms(),
        )?;
        tx.commit().map_err(StoreError::Sql)?;
        Ok(result)
    }

    pub fn update_session_agent_state(
        &self,
        id: &str,
        value: &serde_json::Value,
        expected_version: i64,
        namespace: &str,
        touch_updated_at: bool,
    ) -> StoreResult<VersionedWrite> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;
        let result = versioned::update_versioned_field(
            &tx,
            SESSION_AGENT_STATE,
            id,
            namespace,
            value,
            expected_version,
            touch_updated_at,
            Self::now_ms(),
        )?;
        tx.commit().map_err(StoreError::Sql)?;
        Ok(result)
    }

    /// Timestamp-guarded todos write. Applies iff the stored timestamp is
    /// null or strictly older than `todos_updated_at`; returns whether the
    /// write happened. `updated_at` never moves backwards.
    pub fn set_session_todos(
        &self,
        id: &str,
        todos: &serde_json::Value,
        todos_updated_at: i64,
        namespace: &str,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let row_namespace: Option<String> = conn
            .query_row("SELECT namespace FROM sessions WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StoreError::Sql)?;
        match row_namespace {
            None => return Err(StoreError::NotFound),
            Some(ns) if ns != namespace => return Err(StoreError::NamespaceMismatch),
            Some(_) => {}
        }

        let raw = serde_json::to_string(todos).unwrap_or_else(|_| "null".to_owned());
        let changed = conn
            .execute(
                "UPDATE sessions
                 SET todos = ?1, todos_updated_at = ?2, seq = seq + 1,
                     updated_at = MAX(updated_at, ?3)
                 WHERE id = ?4 AND namespace = ?5
                   AND (todos_updated_at IS NULL OR todos_updated_at < ?2)",
                params![raw, todos_updated_at, Self::now_ms(), id, namespace],
            )
            .map_err(StoreError::Sql)?;
        Ok(changed == 1)
    }

    /// Reconcile liveness columns from the in-memory cache. Bumps `seq`.
    pub fn set_session_liveness(
        &self,
        id: &str,
        namespace: &str,
        active: bool,
        active_at: Option<i64>,
        thinking: bool,
        thinking_at: Option<i64>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE sessions
                 SET active = ?1, active_at = COALESCE(?2, active_at),
                     thinking = ?3, thinking_at = COALESCE(?4, thinking_at),
                     seq = seq + 1, updated_at = MAX(updated_at, ?5)
                 WHERE id = ?6 AND namespace = ?7",
                params![
                    active as i64,
                    active_at,
                    thinking as i64,
                    thinking_at,
                    Self::now_ms(),
                    id,
                    namespace
                ],
            )
            .map_err(StoreError::Sql)?;
        Ok(changed == 1)
    }

    /// Delete a session. Messages cascade via FK; drafts are swept in the
    /// same transaction.
    pub fn delete_session(&self, id: &str, namespace: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;
        tx.execute(
            "DELETE FROM drafts WHERE namespace = ?1 AND session_id = ?2",
            params![namespace, id],
        )
        .map_err(StoreError::Sql)?;
        let changed = tx
            .execute(
                "DELETE FROM sessions WHERE id = ?1 AND namespace = ?2",
                params![id, namespace],
            )
            .map_err(StoreError::Sql)?;
        tx.commit().map_err(StoreError::Sql)?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;
