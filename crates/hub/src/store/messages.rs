// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only message log, paged by dense per-session sequence numbers.
//!
//! `local_id` is the client-side idempotency key: the second insert with the
//! same key returns the original row untouched. The merge operation moves a
//! whole session's log into another, renumbering to continue after the
//! target's current maximum.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Store, StoreError, StoreResult};

/// Hard cap on a single history page.
pub const MAX_MESSAGE_PAGE: usize = 200;

/// A durable message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub created_at: i64,
}

/// Result of [`Store::merge_session_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Rows moved from the source session.
    pub moved: usize,
    /// Target's max `seq` before the merge (the renumber offset).
    pub old_max_seq: i64,
    /// Source's max `seq` before the merge.
    pub new_max_seq: i64,
}

const MESSAGE_COLUMNS: &str = "id, session_id, seq, content, local_id, created_at";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let content: String = row.get(3)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        local_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn max_seq(conn: &Connection, session_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )
}

impl Store {
    /// Append a message. When `local_id` is already bound in the session the
    /// existing row is returned untouched (second element is `false`).
    pub fn add_message(
        &self,
        session_id: &str,
        content: &serde_json::Value,
        local_id: Option<&str>,
    ) -> StoreResult<(MessageRecord, bool)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;

        if let Some(local_id) = local_id {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND local_id = ?2"
            );
            let existing = tx
                .query_row(&sql, params![session_id, local_id], row_to_message)
                .optional()
                .map_err(StoreError::Sql)?;
            if let Some(message) = existing {
                tx.commit().map_err(StoreError::Sql)?;
                return Ok((message, false));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let seq = max_seq(&tx, session_id).map_err(StoreError::Sql)? + 1;
        let raw = serde_json::to_string(content).unwrap_or_else(|_| "null".to_owned());
        tx.execute(
            "INSERT INTO messages (id, session_id, seq, content, local_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, session_id, seq, raw, local_id, Self::now_ms()],
        )
        .map_err(StoreError::Sql)?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let inserted = tx
            .query_row(&sql, params![id], row_to_message)
            .map_err(StoreError::Sql)?;
        tx.commit().map_err(StoreError::Sql)?;
        Ok((inserted, true))
    }

    /// Page history ascending by `seq`. `before_seq` selects the page that
    /// ends just below it; `limit` is clamped to `[1, 200]`.
    pub fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        before_seq: Option<i64>,
    ) -> StoreResult<Vec<MessageRecord>> {
        let limit = limit.clamp(1, MAX_MESSAGE_PAGE);
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = ?1 AND (?2 IS NULL OR seq < ?2)
             ORDER BY seq DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql).map_err(StoreError::Sql)?;
        let mut rows = stmt
            .query_map(params![session_id, before_seq, limit as i64], row_to_message)
            .map_err(StoreError::Sql)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sql)?;
        rows.reverse();
        Ok(rows)
    }

    /// Move every message from `from` into `to`, atomically.
    ///
    /// Colliding `local_id`s on the source side are nulled (the target keeps
    /// its bindings); moved rows are renumbered to continue after the
    /// target's current maximum.
    pub fn merge_session_messages(&self, from: &str, to: &str) -> StoreResult<MergeOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;

        tx.execute(
            "UPDATE messages SET local_id = NULL
             WHERE session_id = ?1 AND local_id IN (
                 SELECT local_id FROM messages
                 WHERE session_id = ?2 AND local_id IS NOT NULL
             )",
            params![from, to],
        )
        .map_err(StoreError::Sql)?;

        let offset = max_seq(&tx, to).map_err(StoreError::Sql)?;
        let source_max = max_seq(&tx, from).map_err(StoreError::Sql)?;
        let moved = tx
            .execute(
                "UPDATE messages SET session_id = ?1, seq = seq + ?2 WHERE session_id = ?3",
                params![to, offset, from],
            )
            .map_err(StoreError::Sql)?;

        tx.commit().map_err(StoreError::Sql)?;
        Ok(MergeOutcome { moved, old_max_seq: offset, new_max_seq: source_max })
    }
}

#[cfg(test)]
#[path = "messages_tests.rs"]
mod tests;
