// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flat viewer-side records: users, push subscriptions, sort preferences,
//! drafts.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Store, StoreError, StoreResult, VersionedWrite};

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub namespace: String,
    pub created_at: i64,
}

/// A web-push subscription. `(namespace, endpoint)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscriptionRecord {
    pub namespace: String,
    pub endpoint: String,
    pub keys: serde_json::Value,
    pub created_at: i64,
}

impl Store {
    pub fn create_user(&self, namespace: &str) -> StoreResult<UserRecord> {
        let conn = self.conn.lock();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Self::now_ms();
        conn.execute(
            "INSERT INTO users (id, namespace, created_at) VALUES (?1, ?2, ?3)",
            params![id, namespace, now],
        )
        .map_err(StoreError::Sql)?;
        Ok(UserRecord { id, namespace: namespace.to_owned(), created_at: now })
    }

    pub fn get_user(&self, id: &str, namespace: &str) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, namespace, created_at FROM users WHERE id = ?1 AND namespace = ?2",
                params![id, namespace],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        namespace: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::Sql)?;
        Ok(row)
    }

    // -- Push subscriptions ----------------------------------------------------

    /// Upsert a push subscription keyed by `(namespace, endpoint)`.
    pub fn add_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
        keys: &serde_json::Value,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        let raw = serde_json::to_string(keys).unwrap_or_else(|_| "null".to_owned());
        conn.execute(
            "INSERT INTO push_subscriptions (namespace, endpoint, keys, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (namespace, endpoint) DO UPDATE SET keys = excluded.keys",
            params![namespace, endpoint, raw, Self::now_ms()],
        )
        .map_err(StoreError::Sql)?;
        Ok(())
    }

    pub fn remove_push_subscription(&self, namespace: &str, endpoint: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "DELETE FROM push_subscriptions WHERE namespace = ?1 AND endpoint = ?2",
                params![namespace, endpoint],
            )
            .map_err(StoreError::Sql)?;
        Ok(changed == 1)
    }

    pub fn list_push_subscriptions(
        &self,
        namespace: &str,
    ) -> StoreResult<Vec<PushSubscriptionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT namespace, endpoint, keys, created_at
                 FROM push_subscriptions WHERE namespace = ?1 ORDER BY created_at",
            )
            .map_err(StoreError::Sql)?;
        let rows = stmt
            .query_map(params![namespace], |row| {
                let keys: String = row.get(2)?;
                Ok(PushSubscriptionRecord {
                    namespace: row.get(0)?,
                    endpoint: row.get(1)?,
                    keys: serde_json::from_str(&keys).unwrap_or(serde_json::Value::Null),
                    created_at: row.get(3)?,
                })
            })
            .map_err(StoreError::Sql)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sql)?;
        Ok(rows)
    }

    // -- Sort preferences ------------------------------------------------------

    /// Read the stored sort preference. Absent rows read as version 0.
    pub fn get_sort_preference(
        &self,
        namespace: &str,
        user_id: &str,
    ) -> StoreResult<(serde_json::Value, i64)> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, version FROM session_sort_preferences
                 WHERE namespace = ?1 AND user_id = ?2",
                params![namespace, user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::Sql)?;
        Ok(match row {
            Some((raw, version)) => {
                (serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null), version)
            }
            None => (serde_json::Value::Null, 0),
        })
    }

    /// CAS update of the sort preference. The read and write share one
    /// transaction so racing writers on an absent row resolve the same way
    /// as racing writers on a present one: exactly one succeeds, the other
    /// observes a mismatch.
    pub fn update_sort_preference(
        &self,
        namespace: &str,
        user_id: &str,
        value: &serde_json::Value,
        expected_version: i64,
    ) -> StoreResult<VersionedWrite> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;

        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT value, version FROM session_sort_preferences
                 WHERE namespace = ?1 AND user_id = ?2",
                params![namespace, user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::Sql)?;

        let raw = serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned());
        let result = match current {
            None if expected_version == 0 => {
                tx.execute(
                    "INSERT INTO session_sort_preferences (namespace, user_id, value, version, seq)
                     VALUES (?1, ?2, ?3, 1, 1)",
                    params![namespace, user_id, raw],
                )
                .map_err(StoreError::Sql)?;
                VersionedWrite::Success { version: 1, value: value.clone() }
            }
            None => VersionedWrite::Mismatch { version: 0, value: serde_json::Value::Null },
            Some((_, version)) if version == expected_version => {
                tx.execute(
                    "UPDATE session_sort_preferences
                     SET value = ?1, version = version + 1, seq = seq + 1
                     WHERE namespace = ?2 AND user_id = ?3 AND version = ?4",
                    params![raw, namespace, user_id, expected_version],
                )
                .map_err(StoreError::Sql)?;
                VersionedWrite::Success { version: version + 1, value: value.clone() }
            }
            Some((current_raw, version)) => VersionedWrite::Mismatch {
                version,
                value: serde_json::from_str(&current_raw).unwrap_or(serde_json::Value::Null),
            },
        };
        tx.commit().map_err(StoreError::Sql)?;
        Ok(result)
    }

    // -- Drafts ----------------------------------------------------------------

    /// Last-write-wins draft persistence. A write with an older timestamp
    /// than the stored row is dropped.
    pub fn set_draft(
        &self,
        namespace: &str,
        session_id: &str,
        content: &str,
        updated_at: i64,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "INSERT INTO drafts (namespace, session_id, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (namespace, session_id) DO UPDATE
                 SET content = excluded.content, updated_at = excluded.updated_at
                 WHERE excluded.updated_at >= drafts.updated_at",
                params![namespace, session_id, content, updated_at],
            )
            .map_err(StoreError::Sql)?;
        Ok(changed == 1)
    }

    pub fn get_draft(
        &self,
        namespace: &str,
        session_id: &str,
    ) -> StoreResult<Option<(String, i64)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT content, updated_at FROM drafts
                 WHERE namespace = ?1 AND session_id = ?2",
                params![namespace, session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::Sql)?;
        Ok(row)
    }
}

#[cfg(test)]
#[path = "users_tests.rs"]
mod tests;
