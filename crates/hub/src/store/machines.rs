// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Machine rows. Same shape as sessions with `runner_state` in place of
//! `agent_state` and no todos. Machine ids are client-supplied and stable;
//! reusing an id under a different namespace is an error.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::versioned::{self, MACHINE_METADATA, MACHINE_RUNNER_STATE};
use super::{Store, StoreError, StoreResult, VersionedWrite};

/// A durable machine row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub id: String,
    pub namespace: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: serde_json::Value,
    pub metadata_version: i64,
    pub runner_state: serde_json::Value,
    pub runner_state_version: i64,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_at: Option<i64>,
    pub seq: i64,
}

const MACHINE_COLUMNS: &str = "id, namespace, created_at, updated_at, metadata, \
     metadata_version, runner_state, runner_state_version, active, active_at, seq";

fn row_to_machine(row: &Row<'_>) -> rusqlite::Result<MachineRecord> {
    let metadata: String = row.get(4)?;
    let runner_state: Option<String> = row.get(6)?;
    Ok(MachineRecord {
        id: row.get(0)?,
        namespace: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        metadata_version: row.get(5)?,
        runner_state: runner_state
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null),
        runner_state_version: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
        active_at: row.get(9)?,
        seq: row.get(10)?,
    })
}

fn select_machine(conn: &Connection, id: &str) -> StoreResult<Option<MachineRecord>> {
    let sql = format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_machine).optional()?)
}

impl Store {
    /// Look up or create a machine by its client-supplied id.
    pub fn get_or_create_machine(
        &self,
        id: &str,
        metadata: &serde_json::Value,
        runner_state: Option<&serde_json::Value>,
        namespace: &str,
    ) -> StoreResult<(MachineRecord, bool)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::Sql)?;
        let now = Self::now_ms();

        match select_machine(&tx, id)? {
            Some(m) if m.namespace == namespace => {
                tx.commit().map_err(StoreError::Sql)?;
                return Ok((m, false));
            }
            Some(_) => return Err(StoreError::NamespaceMismatch),
            None => {}
        }

        let metadata_raw = serde_json::to_string(metadata).unwrap_or_else(|_| "null".to_owned());
        let runner_state_raw = runner_state
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_owned()));
        tx.execute(
            "INSERT INTO machines (id, namespace, created_at, updated_at, metadata,
                                   runner_state, seq)
             VALUES (?1, ?2, ?3, ?3, ?4, ?5, 1)",
            params![id, namespace, now, metadata_raw, runner_state_raw],
        )
        .map_err(StoreError::Sql)?;
        let created = select_machine(&tx, id)?.ok_or(StoreError::NotFound)?;
        tx.commit().map_err(StoreError::Sql)?;
        Ok((created, true))
    }

    pub fn get_machine(&self, id: &str) -> StoreResult<Option<MachineRecord>> {
        let conn = self.conn.lock();
        select_machine(&conn, id)
    }

    pub fn get_machine_by_namespace(
        &self,
        id: &str,
        namespace: &str,
    ) -> StoreResult<Option<MachineRecord>> {
        let conn = self.conn.lock();
        Ok(select_machine(&conn, id)?.filter(|m| m.namespace == namespace))
    }

    pub fn list_machines(&self, namespace: &str) -> StoreResult<Vec<MachineRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {MACHINE_COLUMNS} FROM machines WHERE namespace = ?1 ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql).map_err(StoreError::Sql)?;
        let rows = stmt
            .query_map(params![namespace], row_to_machine)
            .map_err(StoreError::Sql)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sql)?;
        Ok(rows)
    }

    pub fn update_machine_metadata(
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
            MACHINE_METADATA,
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

    pub fn update_machine_runner_state(
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
            MACHINE_RUNNER_STATE,
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

    /// Reconcile machine liveness. Bumps `seq`.
    pub fn set_machine_liveness(
        &self,
        id: &str,
        namespace: &str,
        active: bool,
        active_at: Option<i64>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE machines
                 SET active = ?1, active_at = COALESCE(?2, active_at),
                     seq = seq + 1, updated_at = MAX(updated_at, ?3)
                 WHERE id = ?4 AND namespace = ?5",
                params![active as i64, active_at, Self::now_ms(), id, namespace],
            )
            .map_err(StoreError::Sql)?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
#[path = "machines_tests.rs"]
mod tests;
