// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single version-guarded update template shared by every versioned
//! column (`metadata`, `agent_state`, `runner_state`, sort preferences).
//!
//! One transactional shape: bump the field, its version, and the row `seq`
//! only when the caller's expected version still matches. On a miss the
//! current value and version are read back so the caller can refresh and
//! retry. Lost updates are impossible: of two racing writers with the same
//! expected version, exactly one matches the `WHERE`.

use rusqlite::{params, Connection, OptionalExtension};

use super::{StoreError, StoreResult, VersionedWrite};

/// Identifies one versioned column pair on one table.
///
/// All fields are compile-time constants supplied by the sibling modules;
/// nothing user-controlled is ever interpolated into SQL here.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub table: &'static str,
    pub field: &'static str,
    pub version_column: &'static str,
}

pub(crate) const SESSION_METADATA: FieldSpec =
    FieldSpec { table: "sessions", field: "metadata", version_column: "metadata_version" };

pub(crate) const SESSION_AGENT_STATE: FieldSpec =
    FieldSpec { table: "sessions", field: "agent_state", version_column: "agent_state_version" };

pub(crate) const MACHINE_METADATA: FieldSpec =
    FieldSpec { table: "machines", field: "metadata", version_column: "metadata_version" };

pub(crate) const MACHINE_RUNNER_STATE: FieldSpec =
    FieldSpec { table: "machines", field: "runner_state", version_column: "runner_state_version" };

/// Apply the CAS update template to `spec` for row `id` in `namespace`.
///
/// Returns `NotFound` when the row does not exist and `NamespaceMismatch`
/// when it exists under a different namespace — neither has side effects.
pub(crate) fn update_versioned_field(
    conn: &Connection,
    spec: FieldSpec,
    id: &str,
    namespace: &str,
    value: &serde_json::Value,
    expected_version: i64,
    touch_updated_at: bool,
    now_ms: i64,
) -> StoreResult<VersionedWrite> {
    let tx_value = serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned());

    let row_namespace: Option<String> = conn
        .query_row(
            &format!("SELECT namespace FROM {} WHERE id = ?1", spec.table),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match row_namespace {
        None => return Err(StoreError::NotFound),
        Some(ns) if ns != namespace => return Err(StoreError::NamespaceMismatch),
        Some(_) => {}
    }

    let updated_at_clause = if touch_updated_at {
        ", updated_at = MAX(updated_at, ?5)"
    } else {
        ""
    };
    let sql = format!(
        "UPDATE {table} SET {field} = ?1, {version} = {version} + 1, seq = seq + 1{touch}
         WHERE id = ?2 AND namespace = ?3 AND {version} = ?4",
        table = spec.table,
        field = spec.field,
        version = spec.version_column,
        touch = updated_at_clause,
    );
    let changed = if touch_updated_at {
        conn.execute(&sql, params![tx_value, id, namespace, expected_version, now_ms])?
    } else {
        conn.execute(&sql, params![tx_value, id, namespace, expected_version])?
    };

    let (current_value, current_version) = read_current(conn, spec, id)?;
    if changed == 1 {
        Ok(VersionedWrite::Success { version: current_version, value: current_value })
    } else {
        Ok(VersionedWrite::Mismatch { version: current_version, value: current_value })
    }
}

/// Read the current `(value, version)` for a versioned column.
pub(crate) fn read_current(
    conn: &Connection,
    spec: FieldSpec,
    id: &str,
) -> StoreResult<(serde_json::Value, i64)> {
    let sql = format!(
        "SELECT {field}, {version} FROM {table} WHERE id = ?1",
        field = spec.field,
        version = spec.version_column,
        table = spec.table,
    );
    let row: Option<(Option<String>, i64)> = conn
        .query_row(&sql, params![id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    match row {
        None => Err(StoreError::NotFound),
        Some((raw, version)) => {
            let value = raw
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(serde_json::Value::Null);
            Ok((value, version))
        }
    }
}

#[cfg(test)]
#[path = "versioned_tests.rs"]
mod tests;
