// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire frames between runner and hub, and small time helpers.
//!
//! The runner and hub are independent binaries; both sides pin the same
//! JSON shapes (`type`-tagged, snake_case) so either can evolve behind the
//! tag.

use serde::{Deserialize, Serialize};

/// Frames the hub sends to this runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    RpcRequest { id: u64, method: String, params: serde_json::Value },
    PermissionReply { request_id: String, outcome: serde_json::Value },
}

/// Frames this runner sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerFrame {
    Register { methods: Vec<String> },
    Unregister { methods: Vec<String> },
    RpcResponse { id: u64, result: serde_json::Value },
    RpcError { id: u64, message: String },
    SessionAlive {
        session_id: String,
        time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<bool>,
    },
    SessionEnd { session_id: String, time: i64 },
    MachineAlive { machine_id: String, time: i64 },
    AgentEvent { session_id: String, event: serde_json::Value },
    PermissionRequest { session_id: String, request_id: String, request: serde_json::Value },
}

/// Return current epoch millis.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
