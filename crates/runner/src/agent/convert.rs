// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Normalizes the agent CLI notification dialects into one canonical event
//! stream.
//!
//! Two source shapes exist: the direct `item/*` / `turn/*` dialect and the
//! wrapped `codex/event/*` dialect (payload under `msg`). Text arrives as
//! append-only deltas or cumulative snapshots, sometimes replayed out of
//! order; per-item buffers reconstruct the artifact with a conservative
//! merge and a completion-key set dedupes wrapped+direct completion pairs.

use std::collections::{HashMap, HashSet};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::transport::AgentNotification;

/// Canonical events emitted toward the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ThreadStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    TaskStarted,
    TaskComplete,
    TaskFailed { error: String },
    TurnAborted,
    /// Mid-turn marker from the wrapped dialect; must not clear the
    /// thinking spinner.
    CodexStepComplete,
    AgentMessage { id: String, message: String },
    AgentReasoning { id: String, text: String },
    ExecCommandBegin {
        call_id: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    ExecCommandEnd { call_id: String, output: String, exit_code: Option<i64> },
    PatchApplyBegin { call_id: String, files: Vec<String> },
    PatchApplyEnd { call_id: String, success: bool, output: String },
    ItemActivity { kind: String, id: String },
    TurnDiff { diff: String },
    TurnPlanUpdated { plan: Value },
    PlanDelta { delta: Value },
    TokenCount { info: Value },
}

// -- Delta merge ---------------------------------------------------------------

/// Merge an incoming fragment into a reconstructed buffer.
///
/// Rules, in order: empty buffer takes the fragment; a fragment extending
/// the buffer is a cumulative snapshot and replaces it; a fragment the
/// buffer already ends with is a replay and is dropped; otherwise the
/// longest suffix/prefix overlap is collapsed and the tail appended.
pub fn merge_delta(prev: &str, incoming: &str) -> String {
    if prev.is_empty() {
        return incoming.to_owned();
    }
    if incoming.starts_with(prev) {
        return incoming.to_owned();
    }
    if prev.ends_with(incoming) {
        return prev.to_owned();
    }

    let prev_bytes = prev.as_bytes();
    let incoming_bytes = incoming.as_bytes();
    let max = prev.len().min(incoming.len());
    for overlap in (1..=max).rev() {
        if !incoming.is_char_boundary(overlap) {
            continue;
        }
        if prev_bytes[prev.len() - overlap..] == incoming_bytes[..overlap] {
            let mut merged = prev.to_owned();
            merged.push_str(&incoming[overlap..]);
            return merged;
        }
    }
    let mut merged = prev.to_owned();
    merged.push_str(incoming);
    merged
}

// -- Alias decoding ------------------------------------------------------------

/// `item_id` | `itemId` | `id`, wherever the dialect put it.
fn item_id(value: &Value) -> Option<String> {
    for key in ["item_id", "itemId", "id", "call_id", "callId"] {
        if let Some(id) = value.get(key).and_then(|v| v.as_str()) {
            return Some(id.to_owned());
        }
    }
    None
}

/// `command` as a shell string, whether it arrived as string or argv array.
fn command_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Output chunk: base64 first, raw UTF-8 as fallback.
fn chunk_text(value: &Value) -> String {
    let Some(raw) = value.as_str() else {
        return String::new();
    };
    match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| raw.to_owned()),
        Err(_) => raw.to_owned(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

// -- Converter -----------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct CommandMeta {
    command: String,
    cwd: Option<String>,
}

/// Per-session converter state.
#[derive(Default)]
pub struct EventConverter {
    agent_message_buffers: HashMap<String, String>,
    reasoning_buffers: HashMap<String, String>,
    command_output_buffers: HashMap<String, String>,
    command_meta: HashMap<String, CommandMeta>,
    file_change_output: HashMap<String, String>,
    file_change_files: HashMap<String, Vec<String>>,
    completed_item_keys: HashSet<String>,
}

impl EventConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one notification; returns zero or more canonical events.
    pub fn handle(&mut self, notification: &AgentNotification) -> Vec<AgentEvent> {
        let method = notification.method.as_str();
        let params = &notification.params;

        if let Some(wrapped) = method.strip_prefix("codex/event/") {
            let msg = params.get("msg").unwrap_or(params);
            return self.handle_wrapped(wrapped, msg);
        }

        match method {
            "thread/started" | "thread/resumed" => {
                vec![AgentEvent::ThreadStarted {
                    thread_id: str_field(params, "threadId")
                        .or_else(|| str_field(params, "thread_id")),
                }]
            }
            "turn/started" => vec![AgentEvent::TaskStarted],
            "turn/completed" => self.turn_completed(params),
            "turn/diff/updated" => match str_field(params, "diff") {
                Some(diff) => vec![AgentEvent::TurnDiff { diff }],
                None => vec![],
            },
            "turn/plan/updated" => {
                let plan = params.get("plan").cloned().unwrap_or_else(|| params.clone());
                vec![AgentEvent::TurnPlanUpdated { plan }]
            }
            "thread/tokenUsage/updated" => {
                vec![AgentEvent::TokenCount { info: params.clone() }]
            }
            "item/agentMessage/delta" => {
                self.merge_into(BufferKind::AgentMessage, params);
                vec![]
            }
            "item/reasoning/delta" => {
                self.merge_into(BufferKind::Reasoning, params);
                vec![]
            }
            "item/commandExecution/outputDelta" => {
                self.merge_into(BufferKind::CommandOutput, params);
                vec![]
            }
            "item/fileChange/outputDelta" => {
                self.merge_into(BufferKind::FileChangeOutput, params);
                vec![]
            }
            "item/started" => self.item_started(params),
            "item/completed" => self.item_completed(params),
            "error" => self.error_notification(params),
            other => {
                debug!(method = %other, "unhandled agent notification");
                vec![]
            }
        }
    }

    fn turn_completed(&mut self, params: &Value) -> Vec<AgentEvent> {
        let status = str_field(params, "status")
            .or_else(|| params.get("turn").and_then(|t| str_field(t, "status")))
            .unwrap_or_else(|| "completed".to_owned());
        match status.as_str() {
            "failed" => {
                let error = params
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("turn failed")
                    .to_owned();
                vec![AgentEvent::TaskFailed { error }]
            }
            "interrupted" | "cancelled" => vec![AgentEvent::TurnAborted],
            _ => vec![AgentEvent::TaskComplete],
        }
    }

    fn error_notification(&mut self, params: &Value) -> Vec<AgentEvent> {
        let will_retry = params.get("will_retry").and_then(|v| v.as_bool()).unwrap_or(false);
        if will_retry {
            debug!("retryable agent error swallowed");
            return vec![];
        }
        let error = str_field(params, "message").unwrap_or_else(|| "agent error".to_owned());
        vec![AgentEvent::TaskFailed { error }]
    }

    fn item_started(&mut self, params: &Value) -> Vec<AgentEvent> {
        let item = params.get("item").unwrap_or(params);
        let Some(id) = item_id(item) else { return vec![] };
        let kind = str_field(item, "type").unwrap_or_default();
        match kind.as_str() {
            "commandExecution" => {
                let command = command_string(item.get("command").unwrap_or(&Value::Null));
                let cwd = str_field(item, "cwd");
                self.command_meta
                    .insert(id.clone(), CommandMeta { command: command.clone(), cwd: cwd.clone() });
                vec![AgentEvent::ExecCommandBegin { call_id: id, command, cwd }]
            }
            "fileChange" => {
                let files: Vec<String> = item
                    .get("changes")
                    .and_then(|v| v.as_array())
                    .map(|changes| {
                        changes
                            .iter()
                            .filter_map(|c| str_field(c, "path"))
                            .collect()
                    })
                    .unwrap_or_default();
                self.file_change_files.insert(id.clone(), files.clone());
                vec![AgentEvent::PatchApplyBegin { call_id: id, files }]
            }
            "mcpToolCall" | "webSearch" | "agentMessage" | "reasoning" => {
                vec![AgentEvent::ItemActivity { kind, id }]
            }
            _ => vec![],
        }
    }

    fn item_completed(&mut self, params: &Value) -> Vec<AgentEvent> {
        let item = params.get("item").unwrap_or(params);
        let Some(id) = item_id(item) else { return vec![] };
        let kind = str_field(item, "type").unwrap_or_default();
        if !self.mark_completed(&kind, &id) {
            return vec![];
        }
        match kind.as_str() {
            "agentMessage" => {
                let message = self
                    .agent_message_buffers
                    .remove(&id)
                    .or_else(|| str_field(item, "text"))
                    .unwrap_or_default();
                vec![AgentEvent::AgentMessage { id, message }]
            }
            "reasoning" => {
                let text = self
                    .reasoning_buffers
                    .remove(&id)
                    .or_else(|| str_field(item, "text"))
                    .unwrap_or_default();
                vec![AgentEvent::AgentReasoning { id, text }]
            }
            "commandExecution" => {
                let output = self
                    .command_output_buffers
                    .remove(&id)
                    .or_else(|| str_field(item, "aggregatedOutput"))
                    .unwrap_or_default();
                self.command_meta.remove(&id);
                let exit_code = item
                    .get("exitCode")
                    .or_else(|| item.get("exit_code"))
                    .and_then(|v| v.as_i64());
                vec![AgentEvent::ExecCommandEnd { call_id: id, output, exit_code }]
            }
            "fileChange" => {
                let output = self.file_change_output.remove(&id).unwrap_or_default();
                self.file_change_files.remove(&id);
                let success = str_field(item, "status").as_deref() != Some("failed");
                vec![AgentEvent::PatchApplyEnd { call_id: id, success, output }]
            }
            _ => vec![],
        }
    }

    fn handle_wrapped(&mut self, name: &str, msg: &Value) -> Vec<AgentEvent> {
        match name {
            "task_started" => vec![AgentEvent::TaskStarted],
            // A wrapped task_complete is a step boundary, not the end of the
            // turn; emitting TaskComplete here would clear the spinner early.
            "task_complete" => vec![AgentEvent::CodexStepComplete],
            "agent_message" => {
                let id = item_id(msg).unwrap_or_else(|| "agent-message".to_owned());
                if !self.mark_completed("agentMessage", &id) {
                    return vec![];
                }
                let message = self
                    .agent_message_buffers
                    .remove(&id)
                    .or_else(|| str_field(msg, "message"))
                    .unwrap_or_default();
                vec![AgentEvent::AgentMessage { id, message }]
            }
            "agent_message_delta" => {
                if let Some(id) = item_id(msg) {
                    let delta = str_field(msg, "delta").unwrap_or_default();
                    let buffer = self.agent_message_buffers.entry(id).or_default();
                    *buffer = merge_delta(buffer, &delta);
                }
                vec![]
            }
            "agent_reasoning" => {
                let id = item_id(msg).unwrap_or_else(|| "reasoning".to_owned());
                if !self.mark_completed("reasoning", &id) {
                    return vec![];
                }
                let text = self
                    .reasoning_buffers
                    .remove(&id)
                    .or_else(|| str_field(msg, "text"))
                    .unwrap_or_default();
                vec![AgentEvent::AgentReasoning { id, text }]
            }
            "exec_command_begin" => {
                let Some(call_id) = item_id(msg) else { return vec![] };
                let command = command_string(msg.get("command").unwrap_or(&Value::Null));
                let cwd = str_field(msg, "cwd");
                self.command_meta.insert(
                    call_id.clone(),
                    CommandMeta { command: command.clone(), cwd: cwd.clone() },
                );
                vec![AgentEvent::ExecCommandBegin { call_id, command, cwd }]
            }
            "exec_command_output_delta" => {
                if let Some(call_id) = item_id(msg) {
                    let chunk = chunk_text(msg.get("chunk").unwrap_or(&Value::Null));
                    let buffer = self.command_output_buffers.entry(call_id).or_default();
                    *buffer = merge_delta(buffer, &chunk);
                }
                vec![]
            }
            "exec_command_end" => {
                let Some(call_id) = item_id(msg) else { return vec![] };
                if !self.mark_completed("commandExecution", &call_id) {
                    return vec![];
                }
                let output = self
                    .command_output_buffers
                    .remove(&call_id)
                    .or_else(|| str_field(msg, "aggregated_output"))
                    .unwrap_or_default();
                self.command_meta.remove(&call_id);
                let exit_code = msg.get("exit_code").and_then(|v| v.as_i64());
                vec![AgentEvent::ExecCommandEnd { call_id, output, exit_code }]
            }
            "patch_apply_begin" => {
                let Some(call_id) = item_id(msg) else { return vec![] };
                let files: Vec<String> = msg
                    .get("changes")
                    .and_then(|v| v.as_object())
                    .map(|changes| changes.keys().cloned().collect())
                    .unwrap_or_default();
                self.file_change_files.insert(call_id.clone(), files.clone());
                vec![AgentEvent::PatchApplyBegin { call_id, files }]
            }
            "patch_apply_end" => {
                let Some(call_id) = item_id(msg) else { return vec![] };
                if !self.mark_completed("fileChange", &call_id) {
                    return vec![];
                }
                let output = self
                    .file_change_output
                    .remove(&call_id)
                    .or_else(|| str_field(msg, "stdout"))
                    .unwrap_or_default();
                self.file_change_files.remove(&call_id);
                let success = msg.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
                vec![AgentEvent::PatchApplyEnd { call_id, success, output }]
            }
            "turn_diff" => {
                let diff = str_field(msg, "unified_diff")
                    .or_else(|| str_field(msg, "diff"))
                    .unwrap_or_default();
                vec![AgentEvent::TurnDiff { diff }]
            }
            "plan_delta" => vec![AgentEvent::PlanDelta { delta: msg.clone() }],
            "plan_update" => vec![AgentEvent::TurnPlanUpdated { plan: msg.clone() }],
            "token_count" => vec![AgentEvent::TokenCount { info: msg.clone() }],
            "error" => self.error_notification(msg),
            other => {
                debug!(event = %other, "unhandled wrapped notification");
                vec![]
            }
        }
    }

    /// Record completion of `(kind, id)`; false means it was already seen
    /// (the other dialect got there first).
    fn mark_completed(&mut self, kind: &str, id: &str) -> bool {
        self.completed_item_keys.insert(format!("{kind}:{id}"))
    }

    fn merge_into(&mut self, buffer: BufferKind, params: &Value) {
        let Some(id) = item_id(params) else { return };
        let (map, text) = match buffer {
            BufferKind::AgentMessage => (
                &mut self.agent_message_buffers,
                str_field(params, "delta").unwrap_or_default(),
            ),
            BufferKind::Reasoning => (
                &mut self.reasoning_buffers,
                str_field(params, "delta").unwrap_or_default(),
            ),
            BufferKind::CommandOutput => (
                &mut self.command_output_buffers,
                chunk_text(params.get("chunk").or(params.get("delta")).unwrap_or(&Value::Null)),
            ),
            BufferKind::FileChangeOutput => (
                &mut self.file_change_output,
                str_field(params, "delta").unwrap_or_default(),
            ),
        };
        let entry = map.entry(id).or_default();
        *entry = merge_delta(entry, &text);
    }
}

enum BufferKind {
    AgentMessage,
    Reasoning,
    CommandOutput,
    FileChangeOutput,
}

#[cfg(test)]
#[path = "convert_tests.rs"]
mod tests;
