// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stderr classification for agent CLI processes.
//!
//! Agent CLIs print operational failures to stderr in free text. The
//! classifier scans lower-cased chunks for keyword clusters in a fixed
//! order and emits at most one event per chunk; everything else is left to
//! debug logging.

use serde::{Deserialize, Serialize};

/// Classified stderr failure kinds, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrKind {
    RateLimit,
    ModelNotFound,
    Authentication,
    QuotaExceeded,
    Unknown,
}

/// A classified stderr event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StderrEvent {
    pub kind: StderrKind,
    /// The raw chunk the classification came from.
    pub message: String,
}

const RATE_LIMIT: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
const MODEL_NOT_FOUND: &[&str] =
    &["model not found", "model_not_found", "unknown model", "no such model"];
const AUTHENTICATION: &[&str] =
    &["authentication", "unauthorized", "not logged in", "invalid api key", "api key"];
const QUOTA: &[&str] = &["quota", "billing", "insufficient credit", "payment required"];
const GENERIC_ERROR: &[&str] = &["error"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify one stderr chunk. `None` means the chunk is not an error and
/// should only be debug-logged.
pub fn classify(chunk: &str) -> Option<StderrKind> {
    let lowered = chunk.to_lowercase();
    if contains_any(&lowered, RATE_LIMIT) {
        Some(StderrKind::RateLimit)
    } else if contains_any(&lowered, MODEL_NOT_FOUND) {
        Some(StderrKind::ModelNotFound)
    } else if contains_any(&lowered, AUTHENTICATION) {
        Some(StderrKind::Authentication)
    } else if contains_any(&lowered, QUOTA) {
        Some(StderrKind::QuotaExceeded)
    } else if contains_any(&lowered, GENERIC_ERROR) {
        Some(StderrKind::Unknown)
    } else {
        None
    }
}

#[cfg(test)]
#[path = "stderr_tests.rs"]
mod tests;
