// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP control surface exposed on the runner machine.
//!
//! Used by the hub-less local tooling and integration tests: spawn a
//! session, stop one, list what this runner hosts. Every tracked session
//! records who started it (`runner` or `terminal`).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::ControlError;
use crate::supervisor::{SpawnRequest, Supervisor};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub machine_id: String,
    pub session_count: usize,
}

/// `GET /api/v1/health`
async fn health(State(s): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        machine_id: s.machine_id().to_owned(),
        session_count: s.list_sessions().await.len(),
    })
}

/// `GET /api/v1/sessions`
async fn list_sessions(State(s): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(s.list_sessions().await)
}

/// `POST /api/v1/sessions/spawn`
async fn spawn_session(
    State(s): State<Arc<Supervisor>>,
    Json(request): Json<SpawnRequest>,
) -> impl IntoResponse {
    match s.spawn(request).await {
        Ok(session_id) => {
            Json(serde_json::json!({ "type": "success", "sessionId": session_id }))
                .into_response()
        }
        Err(e) => ControlError::SpawnFailed.to_http_response(e.to_string()).into_response(),
    }
}

/// `POST /api/v1/sessions/{id}/stop`
async fn stop_session(
    State(s): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if s.kill(&id).await {
        Json(serde_json::json!({ "ok": true })).into_response()
    } else {
        ControlError::SessionNotFound.to_http_response("session not found").into_response()
    }
}

/// Build the control router.
pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/spawn", post(spawn_session))
        .route("/api/v1/sessions/{id}/stop", post(stop_session))
        .with_state(supervisor)
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
