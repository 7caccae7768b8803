// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the hub API.
//!
//! Handlers translate structured results from the store/engine into HTTP
//! statuses at this boundary only: 400 malformed body, 401 bad token, 403
//! wrong namespace, 404 missing, 409 version conflict, 410 expired QR, 503
//! no runner connected.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::HubError;
use crate::events::Visibility;
use crate::qr::QrPoll;
use crate::store::sessions::NewSession;
use crate::store::{StoreError, VersionedWrite};
use crate::sync::engine::{EngineError, PermissionReply, SpawnOptions};
use crate::sync::rpc::RpcError;

use super::auth::{self, AuthContext};
use super::AppState;

fn unauthorized() -> axum::response::Response {
    HubError::Unauthorized.to_http_response("missing or invalid token").into_response()
}

fn engine_error(e: EngineError) -> axum::response::Response {
    match e {
        EngineError::Rpc(RpcError::NoHandler(method)) => HubError::NotConnected
            .to_http_response(format!("no runner connected for {method}"))
            .into_response(),
        EngineError::Rpc(err) => {
            HubError::NotConnected.to_http_response(err.to_string()).into_response()
        }
        EngineError::Store(StoreError::NotFound) | EngineError::NotFound => {
            HubError::NotFound.to_http_response("resource missing").into_response()
        }
        EngineError::Store(StoreError::NamespaceMismatch) => {
            HubError::WrongNamespace.to_http_response("wrong namespace").into_response()
        }
        EngineError::Store(err) => {
            HubError::Internal.to_http_response(err.to_string()).into_response()
        }
        EngineError::Runner { code, message } => HubError::Conflict
            .to_http_response(match code {
                Some(code) => format!("{code}: {message}"),
                None => message,
            })
            .into_response(),
    }
}

fn store_error(e: StoreError) -> axum::response::Response {
    match e {
        StoreError::NotFound => {
            HubError::NotFound.to_http_response("resource missing").into_response()
        }
        StoreError::NamespaceMismatch => {
            HubError::WrongNamespace.to_http_response("wrong namespace").into_response()
        }
        other => HubError::Internal.to_http_response(other.to_string()).into_response(),
    }
}

// -- Health & auth -------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub subscriptions: usize,
}

/// `GET /health`
pub async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        subscriptions: s.publisher.subscription_count().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// `POST /api/auth` — exchange a bearer token for its namespace binding.
pub async fn auth_exchange(
    State(s): State<Arc<AppState>>,
    Json(req): Json<AuthRequest>,
) -> impl IntoResponse {
    match auth::resolve_token(&req.token, s.api_token()) {
        Some(ctx) => Json(json!({ "ok": true, "namespace": ctx.namespace })).into_response(),
        None => unauthorized(),
    }
}

// -- Sessions ------------------------------------------------------------------

/// `GET /api/sessions` — sessions in the caller's namespace. Sessions whose
/// machine has gone inactive are filtered out.
pub async fn list_sessions(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    let sessions = match s.store.list_sessions(&ctx.namespace) {
        Ok(sessions) => sessions,
        Err(e) => return store_error(e),
    };
    let mut visible = Vec::with_capacity(sessions.len());
    for session in sessions {
        let machine_ok = match session.machine_id.as_deref() {
            Some(machine_id) => s.cache.is_machine_active(machine_id).await,
            None => true,
        };
        if machine_ok {
            visible.push(session);
        }
    }
    Json(visible).into_response()
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.store.get_session_by_namespace(&id, &ctx.namespace) {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => HubError::NotFound.to_http_response("session not found").into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSessionRequest {
    pub metadata: serde_json::Value,
    pub expected_version: i64,
}

/// `PATCH /api/sessions/{id}` — versioned metadata update. A stale expected
/// version is a 409 carrying the current value so the caller can retry.
pub async fn patch_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<PatchSessionRequest>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s
        .engine
        .update_session_metadata(&id, &ctx.namespace, &req.metadata, req.expected_version)
        .await
    {
        Ok(VersionedWrite::Success { version, value }) => {
            Json(json!({ "result": "success", "version": version, "value": value }))
                .into_response()
        }
        Ok(VersionedWrite::Mismatch { version, value }) => (
            axum::http::StatusCode::CONFLICT,
            Json(json!({ "result": "version-mismatch", "version": version, "value": value })),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}

/// `DELETE /api/sessions/{id}`
pub async fn delete_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.engine.delete_session(&id, &ctx.namespace).await {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => HubError::NotFound.to_http_response("session not found").into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub before_seq: Option<i64>,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/sessions/{id}/messages`
pub async fn get_messages(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.store.get_session_by_namespace(&id, &ctx.namespace) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HubError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return store_error(e),
    }
    match s.store.get_messages(&id, query.limit, query.before_seq) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    pub local_id: Option<String>,
}

/// `POST /api/sessions/{id}/messages`
pub async fn post_message(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    let content = json!({
        "role": "user",
        "text": req.text,
        "attachments": req.attachments,
    });
    match s
        .engine
        .add_message(&id, &ctx.namespace, &content, req.local_id.as_deref())
        .await
    {
        Ok(message) => Json(message).into_response(),
        Err(e) => engine_error(e),
    }
}

/// `POST /api/sessions/{id}/abort`
pub async fn abort_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    session_op(s, headers, id, "abort", json!({})).await
}

/// `POST /api/sessions/{id}/archive`
pub async fn archive_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    session_op(s, headers, id, "archive", json!({})).await
}

#[derive(Debug, Deserialize)]
pub struct PermissionModeRequest {
    pub mode: String,
}

/// `POST /api/sessions/{id}/permission-mode`
pub async fn set_permission_mode(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<PermissionModeRequest>,
) -> impl IntoResponse {
    session_op(s, headers, id, "setPermissionMode", json!({ "mode": req.mode })).await
}

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model: String,
}

/// `POST /api/sessions/{id}/model`
pub async fn set_model(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ModelRequest>,
) -> impl IntoResponse {
    session_op(s, headers, id, "setModel", json!({ "model": req.model })).await
}

async fn session_op(
    s: Arc<AppState>,
    headers: HeaderMap,
    id: String,
    op: &str,
    params: serde_json::Value,
) -> axum::response::Response {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.store.get_session_by_namespace(&id, &ctx.namespace) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HubError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return store_error(e),
    }
    match s.engine.session_rpc(&id, op, params).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => engine_error(e),
    }
}

/// `POST /api/sessions/{id}/resume` — kill + resume this session in place.
pub async fn resume_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    let filter = [id];
    match s.engine.restart_sessions(&ctx.namespace, Some(filter.as_slice())).await {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionAnswer {
    pub request_id: String,
    pub option_id: Option<String>,
}

/// `POST /api/sessions/{id}/permission` — answer a pending permission
/// request. Absent `optionId` cancels.
pub async fn answer_permission(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(_id): Path<String>,
    Json(req): Json<PermissionAnswer>,
) -> impl IntoResponse {
    let Ok(_ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    let reply = match req.option_id {
        Some(option_id) => PermissionReply::Selected { option_id },
        None => PermissionReply::Cancelled,
    };
    if s.engine.resolve_permission(&req.request_id, reply).await {
        Json(json!({ "ok": true })).into_response()
    } else {
        HubError::NotFound.to_http_response("no pending request").into_response()
    }
}

// -- Machines ------------------------------------------------------------------

/// `GET /api/machines`
pub async fn list_machines(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.store.list_machines(&ctx.namespace) {
        Ok(machines) => Json(machines).into_response(),
        Err(e) => store_error(e),
    }
}

/// `POST /api/machines/{id}/spawn`
pub async fn spawn_on_machine(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut options): Json<SpawnOptions>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    options.machine_id = id;
    match s.engine.spawn_session(&ctx.namespace, options).await {
        Ok(outcome) => {
            let mut body = json!({ "type": "success", "sessionId": outcome.session_id });
            if let Some(delivery) = outcome.initial_prompt_delivery {
                body["initialPromptDelivery"] = serde_json::to_value(delivery).unwrap_or_default();
            }
            Json(body).into_response()
        }
        Err(e) => engine_error(e),
    }
}

// -- Runner-side session observation ------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveSessionRequest {
    pub tag: String,
    pub machine_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub agent_state: Option<serde_json::Value>,
}

/// `POST /api/runner/sessions` — a runner claims a session by tag.
pub async fn observe_session(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ObserveSessionRequest>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    let new = NewSession {
        id: None,
        tag: Some(req.tag),
        namespace: ctx.namespace,
        machine_id: req.machine_id,
        metadata: req.metadata,
        agent_state: req.agent_state,
    };
    match s.engine.observe_session(new).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => engine_error(e),
    }
}

// -- Push ----------------------------------------------------------------------

/// `GET /api/push/vapid-public-key`
pub async fn vapid_public_key(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "publicKey": s.settings.vapid_keys.public_key }))
}

#[derive(Debug, Deserialize)]
pub struct PushSubscribeRequest {
    pub endpoint: String,
    #[serde(default)]
    pub keys: serde_json::Value,
}

/// `POST /api/push/subscribe`
pub async fn push_subscribe(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PushSubscribeRequest>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.store.add_push_subscription(&ctx.namespace, &req.endpoint, &req.keys) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PushUnsubscribeRequest {
    pub endpoint: String,
}

/// `DELETE /api/push/subscribe`
pub async fn push_unsubscribe(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PushUnsubscribeRequest>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    match s.store.remove_push_subscription(&ctx.namespace, &req.endpoint) {
        Ok(removed) => Json(json!({ "ok": removed })).into_response(),
        Err(e) => store_error(e),
    }
}

// -- Visibility ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityRequest {
    pub subscription_id: String,
    pub visibility: Visibility,
}

/// `POST /api/visibility`
pub async fn set_visibility(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<VisibilityRequest>,
) -> impl IntoResponse {
    let Ok(_ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    if s.publisher.set_visibility(&req.subscription_id, req.visibility).await {
        Json(json!({ "ok": true })).into_response()
    } else {
        HubError::NotFound.to_http_response("unknown subscription").into_response()
    }
}

// -- QR login ------------------------------------------------------------------

/// `POST /qr` — start a login; unauthenticated.
pub async fn qr_create(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    s.qr.sweep();
    let (id, secret) = s.qr.create();
    Json(json!({ "id": id, "secret": secret }))
}

#[derive(Debug, Deserialize)]
pub struct QrSecretQuery {
    pub s: String,
}

/// `GET /qr/{id}?s=` — poll a pending login.
pub async fn qr_poll(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<QrSecretQuery>,
) -> impl IntoResponse {
    match s.qr.poll(&id, &query.s) {
        QrPoll::Pending => Json(json!({ "status": "pending" })).into_response(),
        QrPoll::Confirmed { access_token } => {
            Json(json!({ "status": "confirmed", "accessToken": access_token })).into_response()
        }
        QrPoll::Expired => (
            axum::http::StatusCode::GONE,
            Json(json!({ "status": "expired" })),
        )
            .into_response(),
    }
}

/// `POST /qr/{id}/confirm?s=` — authed caller binds its namespace. The token
/// handed to the poller is the CLI token, suffixed when the namespace is not
/// the default.
pub async fn qr_confirm(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<QrSecretQuery>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate(&headers, s.api_token()) else {
        return unauthorized();
    };
    let access_token = access_token_for(&ctx, s.api_token());
    if s.qr.confirm(&id, &query.s, &access_token) {
        Json(json!({ "ok": true })).into_response()
    } else {
        HubError::Expired.to_http_response("login expired or already confirmed").into_response()
    }
}

fn access_token_for(ctx: &AuthContext, base: &str) -> String {
    if ctx.namespace == auth::DEFAULT_NAMESPACE {
        base.to_owned()
    } else {
        format!("{base}:{}", ctx.namespace)
    }
}
