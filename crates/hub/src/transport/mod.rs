// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + SSE + runner WebSocket transport for the hub.

pub mod auth;
pub mod http;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::config::HubConfig;
use crate::events::Publisher;
use crate::push::PushChannel;
use crate::qr::QrLogin;
use crate::settings::Settings;
use crate::store::Store;
use crate::sync::cache::SessionCache;
use crate::sync::engine::SyncEngine;
use crate::sync::rpc::RpcRegistry;

/// Shared hub state handed to every handler.
pub struct AppState {
    pub config: HubConfig,
    pub settings: Settings,
    pub store: Arc<Store>,
    pub cache: Arc<SessionCache>,
    pub publisher: Arc<Publisher>,
    pub engine: Arc<SyncEngine>,
    pub rpc: Arc<RpcRegistry>,
    pub push: Arc<PushChannel>,
    pub qr: Arc<QrLogin>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// The API token viewers and runners authenticate with. The CLI flag
    /// overrides the persisted one.
    pub fn api_token(&self) -> &str {
        self.config.auth_token.as_deref().unwrap_or(&self.settings.cli_api_token)
    }
}

/// Build the axum `Router` with all hub routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/api/auth", post(http::auth_exchange))
        .route("/api/sessions", get(http::list_sessions))
        .route("/api/sessions/{id}", get(http::get_session))
        .route("/api/sessions/{id}", patch(http::patch_session))
        .route("/api/sessions/{id}", delete(http::delete_session))
        .route("/api/sessions/{id}/messages", get(http::get_messages))
        .route("/api/sessions/{id}/messages", post(http::post_message))
        .route("/api/sessions/{id}/abort", post(http::abort_session))
        .route("/api/sessions/{id}/resume", post(http::resume_session))
        .route("/api/sessions/{id}/archive", post(http::archive_session))
        .route("/api/sessions/{id}/permission-mode", post(http::set_permission_mode))
        .route("/api/sessions/{id}/model", post(http::set_model))
        .route("/api/sessions/{id}/permission", post(http::answer_permission))
        .route("/api/machines", get(http::list_machines))
        .route("/api/machines/{id}/spawn", post(http::spawn_on_machine))
        .route("/api/push/vapid-public-key", get(http::vapid_public_key))
        .route("/api/push/subscribe", post(http::push_subscribe))
        .route("/api/push/subscribe", delete(http::push_unsubscribe))
        .route("/api/visibility", post(http::set_visibility))
        .route("/api/events", get(sse::events))
        .route("/api/runner", get(ws::runner_socket))
        .route("/api/runner/sessions", post(http::observe_session))
        .route("/qr", post(http::qr_create))
        .route("/qr/{id}", get(http::qr_poll))
        .route("/qr/{id}/confirm", post(http::qr_confirm))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
