// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! hapi-hub: control plane and event bus for agent coding sessions.
//!
//! The hub multiplexes runner connections (machines hosting agent CLI
//! sessions) and viewer connections (SSE subscribers issuing commands). It
//! owns the durable store, the in-memory liveness mirror, the RPC routing to
//! runners, and the event fan-out.

pub mod config;
pub mod error;
pub mod events;
pub mod push;
pub mod qr;
pub mod settings;
pub mod store;
pub mod sync;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::events::Publisher;
use crate::push::{PushChannel, WebPushProvider};
use crate::qr::QrLogin;
use crate::settings::Settings;
use crate::store::Store;
use crate::sync::cache::SessionCache;
use crate::sync::engine::SyncEngine;
use crate::sync::rpc::RpcRegistry;
use crate::transport::{build_router, AppState};

/// Assemble the full hub state from config. Split out of [`run`] so tests
/// can drive the router without binding a port.
pub fn build_state(config: HubConfig, shutdown: CancellationToken) -> anyhow::Result<Arc<AppState>> {
    let settings = Settings::load_or_create(&config.settings_path())?;
    let store = Arc::new(Store::open(&config.db_path())?);
    let publisher = Arc::new(Publisher::new());
    let cache = Arc::new(SessionCache::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        config.session_timeout_ms as i64,
    ));
    let rpc = Arc::new(RpcRegistry::new(Duration::from_millis(config.rpc_timeout_ms)));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&publisher),
        Arc::clone(&rpc),
        Duration::from_millis(config.spawn_active_timeout_ms),
    ));
    let push = Arc::new(PushChannel::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        Arc::new(WebPushProvider::new()),
        config.web_origin.clone(),
    ));

    Ok(Arc::new(AppState {
        config,
        settings,
        store,
        cache,
        publisher,
        engine,
        rpc,
        push,
        qr: Arc::new(QrLogin::default()),
        shutdown,
    }))
}

/// Run the hub until shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();
    let state = build_state(config, shutdown.clone())?;

    state.publisher.spawn_heartbeats(shutdown.clone());
    state.cache.spawn_expiry(shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    tracing::info!("hapi-hub listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
