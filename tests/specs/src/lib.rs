// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end scenario tests.
//!
//! Assembles a full in-process hub (in-memory store, real engine, router)
//! with a scripted runner socket and a recording push provider, so
//! scenarios can drive the public surfaces without binding real ports.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use hapi_hub::config::HubConfig;
use hapi_hub::events::Publisher;
use hapi_hub::push::{PushChannel, PushError, PushProvider};
use hapi_hub::qr::QrLogin;
use hapi_hub::settings::{Settings, VapidKeys};
use hapi_hub::store::users::PushSubscriptionRecord;
use hapi_hub::store::Store;
use hapi_hub::sync::cache::SessionCache;
use hapi_hub::sync::engine::SyncEngine;
use hapi_hub::sync::rpc::{HubFrame, RpcRegistry};
use hapi_hub::transport::{build_router, AppState};

/// The API token every harness hub accepts.
pub const TOKEN: &str = "spec-api-token";

static CRYPTO_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Recording push provider; optionally reports endpoints gone.
pub struct RecordingPush {
    pub sent: parking_lot::Mutex<Vec<String>>,
    pub gone: bool,
}

impl RecordingPush {
    pub fn new(gone: bool) -> Arc<Self> {
        Arc::new(Self { sent: parking_lot::Mutex::new(Vec::new()), gone })
    }
}

impl PushProvider for RecordingPush {
    fn deliver<'a>(
        &'a self,
        subscription: &'a PushSubscriptionRecord,
        _payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), PushError>> + Send + 'a>> {
        Box::pin(async move {
            self.sent.lock().push(subscription.endpoint.clone());
            if self.gone {
                Err(PushError::Gone)
            } else {
                Ok(())
            }
        })
    }
}

/// A fully wired in-process hub.
pub struct Hub {
    pub state: Arc<AppState>,
    pub push_provider: Arc<RecordingPush>,
}

impl Hub {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_push(RecordingPush::new(false))
    }

    pub fn with_push(push_provider: Arc<RecordingPush>) -> anyhow::Result<Self> {
        ensure_crypto();
        let config = HubConfig {
            host: "127.0.0.1".into(),
            port: 0,
            home: None,
            auth_token: None,
            web_origin: "https://ui.example".into(),
            session_timeout_ms: 30_000,
            spawn_active_timeout_ms: 1_000,
            rpc_timeout_ms: 1_000,
            log_level: "info".into(),
        };
        let settings = Settings {
            machine_id: "hub".into(),
            cli_api_token: TOKEN.into(),
            vapid_keys: VapidKeys { public_key: "pub".into(), private_key: "priv".into() },
            cors_origins: vec![],
        };
        let store = Arc::new(Store::open_in_memory()?);
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
            Arc::clone(&push_provider) as Arc<dyn PushProvider>,
            config.web_origin.clone(),
        ));
        let state = Arc::new(AppState {
            config,
            settings,
            store,
            cache,
            publisher,
            engine,
            rpc,
            push,
            qr: Arc::new(QrLogin::default()),
            shutdown: CancellationToken::new(),
        });
        Ok(Self { state, push_provider })
    }

    pub fn server(&self) -> anyhow::Result<TestServer> {
        TestServer::new(build_router(Arc::clone(&self.state)))
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// A scripted runner socket attached to the hub's RPC registry. Replies to
/// each method from a closure and records the observed call order.
pub struct ScriptedRunner {
    pub calls: Arc<Mutex<Vec<String>>>,
}

pub type ReplyFn = Box<dyn Fn(&str, usize) -> Value + Send + Sync>;

impl ScriptedRunner {
    pub async fn attach(hub: &Hub, machine_id: &str, methods: &[String], reply: ReplyFn) -> Self {
        let registry = Arc::clone(&hub.state.rpc);
        let (socket, mut rx) = registry.attach_socket("default", machine_id).await;
        registry.register_methods(&socket.id, methods).await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            let socket_id = socket.id.clone();
            tokio::spawn(async move {
                let mut counts: HashMap<String, usize> = HashMap::new();
                while let Some(frame) = rx.recv().await {
                    if let HubFrame::RpcRequest { id, method, .. } = frame {
                        let attempt = counts.entry(method.clone()).or_insert(0);
                        *attempt += 1;
                        let value = reply(&method, *attempt);
                        calls.lock().await.push(method);
                        registry.handle_reply(&socket_id, id, Ok(value)).await;
                    }
                }
            });
        }
        Self { calls }
    }
}

/// A reply closure answering kills with success and spawns with the given
/// session id.
pub fn simple_runner_script(session_id: &str) -> ReplyFn {
    let session_id = session_id.to_owned();
    Box::new(move |method, _| {
        if method.ends_with(":killSession") {
            json!({ "type": "success" })
        } else {
            json!({ "type": "success", "sessionId": session_id.clone() })
        }
    })
}
