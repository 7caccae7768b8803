// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-sent event stream for viewers.
//!
//! Each connection is one subscription in the router. The first frame
//! announces the subscription id (used by `POST /api/visibility`); the
//! stream then carries `SyncEvent`s, including per-subscription heartbeats.
//! Dropping the connection unsubscribes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use futures_util::stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{Publisher, SubscribeOptions, SyncEvent, Visibility};

use super::auth;
use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub token: Option<String>,
    pub all: Option<bool>,
    pub session_id: Option<String>,
    pub machine_id: Option<String>,
    pub visibility: Option<Visibility>,
}

/// Drops the subscription when the SSE stream goes away.
struct UnsubscribeGuard {
    id: String,
    publisher: Arc<Publisher>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let publisher = Arc::clone(&self.publisher);
        let id = std::mem::take(&mut self.id);
        tokio::spawn(async move {
            publisher.unsubscribe(&id).await;
            debug!(subscription = %id, "sse subscription closed");
        });
    }
}

/// `GET /api/events` — SSE stream of sync events.
pub async fn events(
    State(s): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let Ok(ctx) = auth::authenticate_token_param(query.token.as_deref(), s.api_token()) else {
        return crate::error::HubError::Unauthorized
            .to_http_response("missing or invalid token")
            .into_response();
    };

    let all = query
        .all
        .unwrap_or(query.session_id.is_none() && query.machine_id.is_none());
    let (id, rx) = s
        .publisher
        .subscribe(SubscribeOptions {
            namespace: ctx.namespace,
            all,
            session_id: query.session_id,
            machine_id: query.machine_id,
            visibility: query.visibility.unwrap_or(Visibility::Visible),
        })
        .await;

    let guard = UnsubscribeGuard { id: id.clone(), publisher: Arc::clone(&s.publisher) };
    let connected = Event::default()
        .event("connected")
        .data(json!({ "subscriptionId": id }).to_string());

    let events = stream::unfold(
        (rx, guard),
        |(mut rx, guard): (mpsc::Receiver<SyncEvent>, UnsubscribeGuard)| async move {
            let event = rx.recv().await?;
            let frame = Event::default().json_data(&event).unwrap_or_default();
            Some((Ok::<_, Infallible>(frame), (rx, guard)))
        },
    );
    let stream = stream::iter([Ok::<_, Infallible>(connected)]).chain(events);

    Sse::new(stream).into_response()
}
