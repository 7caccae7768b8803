// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario tests across the hub and runner crates.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::json;

use hapi_hub::events::{SubscribeOptions, SyncEvent, Visibility};
use hapi_hub::push::PushIntent;
use hapi_hub::store::sessions::NewSession;
use hapi_hub::sync::cache::KeepAlive;
use hapi_hub::sync::engine::{RestartStatus, SpawnOptions};
use hapi_runner::agent::convert::{AgentEvent, EventConverter};
use hapi_runner::agent::transport::AgentNotification;

use hapi_specs::{simple_runner_script, Hub, RecordingPush, ScriptedRunner, TOKEN};

fn notify(method: &str, params: serde_json::Value) -> AgentNotification {
    AgentNotification { method: method.to_owned(), params }
}

// -- S1: deltas merged ---------------------------------------------------------

#[test]
fn s1_agent_message_deltas_emit_one_event() {
    let mut converter = EventConverter::new();
    for delta in ["Hey", "Hey!", "Hey! 👋"] {
        let events = converter.handle(&notify(
            "item/agentMessage/delta",
            json!({"itemId": "m", "delta": delta}),
        ));
        assert!(events.is_empty());
    }

    let events = converter.handle(&notify(
        "item/completed",
        json!({"item": {"id": "m", "type": "agentMessage"}}),
    ));
    assert_eq!(
        events,
        vec![AgentEvent::AgentMessage { id: "m".to_owned(), message: "Hey! 👋".to_owned() }]
    );
}

// -- S2: wrapped command decode ------------------------------------------------

#[test]
fn s2_wrapped_exec_command_round_trip() {
    let mut converter = EventConverter::new();

    let begin = converter.handle(&notify(
        "codex/event/exec_command_begin",
        json!({"msg": {"call_id": "c", "command": ["/bin/zsh", "-lc", "echo ok"]}}),
    ));
    assert_eq!(
        begin,
        vec![AgentEvent::ExecCommandBegin {
            call_id: "c".to_owned(),
            command: "/bin/zsh -lc echo ok".to_owned(),
            cwd: None,
        }]
    );

    let chunk = base64::engine::general_purpose::STANDARD.encode("ok");
    converter.handle(&notify(
        "codex/event/exec_command_output_delta",
        json!({"msg": {"call_id": "c", "chunk": chunk}}),
    ));
    let end = converter.handle(&notify(
        "codex/event/exec_command_end",
        json!({"msg": {"call_id": "c", "exit_code": 0}}),
    ));
    assert_eq!(
        end,
        vec![AgentEvent::ExecCommandEnd {
            call_id: "c".to_owned(),
            output: "ok".to_owned(),
            exit_code: Some(0),
        }]
    );
}

// -- S3: resume with retry -----------------------------------------------------

#[tokio::test]
async fn s3_restart_retries_retryable_resume_once() -> anyhow::Result<()> {
    let hub = Hub::new()?;

    let mut ids = Vec::new();
    for tag in ["a", "b"] {
        let (session, _) = hub.state.store.get_or_create_session(NewSession {
            tag: Some(tag.to_owned()),
            namespace: "default".to_owned(),
            machine_id: Some("machine-1".to_owned()),
            metadata: json!({"claudeSessionId": format!("resume-{tag}"), "directory": "/w"}),
            ..Default::default()
        })?;
        ids.push(session.id);
    }

    let mut methods: Vec<String> = ids.iter().map(|id| format!("{id}:killSession")).collect();
    methods.push("machine-1:spawn-happy-session".to_owned());

    let flaky_gate = Arc::new(parking_lot::Mutex::new(0usize));
    let runner = {
        let flaky_gate = Arc::clone(&flaky_gate);
        ScriptedRunner::attach(
            &hub,
            "machine-1",
            &methods,
            Box::new(move |method, _| {
                if method.ends_with(":killSession") {
                    return json!({"type": "success"});
                }
                let mut spawns = flaky_gate.lock();
                *spawns += 1;
                if *spawns == 1 {
                    // First spawn attempt for session A fails retryably.
                    json!({"type": "error", "errorCode": "resume_failed"})
                } else {
                    json!({"type": "success", "sessionId": "resumed"})
                }
            }),
        )
        .await
    };

    let outcomes = hub
        .state
        .engine
        .restart_sessions("default", Some(ids.as_slice()))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].session_id, ids[0]);
    assert_eq!(outcomes[0].status, RestartStatus::Restarted);
    assert_eq!(outcomes[1].session_id, ids[1]);
    assert_eq!(outcomes[1].status, RestartStatus::Restarted);

    // Two spawn attempts for A, one for B; kills strictly precede their
    // session's spawns.
    let calls = runner.calls.lock().await.clone();
    let spawns = calls.iter().filter(|m| m.ends_with("spawn-happy-session")).count();
    assert_eq!(spawns, 3);
    assert_eq!(calls[0], format!("{}:killSession", ids[0]));
    assert_eq!(
        calls.last().map(String::as_str),
        Some("machine-1:spawn-happy-session")
    );
    Ok(())
}

// -- S4: expiry broadcast ------------------------------------------------------

#[tokio::test]
async fn s4_expiry_broadcast_clears_active_and_thinking() -> anyhow::Result<()> {
    let hub = Hub::new()?;
    let (session, _) = hub.state.store.get_or_create_session(NewSession {
        tag: Some("spinner".to_owned()),
        namespace: "default".to_owned(),
        metadata: json!({}),
        ..Default::default()
    })?;

    let (_sub, mut rx) = hub
        .state
        .publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;

    hub.state
        .cache
        .handle_session_alive(KeepAlive {
            session_id: session.id.clone(),
            namespace: "default".to_owned(),
            time: 0,
            thinking: Some(true),
        })
        .await;
    let _ = rx.try_recv()?;

    let expired = hub.state.cache.expire_inactive(31_000).await;
    assert_eq!(expired, vec![session.id.clone()]);

    match rx.try_recv()? {
        SyncEvent::SessionUpdated { session_id, data, .. } => {
            assert_eq!(session_id, session.id);
            assert_eq!(data, json!({"active": false, "thinking": false}));
        }
        other => anyhow::bail!("unexpected event {other:?}"),
    }
    // Exactly one broadcast.
    assert!(rx.try_recv().is_err());
    Ok(())
}

// -- S5: message LWW and merge -------------------------------------------------

#[tokio::test]
async fn s5_merge_moves_renumbers_and_resolves_local_ids() -> anyhow::Result<()> {
    let hub = Hub::new()?;
    let store = &hub.state.store;

    let (a, _) = store.get_or_create_session(NewSession {
        tag: Some("a".to_owned()),
        namespace: "default".to_owned(),
        metadata: json!({}),
        ..Default::default()
    })?;
    let (b, _) = store.get_or_create_session(NewSession {
        tag: Some("b".to_owned()),
        namespace: "default".to_owned(),
        metadata: json!({}),
        ..Default::default()
    })?;

    store.add_message(&a.id, &json!({"label": "to-collide"}), Some("same"))?;
    store.add_message(&a.id, &json!({"label": "to-only"}), Some("to-only"))?;
    store.add_message(&b.id, &json!({"label": "from-collide"}), Some("same"))?;
    store.add_message(&b.id, &json!({"label": "from-unique"}), Some("from-only"))?;

    let outcome = store.merge_session_messages(&b.id, &a.id)?;
    assert_eq!(outcome.moved, 2);
    assert_eq!(outcome.old_max_seq, 2);
    assert_eq!(outcome.new_max_seq, 2);

    let merged = store.get_messages(&a.id, 50, None)?;
    let seqs: Vec<i64> = merged.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    let collided = merged
        .iter()
        .find(|m| m.content["label"] == "from-collide")
        .ok_or_else(|| anyhow::anyhow!("moved row missing"))?;
    assert_eq!(collided.local_id, None);
    let unique = merged
        .iter()
        .find(|m| m.content["label"] == "from-unique")
        .ok_or_else(|| anyhow::anyhow!("moved row missing"))?;
    assert_eq!(unique.local_id.as_deref(), Some("from-only"));
    Ok(())
}

// -- S6: QR login over HTTP ----------------------------------------------------

#[tokio::test]
async fn s6_qr_login_hands_out_the_token_once() -> anyhow::Result<()> {
    let hub = Hub::new()?;
    let server = hub.server()?;

    let resp = server.post("/qr").await;
    resp.assert_status_ok();
    let created: serde_json::Value = resp.json();
    let id = created["id"].as_str().unwrap_or_default().to_owned();
    let secret = created["secret"].as_str().unwrap_or_default().to_owned();

    let resp = server.get(&format!("/qr/{id}")).add_query_param("s", &secret).await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "pending");

    let resp = server
        .post(&format!("/qr/{id}/confirm"))
        .add_query_param("s", &secret)
        .authorization_bearer(format!("{TOKEN}:team"))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["ok"], true);

    let resp = server.get(&format!("/qr/{id}")).add_query_param("s", &secret).await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["accessToken"], format!("{TOKEN}:team"));

    let resp = server.get(&format!("/qr/{id}")).add_query_param("s", &secret).await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "expired");
    Ok(())
}

// -- Initial prompt delivery ---------------------------------------------------

#[tokio::test]
async fn initial_prompt_is_delivered_after_first_keepalive() -> anyhow::Result<()> {
    let hub = Hub::new()?;
    // A UUID session id: the hub's first-observation claim adopts it as
    // the row id, so keepalives and messages line up.
    let session_id = uuid::Uuid::new_v4().to_string();

    let _runner = ScriptedRunner::attach(
        &hub,
        "machine-1",
        &["machine-1:spawn-happy-session".to_owned()],
        simple_runner_script(&session_id),
    )
    .await;

    {
        let cache = Arc::clone(&hub.state.cache);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cache
                .handle_session_alive(KeepAlive {
                    session_id,
                    namespace: "default".to_owned(),
                    time: 1,
                    thinking: None,
                })
                .await;
        });
    }

    let outcome = hub
        .state
        .engine
        .spawn_session(
            "default",
            SpawnOptions {
                machine_id: "machine-1".to_owned(),
                directory: "/work".to_owned(),
                agent: None,
                worktree_name: None,
                yolo: false,
                resume_session_id: None,
                initial_prompt: Some("write the tests".to_owned()),
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(outcome.session_id, session_id);
    let messages = hub.state.store.get_messages(&session_id, 10, None)?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content["meta"]["sentFrom"], "spawn");
    Ok(())
}

// -- Toast fallback ------------------------------------------------------------

#[tokio::test]
async fn toast_falls_back_to_push_only_when_invisible() -> anyhow::Result<()> {
    let provider = RecordingPush::new(false);
    let hub = Hub::with_push(Arc::clone(&provider))?;
    hub.state
        .store
        .add_push_subscription("default", "https://push/ep", &json!({}))?;

    // Nobody watching: provider invoked exactly once.
    hub.state
        .push
        .notify("default", "s1", PushIntent::Ready, "Ready", "waiting")
        .await;
    assert_eq!(provider.sent.lock().len(), 1);

    // With a visible subscription the provider is not consulted again.
    let (_sub, _rx) = hub
        .state
        .publisher
        .subscribe(SubscribeOptions {
            namespace: "default".to_owned(),
            all: true,
            session_id: None,
            machine_id: None,
            visibility: Visibility::Visible,
        })
        .await;
    hub.state
        .push
        .notify("default", "s1", PushIntent::Ready, "Ready", "waiting")
        .await;
    assert_eq!(provider.sent.lock().len(), 1);
    Ok(())
}

// -- Wire compatibility between the crates -------------------------------------

#[test]
fn runner_frames_parse_as_hub_frames() -> anyhow::Result<()> {
    let frames = vec![
        hapi_runner::wire::RunnerFrame::Register {
            methods: vec!["m1:spawn-happy-session".to_owned()],
        },
        hapi_runner::wire::RunnerFrame::SessionAlive {
            session_id: "s1".to_owned(),
            time: 42,
            thinking: Some(true),
        },
        hapi_runner::wire::RunnerFrame::AgentEvent {
            session_id: "s1".to_owned(),
            event: json!({"type": "task_started"}),
        },
        hapi_runner::wire::RunnerFrame::PermissionRequest {
            session_id: "s1".to_owned(),
            request_id: "r1".to_owned(),
            request: json!({"title": "run ls"}),
        },
    ];
    for frame in frames {
        let text = serde_json::to_string(&frame)?;
        let parsed: hapi_hub::sync::rpc::RunnerFrame = serde_json::from_str(&text)?;
        let round = serde_json::to_string(&parsed)?;
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&text)?,
            serde_json::from_str::<serde_json::Value>(&round)?
        );
    }

    let hub_frame = hapi_hub::sync::rpc::HubFrame::PermissionReply {
        request_id: "r1".to_owned(),
        outcome: json!({"outcome": {"outcome": "selected", "optionId": "allow"}}),
    };
    let text = serde_json::to_string(&hub_frame)?;
    let _parsed: hapi_runner::wire::HubFrame = serde_json::from_str(&text)?;
    Ok(())
}
