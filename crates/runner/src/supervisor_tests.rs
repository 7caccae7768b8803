// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::agent::transport::AgentLaunch;
use crate::wire::RunnerFrame;

use super::*;

fn request(directory: &str) -> SpawnRequest {
    SpawnRequest {
        directory: directory.to_owned(),
        agent: Some("claude".to_owned()),
        worktree_name: None,
        yolo: false,
        resume_session_id: None,
        started_by: StartedBy::Runner,
    }
}

fn sh(script: &str) -> AgentLaunch {
    AgentLaunch {
        command: "/bin/sh".to_owned(),
        args: vec!["-c".to_owned(), script.to_owned()],
        cwd: None,
        env: vec![],
    }
}

async fn next_frame(
    rx: &mut mpsc::UnboundedReceiver<RunnerFrame>,
) -> anyhow::Result<RunnerFrame> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("frame stream closed"))
}

#[test]
fn agent_launch_maps_flags() {
    let mut req = request("/work");
    req.resume_session_id = Some("resume-1".to_owned());
    req.yolo = true;
    let launch = agent_launch(&req);
    assert_eq!(launch.command, "claude");
    assert_eq!(
        launch.args,
        vec!["--resume", "resume-1", "--dangerously-skip-permissions"]
    );
    assert_eq!(launch.cwd.as_deref(), Some(std::path::Path::new("/work")));
}

#[tokio::test]
async fn spawn_registers_methods_and_streams_events() -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new("m1", tx);

    let sid = supervisor
        .spawn_with_launch(
            request("/work"),
            sh(r#"printf '{"method":"turn/started","params":{}}\n'; sleep 0.3"#),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // Register, then initial alive.
    match next_frame(&mut rx).await? {
        RunnerFrame::Register { methods } => {
            assert!(methods.contains(&format!("{sid}:killSession")));
        }
        other => anyhow::bail!("unexpected frame {other:?}"),
    }
    assert!(matches!(next_frame(&mut rx).await?, RunnerFrame::SessionAlive { .. }));

    // turn/started drives thinking=true then the task_started event.
    match next_frame(&mut rx).await? {
        RunnerFrame::SessionAlive { thinking, .. } => assert_eq!(thinking, Some(true)),
        other => anyhow::bail!("unexpected frame {other:?}"),
    }
    match next_frame(&mut rx).await? {
        RunnerFrame::AgentEvent { session_id, event } => {
            assert_eq!(session_id, sid);
            assert_eq!(event["type"], "task_started");
        }
        other => anyhow::bail!("unexpected frame {other:?}"),
    }

    // Child exit tears the session down.
    loop {
        match next_frame(&mut rx).await? {
            RunnerFrame::SessionEnd { session_id, .. } => {
                assert_eq!(session_id, sid);
                break;
            }
            RunnerFrame::Unregister { .. }
            | RunnerFrame::SessionAlive { .. }
            | RunnerFrame::AgentEvent { .. } => continue,
            other => anyhow::bail!("unexpected frame {other:?}"),
        }
    }
    assert!(supervisor.list_sessions().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn kill_rpc_ends_the_session() -> anyhow::Result<()> {
    let (tx, _rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new("m1", tx);
    let sid = supervisor
        .spawn_with_launch(request("/work"), sh("sleep 30"))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let reply = supervisor
        .handle_rpc(&format!("{sid}:killSession"), json!({}))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(reply["type"], "success");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(supervisor.list_sessions().await.is_empty());

    // A second kill finds nothing.
    let err = supervisor.handle_rpc(&format!("{sid}:killSession"), json!({})).await;
    assert!(err.is_err());
    Ok(())
}

#[tokio::test]
async fn spawn_rpc_reports_resume_failures_as_retryable() -> anyhow::Result<()> {
    let (tx, _rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new("m1", tx);

    let reply = supervisor
        .handle_rpc(
            "m1:spawn-happy-session",
            json!({
                "type": "spawn-in-directory",
                "directory": "/work",
                "agent": "definitely-not-installed-cli",
                "resumeSessionId": "r1",
            }),
        )
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["errorCode"], "resume_failed");

    // Without a resume token the code is a plain spawn failure.
    let reply = supervisor
        .handle_rpc(
            "m1:spawn-happy-session",
            json!({
                "type": "spawn-in-directory",
                "directory": "/work",
                "agent": "definitely-not-installed-cli",
            }),
        )
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(reply["errorCode"], "spawn_failed");
    Ok(())
}

#[tokio::test]
async fn wrong_machine_scope_is_rejected() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new("m1", tx);
    let err = supervisor
        .handle_rpc("m2:spawn-happy-session", json!({"directory": "/work"}))
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn permission_round_trip_through_hub_frames() -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new("m1", tx);

    // Agent asks for permission, then announces a turn only if the reply
    // carried the selected option.
    let sid = supervisor
        .spawn_with_launch(
            request("/work"),
            sh(r#"printf '{"jsonrpc":"2.0","id":1,"method":"session/request_permission","params":{"title":"run ls"}}\n'
                read reply
                case "$reply" in
                  *selected*) printf '{"method":"turn/started","params":{}}\n' ;;
                esac
                sleep 0.5"#),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // Find the permission request frame and answer it.
    let request_id = loop {
        match next_frame(&mut rx).await? {
            RunnerFrame::PermissionRequest { session_id, request_id, request } => {
                assert_eq!(session_id, sid);
                assert_eq!(request["title"], "run ls");
                break request_id;
            }
            _ => continue,
        }
    };
    supervisor
        .resolve_permission(
            &request_id,
            json!({ "outcome": { "outcome": "selected", "optionId": "allow" } }),
        )
        .await;

    // The agent received the outcome: it announced the turn it was allowed
    // to run.
    let mut saw_turn = false;
    loop {
        match next_frame(&mut rx).await? {
            RunnerFrame::AgentEvent { event, .. } if event["type"] == "task_started" => {
                saw_turn = true;
            }
            RunnerFrame::SessionEnd { .. } => break,
            _ => continue,
        }
    }
    assert!(saw_turn, "agent never saw the selected outcome");
    Ok(())
}
