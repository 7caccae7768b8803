// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;

fn spec(command: &str, args: &[&str]) -> LaunchSpec {
    LaunchSpec {
        command: command.to_owned(),
        args: args.iter().map(|a| (*a).to_owned()).collect(),
        cwd: None,
        env: vec![],
        signal: CancellationToken::new(),
    }
}

#[tokio::test]
async fn clean_exit_has_no_failure_reason() -> anyhow::Result<()> {
    let result = spawn_with_abort(spec("/bin/sh", &["-c", "exit 0"]))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(result.code, Some(0));
    assert_eq!(result.failure_reason(), None);
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_is_a_local_launch_failure() -> anyhow::Result<()> {
    let result = spawn_with_abort(spec("/bin/sh", &["-c", "exit 7"]))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(result.code, Some(7));
    let reason = result.failure_reason().ok_or_else(|| anyhow::anyhow!("no reason"))?;
    assert!(reason.contains("exit code 7"));
    Ok(())
}

#[tokio::test]
async fn missing_binary_produces_install_hint() {
    let err = spawn_with_abort(spec("definitely-not-a-real-agent", &[])).await.err();
    match err {
        Some(LaunchError::MissingBinary { hint }) => {
            assert!(hint.contains("install the agent CLI"));
        }
        other => assert!(other.is_some(), "spawn unexpectedly succeeded"),
    }
}

#[tokio::test]
async fn abort_signal_terminates_the_child() -> anyhow::Result<()> {
    let signal = CancellationToken::new();
    let mut launch = spec("/bin/sh", &["-c", "sleep 30"]);
    launch.signal = signal.clone();

    let handle = tokio::spawn(spawn_with_abort(launch));
    tokio::time::sleep(Duration::from_millis(200)).await;
    signal.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await??
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    // Killed by signal, not a clean exit.
    assert_ne!(result.code, Some(0));
    Ok(())
}
