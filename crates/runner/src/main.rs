// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use hapi_runner::config::{Cli, RunnerCommand};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(cli.config.log_level.clone())
            }),
        )
        .init();

    let result = match cli.command {
        RunnerCommand::Start => hapi_runner::start_detached(&cli.config),
        RunnerCommand::StartSync => hapi_runner::run(cli.config).await,
        RunnerCommand::Launch { agent, directory, args } => {
            hapi_runner::launch_foreground(&agent, directory, args).await
        }
    };

    if let Err(e) = result {
        error!("fatal: {e:#}");
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
