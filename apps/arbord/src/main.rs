use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use arbor_kernel::{CommandOutcome, KernelBuilder, KernelConfig};
use arbor_protocol::{SessionId, SessionOptions};
use clap::Parser;
use futures_util::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "arbord")]
#[command(about = "Arbor kernel demo daemon")]
struct Cli {
    /// TOML config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `root` from the config file.
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, default_value = "developer")]
    owner: String,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    init_tracing(&config.log_level, cli.log_json);

    let kernel = KernelBuilder::from_config(config).build()?;
    let gateway = kernel.gateway().clone();
    let credential = kernel.issue_client_credential(&cli.owner, "res://session/*", None)?;

    let session_id = SessionId::new_uuid();
    let summary = gateway
        .create_session(
            &credential,
            session_id.clone(),
            SessionOptions::owned_by(cli.owner.clone()),
        )
        .await?;
    info!(session_id = %summary.session_id, topic = %summary.topic, "session created");

    let mut events = gateway.subscribe(&credential, &session_id)?;
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let rendered = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
            info!(event = %rendered, "session event");
        }
    });

    let pong = gateway
        .execute_command(&credential, &session_id, "ping", json!({}))
        .await?;
    info!(outcome = ?pong, "ping");

    let mut pending = Vec::new();
    for (command, args) in [
        (
            "calculate",
            json!({ "operation": "mean", "numbers": [2, 4, 4, 4, 5, 5, 7, 9] }),
        ),
        ("long_running", json!({ "steps": 4, "step_ms": 150 })),
    ] {
        match gateway
            .execute_command(&credential, &session_id, command, args)
            .await?
        {
            CommandOutcome::Async { execution_id, .. } => {
                info!(command, %execution_id, "execution accepted");
                pending.push(execution_id);
            }
            CommandOutcome::Sync { result } => bail!("{command} answered inline: {result}"),
        }
    }

    for execution_id in &pending {
        let view = loop {
            let view = gateway
                .execution_status(&credential, &session_id, execution_id)
                .await?;
            if view.status.is_finished() {
                break view;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        info!(%execution_id, status = ?view.status, output = ?view.output, "execution finished");
    }

    gateway.stop_session(&credential, &session_id).await?;
    if let Err(error) = event_task.await {
        warn!(%error, "event task stopped");
    }
    kernel.shutdown().await;
    Ok(())
}
