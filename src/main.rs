use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::Level;

use parley_core::content::ContentBlock;
use parley_core::ids::ConversationId;
use parley_core::turn::TurnRequest;
use parley_engine::orchestrator::{OrchestratorConfig, TurnOrchestrator};
use parley_engine::permissions::{PermissionConfig, PermissionGateway};
use parley_engine::process::ProcessBackend;
use parley_engine::store::InMemoryConversationStore;
use parley_server::bridge::RpcNotificationSink;
use parley_server::rpc::RpcResponse;
use parley_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Run one conversational turn against a CLI agent and print every outgoing
/// JSON-RPC message as a line on stdout.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about, long_about = None)]
struct Args {
    /// Prompt text sent as the turn's content
    prompt: String,

    /// Agent command and its arguments, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,

    /// Conversation id
    #[arg(long, default_value = "cli")]
    conversation: String,

    /// Working directory for the agent process
    #[arg(long)]
    cwd: Option<String>,

    /// Extra environment for the agent process, as `KEY=VALUE` (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Stream agent output line by line
    #[arg(long)]
    streaming: bool,

    #[arg(long, default_value_t = 12)]
    heartbeat_secs: u64,

    /// How long a permission request may stay unanswered
    #[arg(long, default_value_t = 300_000)]
    permission_timeout_ms: u64,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// `json` or `compact`
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Log a metrics snapshot when the turn ends
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        format: args.log_format,
        metrics_enabled: args.metrics,
        ..TelemetryConfig::default()
    });

    let (program, program_args) = args
        .command
        .split_first()
        .context("an agent command is required after `--`")?;
    let mut backend = ProcessBackend::new(program.clone(), program_args.to_vec());
    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid --env `{pair}`, expected KEY=VALUE"))?;
        backend = backend.with_env(key, value);
    }
    let backend = Arc::new(backend);

    let conversation_id = ConversationId::from_raw(&args.conversation);
    let store = Arc::new(InMemoryConversationStore::new());
    let _ = store.create(conversation_id.clone(), args.cwd.as_deref());

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    // No prompter: permission requests resolve to the default for their tool kind.
    let mut gateway = PermissionGateway::new(PermissionConfig {
        timeout: Duration::from_millis(args.permission_timeout_ms),
    });
    if let Some(metrics) = telemetry.metrics() {
        gateway = gateway.with_metrics(metrics);
    }

    let sink = Arc::new(RpcNotificationSink::new(tx.clone()));
    let config = OrchestratorConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        streaming_default: args.streaming,
    };
    let gateway = Arc::new(gateway);
    let orchestrator = match telemetry.metrics() {
        Some(metrics) => TurnOrchestrator::instrumented(backend, store, sink, gateway, config, metrics),
        None => TurnOrchestrator::new(backend, store, sink, gateway, config),
    };

    tracing::info!(conversation_id = %conversation_id, program = %program, "starting turn");
    let request = TurnRequest::new(conversation_id, vec![ContentBlock::text(args.prompt)])
        .streaming(args.streaming);

    let outcome = tokio::select! {
        result = orchestrator.submit_turn(request) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, cancelling");
            orchestrator.shutdown();
            return Ok(());
        }
    };

    let response = match &outcome {
        Ok(resp) => RpcResponse::success(Some(1.into()), serde_json::to_value(resp)?),
        Err(e) => RpcResponse::internal_error(Some(1.into()), e.to_string()),
    };
    let _ = tx.send(serde_json::to_string(&response)?);
    drop(tx);
    drop(orchestrator);
    writer.await.context("stdout writer panicked")??;

    if let Some(metrics) = telemetry.metrics() {
        for sample in metrics.snapshot() {
            tracing::info!(name = %sample.name, value = sample.value, labels = ?sample.labels, "metric");
        }
    }

    outcome.map(|_| ()).context("turn failed")
}
