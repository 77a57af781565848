use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing_subscriber::prelude::*;

use urza::channels::{TelegramTransport, Transport};
use urza::config::{
    DatabaseConfig, LoggingConfig, OrchestratorConfig, PublisherConfig, QueueConfig,
    ReconcileConfig, TelegramConfig,
};
use urza::intake::Intake;
use urza::orchestrator::Orchestrator;
use urza::protocol::ProtocolHandler;
use urza::publisher::Publisher;
use urza::queue::{LibSqlWorkQueue, WorkQueue};
use urza::store::LibSqlBackend;

/// How long services get to finish their current cycle after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "urza", version, about = "Task orchestration for chat-connected worker bots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cron evaluator and timeout monitor
    Orchestrator,
    /// Broadcast queued executions to the Telegram channel
    Publisher,
    /// Listen for worker commands on the Telegram channel
    Bot,
    /// Run every service in one process
    All,
    /// Re-queue PENDING executions that never reached the publisher
    Reconcile,
}

/// Spawned service loops and their shutdown flags.
#[derive(Default)]
struct Services {
    handles: Vec<JoinHandle<()>>,
    flags: Vec<Arc<AtomicBool>>,
}

impl Services {
    fn add(&mut self, handles: impl IntoIterator<Item = JoinHandle<()>>, flag: Arc<AtomicBool>) {
        self.handles.extend(handles);
        self.flags.push(flag);
    }

    async fn shutdown(self) {
        for flag in &self.flags {
            flag.store(true, Ordering::Relaxed);
        }
        for mut handle in self.handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                tracing::warn!("Service did not stop within {}s; aborting", SHUTDOWN_GRACE.as_secs());
                handle.abort();
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&LoggingConfig::from_env());

    // ── Database + queue ────────────────────────────────────────────────
    let db_config = DatabaseConfig::from_env();
    let store = Arc::new(
        LibSqlBackend::new_local(&db_config.path)
            .await
            .with_context(|| format!("failed to open database at {}", db_config.path.display()))?,
    );
    let queue_config = QueueConfig::from_env();
    let queue = Arc::new(LibSqlWorkQueue::new(
        store.connection_source(),
        queue_config.name,
    ));

    if let Commands::Reconcile = cli.command {
        let reconcile = ReconcileConfig::from_env()?;
        let intake = Intake::new(store.clone(), queue.clone());
        let requeued = intake
            .reconcile_pending(reconcile.stale_after, Utc::now())
            .await?;
        println!("Re-queued {requeued} stale PENDING execution(s)");
        println!("Queue '{}' length: {}", queue.name(), queue.len().await?);
        return Ok(());
    }

    let run_orchestrator = matches!(cli.command, Commands::Orchestrator | Commands::All);
    let run_publisher = matches!(cli.command, Commands::Publisher | Commands::All);
    let run_bot = matches!(cli.command, Commands::Bot | Commands::All);

    let mut services = Services::default();

    if run_orchestrator {
        let config = OrchestratorConfig::from_env()?;
        let orchestrator = Arc::new(Orchestrator::new(config, store.clone(), queue.clone()));
        let (handles, flag) = orchestrator.spawn();
        services.add(handles, flag);
    }

    // ── Telegram ────────────────────────────────────────────────────────
    let mut transport: Option<Arc<dyn Transport>> = None;
    if run_publisher || run_bot {
        let telegram = TelegramConfig::from_env()?;
        let client: Arc<dyn Transport> = Arc::new(TelegramTransport::new(telegram.bot_token));
        client
            .connect()
            .await
            .context("failed to connect to Telegram")?;

        if run_publisher {
            let publisher = Arc::new(Publisher::new(
                PublisherConfig::from_env()?,
                telegram.channel_id.clone(),
                store.clone(),
                queue.clone(),
                Arc::clone(&client),
            ));
            let (handle, flag) = publisher.spawn();
            services.add([handle], flag);
        }

        if run_bot {
            let handler = Arc::new(ProtocolHandler::new(store.clone()));
            let (handle, flag) = handler
                .spawn(Arc::clone(&client), &telegram.channel_id)
                .await?;
            services.add([handle], flag);
        }

        transport = Some(client);
    }

    tracing::info!("Urza v{} running; Ctrl-C to stop", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    if let Some(transport) = &transport {
        if let Err(e) = transport.disconnect().await {
            tracing::warn!("Transport disconnect failed: {e}");
        }
    }
    services.shutdown().await;

    Ok(())
}

/// Stdout logging filtered by `RUST_LOG`, plus a daily rolling file when a
/// log directory is configured. Keep the returned guard alive to flush it.
fn init_tracing(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "urza.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
