//! swap-controller: runs the slot scheduler, or acts as a producer for it.
//!
//! - `run`: schedule models onto slots until SIGINT/SIGTERM, then drain.
//! - `publish`: store one input record for a model and notify the controller.
//! - `pending`: list models that still have stored input.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};

use slotswap_core::ModelId;
use slotswap_queue::{connect_channel, ChannelKind};
use slotswap_storage::{open_store, StoreKind};
use slotswap_swap::error::EXIT_FATAL;
use slotswap_swap::{CommandRunner, ControllerConfig, SwapController, SwapError};

// ── CLI ─────────────────────────────────────────────────────────────

/// Multi-slot model swap scheduler.
#[derive(Parser, Debug)]
#[command(name = "swap-controller", version, about)]
struct Cli {
    /// Path to swap-controller.toml (defaults to ./swap-controller.toml if present).
    #[arg(long, env = "SLOTSWAP_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Override scheduler.concurrency.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Use in-memory channel and store; nothing survives the process.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Append an input record for a model, then notify the controller.
    Publish {
        #[arg(long)]
        model: String,

        /// JSON payload (defaults to null).
        #[arg(long)]
        payload: Option<String>,
    },
    /// Print models that have unconsumed input.
    Pending,
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    slotswap_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,slotswap=debug")),
        )
        .init();

    let cli = Cli::parse();

    let code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("swap-controller failed: {e:#}");
            e.downcast_ref::<SwapError>()
                .map_or(EXIT_FATAL, SwapError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = ControllerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            concurrency,
            ephemeral,
        } => run(config, concurrency, ephemeral).await?,
        Command::Publish { model, payload } => publish(config, model, payload).await?,
        Command::Pending => pending(config).await?,
    }
    Ok(())
}

// ── Subcommands ─────────────────────────────────────────────────────

async fn run(
    mut config: ControllerConfig,
    concurrency: Option<usize>,
    ephemeral: bool,
) -> Result<(), SwapError> {
    if let Some(n) = concurrency {
        config.scheduler.concurrency = n;
    }
    if ephemeral {
        config.channel.kind = ChannelKind::Memory;
        config.spool.kind = StoreKind::Memory;
    }
    config.validate()?;
    config.require_runner_command()?;

    let channel = connect_channel(&config.channel).await?;
    let store = open_store(&config.spool).await?;
    let runner = Arc::new(CommandRunner::new(config.runner.clone()));

    info!(
        concurrency = config.scheduler.concurrency,
        channel = %config.channel.kind,
        command = %config.runner.command,
        "starting swap controller"
    );

    let controller = SwapController::with_runner(
        config.scheduler.clone(),
        runner,
        config.runner.feed_settings(),
        store,
        channel,
    )?;

    let handle = controller.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining slots");
        handle.request_stop();
    });

    controller.run().await
}

async fn publish(config: ControllerConfig, model: String, payload: Option<String>) -> anyhow::Result<()> {
    let model_id = ModelId::new(model);
    model_id.validate()?;

    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw).context("--payload is not valid JSON")?,
        None => Value::Null,
    };

    if config.channel.kind == ChannelKind::Memory || config.spool.kind == StoreKind::Memory {
        warn!("publishing to an in-memory backend; the controller will not see it");
    }

    // Input first, so a notification never arrives ahead of its data.
    let store = open_store(&config.spool).await?;
    let record = store.append(&model_id, payload).await?;

    let channel = connect_channel(&config.channel).await?;
    channel.init().await?;
    channel.publish(&model_id).await?;

    info!(model = %model_id, record = %record.id, "input published");
    println!("{}", record.id);
    Ok(())
}

async fn pending(config: ControllerConfig) -> anyhow::Result<()> {
    let store = open_store(&config.spool).await?;
    for model_id in store.models_with_pending_input().await? {
        println!("{model_id}");
    }

    let channel = connect_channel(&config.channel).await?;
    match channel.health_check().await {
        Ok(health) => info!(%health, "notification channel"),
        Err(e) => warn!(error = %e, "notification channel health check failed"),
    }
    Ok(())
}

// ── Signal handling ─────────────────────────────────────────────────

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
