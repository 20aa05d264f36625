//! njordr service - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use njordr_core::NjordrConfig;
use njordr_service::{start_identities, HandlerRegistry};
use std::sync::Arc;
use tracing::{error, info};

/// njordr service - executes work items handed out by the broker
#[derive(Parser, Debug)]
#[command(name = "njordr-service")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (defaults to $SERVICE_CONFIG_DIR/config.toml)
    #[arg(short, long, env = "NJORDR_CONFIG")]
    config: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long, env = "NJORDR_WORKER_ID")]
    worker_id: Option<String>,

    /// Broker transport address
    #[arg(short, long, env = "NJORDR_BROKER_ADDR")]
    broker: Option<String>,

    /// Number of worker identities to run
    #[arg(short = 'n', long, env = "NJORDR_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "NJORDR_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NjordrConfig::load(args.config.as_deref()).context("loading configuration")?;

    // Override with CLI args
    if let Some(worker_id) = args.worker_id {
        config.service.id = Some(worker_id);
    }
    if let Some(broker) = args.broker {
        config.service.broker_addr = broker;
    }
    if let Some(concurrency) = args.concurrency {
        config.service.concurrency = concurrency;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    njordr_telemetry::init_logging(&config.logging)?;

    info!("Starting njordr service v{}", env!("CARGO_PKG_VERSION"));
    info!(broker = %config.service.broker_addr, "Broker");

    let handlers = Arc::new(HandlerRegistry::with_builtins().await);
    info!("Registered job handlers: {}", handlers.names().await.join(", "));

    // One broker identity per concurrency slot
    let runtimes = start_identities(&config.service, handlers)
        .await
        .context("registering workers")?;
    let count = runtimes.len();

    let shutdown: Vec<_> = runtimes.iter().map(|r| r.shutdown_handle()).collect();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                for handle in &shutdown {
                    handle.shutdown();
                }
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    info!(workers = count, "njordr service ready");

    let mut failed = false;
    for result in join_all(runtimes.into_iter().map(|r| r.run())).await {
        if let Err(e) = result {
            error!(error = %e, "Worker exited with error");
            failed = true;
        }
    }

    if failed {
        anyhow::bail!("one or more workers lost the broker");
    }
    info!("njordr service stopped");
    Ok(())
}
