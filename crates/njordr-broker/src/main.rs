//! njordr broker - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use njordr_broker::api::api_endpoints;
use njordr_broker::BrokerServer;
use njordr_core::NjordrConfig;
use tracing::info;

/// njordr broker - dispatches work items to service processes
#[derive(Parser, Debug)]
#[command(name = "njordr-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (defaults to $SERVICE_CONFIG_DIR/config.toml)
    #[arg(short, long, env = "NJORDR_CONFIG")]
    config: Option<String>,

    /// Transport host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Transport port
    #[arg(short, long)]
    port: Option<u16>,

    /// Admin API port
    #[arg(long)]
    admin_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "NJORDR_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NjordrConfig::load(args.config.as_deref()).context("loading configuration")?;

    // Override with CLI args
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(admin_port) = args.admin_port {
        config.broker.admin_port = admin_port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    njordr_telemetry::init_logging(&config.logging)?;

    info!("Starting njordr broker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        queue_capacity = config.broker.queue_capacity,
        retry_limit = config.broker.retry_limit,
        heartbeat_timeout_ms = config.broker.heartbeat_timeout_ms,
        dead_grace_ms = config.broker.dead_grace_ms,
        "Broker configuration"
    );

    let server = BrokerServer::bind(config.broker.clone())
        .await
        .with_context(|| format!("binding {}", config.broker.addr()))?;

    if let Some(admin_addr) = server.admin_addr() {
        info!("Admin API on http://{}", admin_addr);
        for endpoint in api_endpoints() {
            info!("  {} {} - {}", endpoint.method, endpoint.path, endpoint.description);
        }
    }

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await?;

    info!("njordr broker stopped");
    Ok(())
}
