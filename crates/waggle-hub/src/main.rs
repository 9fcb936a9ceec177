//! waggle-hub binary.
//!
//! Loads configuration, wires the hub, and serves the HTTP surface until
//! ctrl-c. Exit code 0 on clean shutdown, non-zero on initialization
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use waggle_hub::{routes, Hub, HubConfig};

#[derive(Parser, Debug)]
#[command(name = "waggle-hub", version, about = "Collective-intelligence hub for drone swarms")]
struct Args {
    /// Path to config.json (falls back to CONFIG_PATH, then config/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    waggle_telemetry::init();

    if let Err(e) = run(Args::parse()).await {
        error!(error = %e, "hub failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = HubConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let hub = Hub::build(config)?;
    hub.spawn_background();

    let addr = format!("{}:{}", hub.config.server.host, hub.config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        tls = hub.config.security.tls.enabled,
        "waggle hub listening"
    );

    let app = routes::router(hub.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    hub.shutdown();
    Ok(())
}
