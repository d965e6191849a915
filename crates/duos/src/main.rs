#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use duos::config::{Args, ServerConfig};
use duos::metrics::{start_admin_server, HealthState};
use duos::server::ServerState;
use duos::run_with_shutdown;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config: ServerConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        let hub = state.hub.clone();
        async move {
            if let Err(e) = start_admin_server(config.admin_addr, hub, health_state).await {
                warn!("admin server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    drop(shutdown_tx);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
    }
    Ok(())
}
