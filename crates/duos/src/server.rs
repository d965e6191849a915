use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::DuoError;
use crate::hub::Hub;
use crate::reaper::spawn_reaper;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long in-flight connections get to finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the pairing server.
pub struct ServerState {
    /// Pairing engine and per-session outbound channels.
    pub hub: Arc<Hub>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Open WebSocket connections.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Build fresh state with an empty engine governed by `config.policy`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.policy.clone())),
            config,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), DuoError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop and the liveness reaper until `shutdown` fires.
///
/// Shutdown stops accepting, stops the reaper, and waits up to 30 seconds
/// for in-flight connections to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), DuoError> {
    let local_addr = listener.local_addr()?;
    info!("server listening on {}", local_addr);

    let reaper = spawn_reaper(
        state.hub.clone(),
        state.config.policy.reap_interval,
        shutdown.clone(),
    );
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            // Reap finished tasks so the set stays small
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => {
                info!("shutdown signal received, draining {} connections", connections.len());
                break;
            }
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            connections.len()
        );
        connections.abort_all();
    }
    if let Err(e) = reaper.await {
        warn!("reaper task ended abnormally: {}", e);
    }

    info!("server shut down gracefully");
    Ok(())
}
