use crate::abuse::Report;
use crate::hub::Hub;
use crate::matchmaker::EngineStats;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use duo_common::SessionId;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Ban list response.
#[derive(Serialize)]
struct BansResponse {
    count: usize,
    bans: Vec<SessionId>,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that starts out ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready or draining.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// State shared by the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    hub: Arc<Hub>,
    health: HealthState,
}

impl AdminState {
    /// Bundle the hub and readiness flag for the admin routes.
    #[must_use]
    pub fn new(hub: Arc<Hub>, health: HealthState) -> Self {
        Self { hub, health }
    }
}

/// Health, readiness and read-only admin routes, without `/metrics`.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/admin/reports", get(reports_handler))
        .route("/admin/bans", get(bans_handler))
        .route("/admin/stats", get(stats_handler))
        .with_state(state)
}

/// Install the Prometheus recorder and serve `/metrics` next to the admin
/// routes on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_admin_server(
    addr: SocketAddr,
    hub: Arc<Hub>,
    health: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = admin_router(AdminState::new(hub, health)).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("admin server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Returns 200 while the process is up.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Returns 200 if ready, 503 while draining.
async fn ready_handler(State(state): State<AdminState>) -> (StatusCode, Json<ReadyResponse>) {
    if state.health.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

async fn reports_handler(State(state): State<AdminState>) -> Json<Vec<Report>> {
    Json(state.hub.reports())
}

async fn bans_handler(State(state): State<AdminState>) -> Json<BansResponse> {
    let bans = state.hub.bans();
    Json(BansResponse {
        count: bans.len(),
        bans,
    })
}

async fn stats_handler(State(state): State<AdminState>) -> Json<EngineStats> {
    Json(state.hub.stats())
}

/// Session and connection gauges.
pub mod gauges {
    /// Set the live session gauge.
    pub fn set_sessions_active(count: usize) {
        metrics::gauge!("duo_sessions_active").set(count as f64);
    }

    /// Increment the open WebSocket connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("duo_connections_active").increment(1.0);
    }

    /// Decrement the open WebSocket connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("duo_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    use crate::ratelimit::Action;

    /// Increment the pairs-formed counter.
    pub fn matches_total() {
        metrics::counter!("duo_matches_total").increment(1);
    }

    /// Record one relayed handshake payload of the given kind.
    pub fn relayed_total(kind: &'static str) {
        metrics::counter!("duo_relayed_total", "kind" => kind).increment(1);
    }

    /// Increment the filed-reports counter.
    pub fn reports_total() {
        metrics::counter!("duo_reports_total").increment(1);
    }

    /// Increment the bans counter.
    pub fn bans_total() {
        metrics::counter!("duo_bans_total").increment(1);
    }

    /// Record sessions removed by the liveness sweep.
    pub fn sessions_reaped_total(count: u64) {
        metrics::counter!("duo_sessions_reaped_total").increment(count);
    }

    /// Record a refused `action` with the given reason label.
    pub fn rejections_total(reason: &'static str, action: Action) {
        metrics::counter!(
            "duo_rejections_total",
            "reason" => reason,
            "action" => action.as_str()
        )
        .increment(1);
    }

    /// Record an event that was not delivered, with the given reason label.
    pub fn events_dropped_total(reason: &'static str) {
        metrics::counter!("duo_events_dropped_total", "reason" => reason).increment(1);
    }
}
