//! HTTP API for health checks, Prometheus metrics and tracked workloads

use agent_lib::{
    health::{ComponentStatus, HealthRegistry},
    HealthState, StateTracker, TrackedEntry,
};
use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub tracker: Arc<StateTracker>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, tracker: Arc<StateTracker>) -> Self {
        Self {
            health_registry,
            tracker,
        }
    }
}

/// One tracked workload as served by `/api/v1/workloads`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadView {
    pub identity: String,
    pub scope: String,
    pub name: String,
    pub state: HealthState,
    pub previous_state: Option<HealthState>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub last_alert_sent_at: Option<DateTime<Utc>>,
}

impl From<TrackedEntry> for WorkloadView {
    fn from(entry: TrackedEntry) -> Self {
        Self {
            identity: entry.identity.to_string(),
            scope: entry.labels.scope,
            name: entry.labels.name,
            state: entry.current_state,
            previous_state: entry.previous_state,
            first_seen_at: entry.first_seen_at,
            last_seen_at: entry.last_seen_at,
            last_transition_at: entry.last_transition_at,
            last_alert_sent_at: entry.last_alert_sent_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkloadQuery {
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // still monitoring
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once the source has synced
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Tracked workloads, optionally filtered by state
async fn workloads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkloadQuery>,
) -> Response {
    let filter = match query.state.as_deref().map(str::parse::<HealthState>) {
        None => None,
        Some(Ok(wanted)) => Some(wanted),
        Some(Err(e)) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: e })).into_response();
        }
    };

    let views: Vec<WorkloadView> = state
        .tracker
        .snapshot()
        .into_iter()
        .filter(|entry| filter.map_or(true, |wanted| entry.current_state == wanted))
        .map(WorkloadView::from)
        .collect();

    Json(views).into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/workloads", get(workloads))
        .with_state(state)
}

/// Bind the API port on all interfaces
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API port {}", port))?;
    info!(addr = %addr, "API listener bound");
    Ok(listener)
}

/// Serve the API on a bound listener until a shutdown signal arrives
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = ?listener.local_addr().ok(), "Starting API server");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
