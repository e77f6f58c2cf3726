//! REST introspection API
//!
//! Three read-only endpoints exposing pool and monitor state. Anything
//! other than GET on a route answers 405 via axum's method routing.

use crate::health::{HealthStatus, Monitor};
use crate::resolver::{Pool, Resolver, ResolverStatus};
use crate::Result;
use axum::{extract::State, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub monitor: Arc<Monitor>,
}

/// One resolver in `GET /resolvers`
#[derive(Debug, Serialize)]
pub struct ResolverInfo {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub fail_count: u32,
}

impl From<&Resolver> for ResolverInfo {
    fn from(r: &Resolver) -> Self {
        ResolverInfo {
            address: r.address.clone(),
            kind: r.kind.to_string(),
            status: r.status.to_string(),
            latency_ms: r.latency.map(|l| l.as_millis() as u64),
            fail_count: r.fail_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolversResponse {
    pub resolvers: Vec<ResolverInfo>,
    pub count: usize,
    pub healthy: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub resolver_count: usize,
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub blocked_count: usize,
    pub unknown_count: usize,
    pub pool_exhausted: bool,
    pub monitor_status: String,
    pub monitor_healthy: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/resolvers", get(get_resolvers))
        .route("/health", get(get_health))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until shutdown is signalled.
pub async fn start_server(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let router = create_router(state);
    info!("API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn get_resolvers(State(state): State<AppState>) -> Json<ResolversResponse> {
    let snapshot = state.pool.snapshot();
    let healthy = snapshot
        .iter()
        .filter(|r| r.status == ResolverStatus::Healthy)
        .count();
    Json(ResolversResponse {
        resolvers: snapshot.iter().map(ResolverInfo::from).collect(),
        count: snapshot.len(),
        healthy,
    })
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.monitor.is_healthy() {
        "healthy"
    } else {
        "unhealthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state.pool.snapshot();
    let count_with = |status: ResolverStatus| snapshot.iter().filter(|r| r.status == status).count();
    Json(StatsResponse {
        resolver_count: snapshot.len(),
        healthy_count: count_with(ResolverStatus::Healthy),
        degraded_count: count_with(ResolverStatus::Degraded),
        blocked_count: count_with(ResolverStatus::Blocked),
        unknown_count: count_with(ResolverStatus::Unknown),
        pool_exhausted: state.pool.exhausted(),
        monitor_status: state.monitor.status().to_string(),
        monitor_healthy: state.monitor.is_healthy(),
    })
}
