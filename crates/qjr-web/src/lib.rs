//! Axum health/status endpoints for QJR. JSON only; the collector is a
//! headless service and these routes exist for deploy health checks and
//! quick operational inspection.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use qjr_core::CycleSummary;
use qjr_sync::JobPipeline;
use serde::Serialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "qjr-web";

const SERVICE_NAME: &str = "qjr-collector";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<JobPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<JobPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: DateTime<Utc>,
    running: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        timestamp: Utc::now(),
        running: state.pipeline.is_running(),
    })
}

async fn summary(
    State(state): State<AppState>,
) -> Result<Json<CycleSummary>, StatusCode> {
    state
        .pipeline
        .last_summary()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/summary", get(summary))
        .with_state(state)
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}
