use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
    pub active_generations: usize,
}

/// Liveness check. Reports `degraded` when the database does not answer.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state.db.is_healthy().await;
    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        active_generations: state.active.len(),
    })
}
