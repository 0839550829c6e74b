use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use workers::WorkerStatus;

use crate::state::AppState;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    version: String,
    workers_running: usize,
    workers_total: usize,
    sessions: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers = state.pool.status_all().await;
    let workers_running = workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Running)
        .count();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        workers_running,
        workers_total: workers.len(),
        sessions: state.orchestrator.store().len(),
    })
}
