use axum::extract::{Path, State};
use axum::Json;
use workers::WorkerProcess;

use crate::error::AppError;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/api/workers",
    responses(
        (status = 200, description = "Every registered worker in declaration order", body = Vec<WorkerProcess>)
    ),
    tag = "workers"
)]
pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerProcess>> {
    Json(state.pool.status_all().await)
}

#[utoipa::path(
    get,
    path = "/api/workers/{name}",
    params(
        ("name" = String, Path, description = "Worker name")
    ),
    responses(
        (status = 200, description = "Worker status", body = WorkerProcess),
        (status = 404, description = "Worker not found")
    ),
    tag = "workers"
)]
pub async fn get_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkerProcess>, AppError> {
    Ok(Json(state.pool.status(&name).await?))
}

#[utoipa::path(
    post,
    path = "/api/workers/{name}/start",
    params(
        ("name" = String, Path, description = "Worker name")
    ),
    responses(
        (status = 200, description = "Worker launched", body = WorkerProcess),
        (status = 404, description = "Worker not found"),
        (status = 409, description = "Worker already running")
    ),
    tag = "workers"
)]
pub async fn start_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkerProcess>, AppError> {
    tracing::info!(worker = %name, "Start requested over HTTP");
    Ok(Json(state.pool.start_registered(&name).await?))
}

#[utoipa::path(
    post,
    path = "/api/workers/{name}/stop",
    params(
        ("name" = String, Path, description = "Worker name")
    ),
    responses(
        (status = 200, description = "Worker stopped", body = WorkerProcess),
        (status = 404, description = "Worker not found")
    ),
    tag = "workers"
)]
pub async fn stop_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkerProcess>, AppError> {
    tracing::info!(worker = %name, "Stop requested over HTTP");
    Ok(Json(state.pool.stop(&name).await?))
}

#[utoipa::path(
    post,
    path = "/api/workers/{name}/restart",
    params(
        ("name" = String, Path, description = "Worker name")
    ),
    responses(
        (status = 200, description = "Worker relaunched with a fresh restart budget", body = WorkerProcess),
        (status = 404, description = "Worker not found")
    ),
    tag = "workers"
)]
pub async fn restart_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkerProcess>, AppError> {
    tracing::info!(worker = %name, "Restart requested over HTTP");
    Ok(Json(state.pool.restart(&name).await?))
}
