use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde::Serialize;
use utoipa::ToSchema;
use workers::PoolError;

#[derive(Debug)]
pub enum AppError {
    Orchestrator(OrchestratorError),
    Pool(PoolError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::Orchestrator(err) => {
                let message = err.to_string();
                match err {
                    OrchestratorError::SessionNotFound(_) => {
                        (StatusCode::NOT_FOUND, "not_found", message)
                    }
                    OrchestratorError::SessionExists(_) => {
                        (StatusCode::CONFLICT, "conflict", message)
                    }
                    OrchestratorError::InvalidControl { .. } => {
                        (StatusCode::CONFLICT, "invalid_transition", message)
                    }
                    OrchestratorError::InvalidParameters(_) => {
                        (StatusCode::BAD_REQUEST, "bad_request", message)
                    }
                    OrchestratorError::Configuration(_) => {
                        (StatusCode::BAD_REQUEST, "configuration_error", message)
                    }
                    OrchestratorError::StageState(_) => {
                        tracing::error!("Orchestrator error: {:?}", err);
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
                    }
                }
            }
            AppError::Pool(err) => {
                let message = err.to_string();
                match err {
                    PoolError::UnknownWorker(_) => (StatusCode::NOT_FOUND, "not_found", message),
                    PoolError::DuplicateWorker(_) | PoolError::AlreadyRunning(_) => {
                        (StatusCode::CONFLICT, "conflict", message)
                    }
                    PoolError::WorkerUnavailable { .. }
                    | PoolError::NoCapableWorker(_)
                    | PoolError::NotReady { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
                    }
                    PoolError::Timeout { .. } => {
                        (StatusCode::GATEWAY_TIMEOUT, "timeout", message)
                    }
                    _ => {
                        tracing::error!("Worker pool error: {:?}", err);
                        (StatusCode::INTERNAL_SERVER_ERROR, "worker_error", message)
                    }
                }
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Orchestrator(err)
    }
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        AppError::Pool(err)
    }
}
