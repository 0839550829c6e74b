pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Insight Studio API",
        version = "0.1.0",
        description = "Market research workflow sessions and the worker pool behind them"
    ),
    paths(
        routes::health_check,
        routes::start_session,
        routes::pause_session,
        routes::resume_session,
        routes::cancel_session,
        routes::list_sessions,
        routes::get_session,
        routes::sse::session_stream,
        routes::sse::events_stream,
        routes::list_stages,
        routes::list_workers,
        routes::get_worker,
        routes::start_worker,
        routes::stop_worker,
        routes::restart_worker,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::StartSessionRequest,
        routes::StartSessionResponse,
        routes::SessionControlRequest,
        routes::SessionControlResponse,
        routes::StagesResponse,
        error::ErrorResponse,
        insight_core::WorkflowSession,
        insight_core::SessionParameters,
        insight_core::SessionStatus,
        insight_core::StageState,
        insight_core::StageStatus,
        insight_core::StageDefinition,
        insight_core::StageKind,
        insight_core::ErrorRecord,
        insight_core::Severity,
        events::SessionUpdate,
        workers::WorkerProcess,
        workers::WorkerStatus,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Workflow session control and queries"),
        (name = "events", description = "Real-time event streaming (SSE)"),
        (name = "stages", description = "Stage registry"),
        (name = "workers", description = "Worker pool administration"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route("/api/sessions", get(routes::list_sessions))
        .route("/api/sessions/start", post(routes::start_session))
        .route("/api/sessions/pause", post(routes::pause_session))
        .route("/api/sessions/resume", post(routes::resume_session))
        .route("/api/sessions/cancel", post(routes::cancel_session))
        .route("/api/sessions/{id}", get(routes::get_session))
        .route("/api/sessions/{id}/stream", get(routes::sse::session_stream))
        .route("/api/events", get(routes::sse::events_stream))
        .route("/api/ws", get(routes::websocket_handler))
        .route("/api/stages", get(routes::list_stages))
        .route("/api/workers", get(routes::list_workers))
        .route("/api/workers/{name}", get(routes::get_worker))
        .route("/api/workers/{name}/start", post(routes::start_worker))
        .route("/api/workers/{name}/stop", post(routes::stop_worker))
        .route("/api/workers/{name}/restart", post(routes::restart_worker))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
