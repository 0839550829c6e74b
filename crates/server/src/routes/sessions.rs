use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use insight_core::{SessionParameters, SessionStatus, WorkflowSession};
use orchestrator::ControlState;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Generated when omitted
    pub session_id: Option<String>,
    pub parameters: SessionParameters,
}

#[derive(Debug, Serialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionControlRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionControlResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub paused: bool,
    pub cancelled: bool,
}

impl SessionControlResponse {
    fn new(session: &WorkflowSession, control: ControlState) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            paused: control.paused,
            cancelled: control.cancelled,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/sessions/start",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session created and running", body = StartSessionResponse),
        (status = 400, description = "Invalid parameters or stage registry"),
        (status = 409, description = "Session id already in use")
    ),
    tag = "sessions"
)]
pub async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<StartSessionResponse>), AppError> {
    let session = state
        .orchestrator
        .start(payload.session_id, payload.parameters)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartSessionResponse {
            session_id: session.session_id,
            status: session.status,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/sessions/pause",
    request_body = SessionControlRequest,
    responses(
        (status = 200, description = "Pause requested; takes effect before the next stage", body = SessionControlResponse),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session already finished")
    ),
    tag = "sessions"
)]
pub async fn pause_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionControlRequest>,
) -> Result<Json<SessionControlResponse>, AppError> {
    let control = state.orchestrator.pause(&payload.session_id)?;
    let session = state.orchestrator.session(&payload.session_id)?;
    Ok(Json(SessionControlResponse::new(&session, control)))
}

#[utoipa::path(
    post,
    path = "/api/sessions/resume",
    request_body = SessionControlRequest,
    responses(
        (status = 200, description = "Resume requested; no-op unless paused", body = SessionControlResponse),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session already finished")
    ),
    tag = "sessions"
)]
pub async fn resume_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionControlRequest>,
) -> Result<Json<SessionControlResponse>, AppError> {
    let control = state.orchestrator.resume(&payload.session_id)?;
    let session = state.orchestrator.session(&payload.session_id)?;
    Ok(Json(SessionControlResponse::new(&session, control)))
}

#[utoipa::path(
    post,
    path = "/api/sessions/cancel",
    request_body = SessionControlRequest,
    responses(
        (status = 200, description = "Cancel requested; the running stage finishes first", body = SessionControlResponse),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session already finished")
    ),
    tag = "sessions"
)]
pub async fn cancel_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionControlRequest>,
) -> Result<Json<SessionControlResponse>, AppError> {
    let control = state.orchestrator.cancel(&payload.session_id)?;
    let session = state.orchestrator.session(&payload.session_id)?;
    Ok(Json(SessionControlResponse::new(&session, control)))
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    responses(
        (status = 200, description = "All sessions, oldest first", body = Vec<WorkflowSession>)
    ),
    tag = "sessions"
)]
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<WorkflowSession>> {
    Json(state.orchestrator.sessions())
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Session found", body = WorkflowSession),
        (status = 404, description = "Session not found")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowSession>, AppError> {
    Ok(Json(state.orchestrator.session(&id)?))
}
