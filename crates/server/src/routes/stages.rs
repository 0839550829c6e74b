use axum::extract::State;
use axum::Json;
use insight_core::StageDefinition;
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct StagesResponse {
    /// Declaration order, which is also the scheduling order
    pub stages: Vec<StageDefinition>,
    /// Dependency-respecting order used for diagnostics
    pub topological_order: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/stages",
    responses(
        (status = 200, description = "The stage registry", body = StagesResponse)
    ),
    tag = "stages"
)]
pub async fn list_stages(State(state): State<AppState>) -> Json<StagesResponse> {
    let registry = state.orchestrator.registry();
    let topological_order = registry
        .topological_order()
        .map(|order| order.into_iter().map(str::to_string).collect())
        .unwrap_or_default();

    Json(StagesResponse {
        stages: registry.stages().to_vec(),
        topological_order,
    })
}
