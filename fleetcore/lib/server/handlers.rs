//! HTTP request handlers for the agent API.
//!
//! Each handler forwards to the [`Registry`](crate::registry::Registry) and maps its errors
//! through [`ApiError`].

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::{
    registry::{HealthReport, HostInfo, Sandbox},
    FleetError,
};

use super::{
    data::{ApiError, CreateVmRequest, ListQuery, ListResponse, StatusResponse},
    state::AgentState,
};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /health`. Unauthenticated.
pub async fn health_handler(State(state): State<AgentState>) -> Json<HealthReport> {
    Json(state.get_registry().health().await)
}

/// Handler for `GET /info`.
pub async fn info_handler(State(state): State<AgentState>) -> Json<HostInfo> {
    Json(state.get_registry().info().await)
}

/// Handler for `POST /vms`
///
/// Creates the sandbox of a seat and answers `201` once it runs.
pub async fn create_vm_handler(
    State(state): State<AgentState>,
    request: Result<Json<CreateVmRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) =
        request.map_err(|rejection| FleetError::InvalidArgument(rejection.body_text()))?;

    tracing::info!(
        workshop_id = %request.workshop_id,
        seat_id = request.seat_id,
        "received create request"
    );

    let sandbox = state
        .get_registry()
        .create(&request.workshop_id, request.seat_id, request.resources())
        .await?;

    Ok((StatusCode::CREATED, Json(sandbox)))
}

/// Handler for `GET /vms`
pub async fn list_vms_handler(
    State(state): State<AgentState>,
    Query(query): Query<ListQuery>,
) -> Json<ListResponse<Sandbox>> {
    let vms = state
        .get_registry()
        .list(query.workshop_id.as_deref())
        .await;

    Json(ListResponse {
        count: vms.len(),
        vms,
    })
}

/// Handler for `GET /vms/{workshop_id}/{seat_id}`
pub async fn get_vm_handler(
    State(state): State<AgentState>,
    Path((workshop_id, seat_id)): Path<(String, u32)>,
) -> Result<Json<Sandbox>, ApiError> {
    let sandbox = state.get_registry().get(&workshop_id, seat_id).await?;
    Ok(Json(sandbox))
}

/// Handler for `DELETE /vms/{workshop_id}/{seat_id}`
///
/// Answers `200` whether or not the sandbox existed.
pub async fn delete_vm_handler(
    State(state): State<AgentState>,
    Path((workshop_id, seat_id)): Path<(String, u32)>,
) -> Result<Json<StatusResponse>, ApiError> {
    tracing::info!(%workshop_id, seat_id, "received destroy request");
    state.get_registry().destroy(&workshop_id, seat_id).await?;

    Ok(Json(StatusResponse::new(format!(
        "sandbox {workshop_id}/{seat_id} destroyed"
    ))))
}
