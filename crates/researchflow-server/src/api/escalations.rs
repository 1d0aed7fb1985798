use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use researchflow_core::models::EscalationStatus;
use researchflow_core::{AppState, EscalationAction, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_escalations))
        .route("/{id}", get(get_escalation))
        .route("/{id}/resolve", post(resolve_escalation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<String>,
    request_id: Option<String>,
}

/// GET /api/escalations - Open escalations unless `?status=` says otherwise
async fn list_escalations(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let status = match q.status.as_deref() {
        None => Some(EscalationStatus::PendingReview),
        Some("all") => None,
        Some(s) => Some(
            EscalationStatus::from_str(s)
                .ok_or_else(|| ServerError::BadRequest(format!("Unknown escalation status '{}'", s)))?,
        ),
    };
    let escalations = state
        .orchestrator
        .escalations()
        .list(status, q.request_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "escalations": escalations })))
}

async fn get_escalation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    match state.orchestrator.escalations().get(&id).await? {
        Some(e) => Ok(Json(serde_json::json!({ "escalation": e }))),
        None => Err(ServerError::NotFound(format!("Escalation {} not found", id))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    action: EscalationAction,
    notes: Option<String>,
}

/// POST /api/escalations/{id}/resolve - retry, resolve, dismiss or abort
async fn resolve_escalation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let resolution = state
        .orchestrator
        .resolve_escalation(&id, body.action, body.notes)
        .await?;
    Ok(Json(serde_json::to_value(resolution)?))
}
