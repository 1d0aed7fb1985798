use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use researchflow_core::models::{ApprovalDecision, ApprovalStatus};
use researchflow_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_approvals))
        .route("/check-timeouts", post(check_timeouts))
        .route("/{id}", get(get_approval))
        .route("/{id}/respond", post(respond))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<String>,
    request_id: Option<String>,
}

/// GET /api/approvals - Pending approvals unless `?status=` says otherwise
async fn list_approvals(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let status = match q.status.as_deref() {
        None => Some(ApprovalStatus::Pending),
        Some("all") => None,
        Some(s) => Some(
            ApprovalStatus::from_str(s)
                .ok_or_else(|| ServerError::BadRequest(format!("Unknown approval status '{}'", s)))?,
        ),
    };
    let approvals = state
        .orchestrator
        .approvals()
        .list(status, q.request_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "approvals": approvals })))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let approval = state.orchestrator.approvals().require(&id).await?;
    Ok(Json(serde_json::json!({ "approval": approval })))
}

/// POST /api/approvals/{id}/respond - Approve, modify or reject
async fn respond(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let outcome = state
        .orchestrator
        .process_approval_response(&id, decision)
        .await?;
    let approval = state.orchestrator.approvals().require(&id).await?;
    Ok(Json(serde_json::json!({
        "approval": approval,
        "outcome": outcome,
    })))
}

/// POST /api/approvals/check-timeouts - Time out overdue approvals now
async fn check_timeouts(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let timed_out = state.orchestrator.check_approval_timeouts().await?;
    Ok(Json(serde_json::json!({
        "timedOut": timed_out.len(),
        "approvals": timed_out,
    })))
}
