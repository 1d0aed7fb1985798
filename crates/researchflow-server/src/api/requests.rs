use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use researchflow_core::models::{CreateRequestInput, WorkflowState};
use researchflow_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_requests).post(submit_request))
        .route("/{id}", get(get_request))
        .route("/{id}/process", post(process_request))
        .route("/{id}/respond", post(researcher_response))
        .route("/{id}/scope-change", post(scope_change))
        .route("/{id}/history", get(request_history))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    state: Option<String>,
}

async fn list_requests(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let filter = match q.state.as_deref() {
        Some(s) => Some(
            WorkflowState::from_str(s)
                .ok_or_else(|| ServerError::BadRequest(format!("Unknown state '{}'", s)))?,
        ),
        None => None,
    };
    let requests = state.orchestrator.requests().list(filter).await?;
    Ok(Json(serde_json::json!({ "requests": requests })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(flatten)]
    input: CreateRequestInput,
    /// Start gathering requirements right away (default true).
    auto_start: Option<bool>,
}

/// POST /api/requests - Submit a new research data request
async fn submit_request(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if body.input.researcher_email.trim().is_empty() {
        return Err(ServerError::BadRequest("researcherEmail is required".to_string()));
    }
    let (request, outcome) = state
        .orchestrator
        .submit_request(body.input, body.auto_start.unwrap_or(true))
        .await?;
    Ok(Json(serde_json::json!({
        "request": request,
        "outcome": outcome,
    })))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let request = state.orchestrator.requests().require(&id).await?;
    Ok(Json(serde_json::json!({ "request": request })))
}

/// POST /api/requests/{id}/process - Run the task the current state calls for
async fn process_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let outcome = state.orchestrator.process_request(&id).await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondBody {
    #[serde(default)]
    message: String,
    requirements: Option<serde_json::Value>,
}

/// POST /api/requests/{id}/respond - Researcher answers follow-up questions
async fn researcher_response(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let outcome = state
        .orchestrator
        .submit_researcher_response(&id, &body.message, body.requirements)
        .await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeChangeBody {
    changes: serde_json::Value,
    requested_by: Option<String>,
}

/// POST /api/requests/{id}/scope-change - Ask reviewers to approve new scope
async fn scope_change(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScopeChangeBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let requested_by = match body.requested_by.filter(|s| !s.trim().is_empty()) {
        Some(who) => who,
        None => state.orchestrator.requests().require(&id).await?.researcher_email,
    };
    let outcome = state
        .orchestrator
        .request_scope_change(&id, body.changes, &requested_by)
        .await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

async fn request_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let history = state.orchestrator.history(&id).await?;
    Ok(Json(serde_json::to_value(history)?))
}
