//! `researchflow request` - Submit and drive research data requests.

use serde_json::{json, Value};

use researchflow_core::models::{CreateRequestInput, WorkflowState};
use researchflow_core::AppState;

pub struct SubmitArgs {
    pub researcher_name: String,
    pub researcher_email: String,
    pub department: Option<String>,
    pub text: String,
    pub requirements: Option<Value>,
    pub auto_start: bool,
}

pub async fn submit(state: &AppState, args: SubmitArgs) -> Result<Value, String> {
    if args.researcher_email.trim().is_empty() {
        return Err("researcher email is required".to_string());
    }
    let input = CreateRequestInput {
        researcher_name: args.researcher_name,
        researcher_email: args.researcher_email,
        department: args.department,
        initial_request: args.text,
        requirements: args.requirements,
    };
    let (request, outcome) = state
        .orchestrator
        .submit_request(input, args.auto_start)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "request": request, "outcome": outcome }))
}

pub async fn process(state: &AppState, request_id: &str) -> Result<Value, String> {
    let outcome = state
        .orchestrator
        .process_request(request_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "outcome": outcome }))
}

/// Request with its approvals, executions, escalations, deliveries and audit trail.
pub async fn show(state: &AppState, request_id: &str) -> Result<Value, String> {
    let history = state
        .orchestrator
        .history(request_id)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(history).map_err(|e| e.to_string())
}

pub async fn list(state: &AppState, filter: Option<&str>) -> Result<Value, String> {
    let filter = match filter {
        Some(s) => Some(
            WorkflowState::from_str(s).ok_or_else(|| format!("Unknown workflow state: {}", s))?,
        ),
        None => None,
    };
    let requests = state
        .orchestrator
        .requests()
        .list(filter)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "requests": requests }))
}

pub async fn respond(
    state: &AppState,
    request_id: &str,
    message: &str,
    requirements: Option<Value>,
) -> Result<Value, String> {
    let outcome = state
        .orchestrator
        .submit_researcher_response(request_id, message, requirements)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "outcome": outcome }))
}
