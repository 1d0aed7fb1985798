//! `researchflow approval` - Review queue for human approvals.

use serde_json::{json, Value};

use researchflow_core::models::{ApprovalDecision, ApprovalStatus, Decision};
use researchflow_core::AppState;

/// `status` is an approval status or `all`; pending when unset.
pub async fn list(
    state: &AppState,
    status: Option<&str>,
    request_id: Option<&str>,
) -> Result<Value, String> {
    let status = match status.unwrap_or("pending") {
        "all" => None,
        s => Some(ApprovalStatus::from_str(s).ok_or_else(|| format!("Unknown approval status: {}", s))?),
    };
    let approvals = state
        .orchestrator
        .approvals()
        .list(status, request_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "approvals": approvals }))
}

pub async fn respond(
    state: &AppState,
    approval_id: &str,
    decision: &str,
    reviewer: &str,
    notes: Option<String>,
    modifications: Option<Value>,
) -> Result<Value, String> {
    let decision = Decision::from_str(decision)
        .ok_or_else(|| format!("Unknown decision '{}': expected approve, modify or reject", decision))?;
    let outcome = state
        .orchestrator
        .process_approval_response(
            approval_id,
            ApprovalDecision {
                decision,
                reviewer: reviewer.to_string(),
                notes,
                modifications,
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    let approval = state
        .orchestrator
        .approvals()
        .require(approval_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "approval": approval, "outcome": outcome }))
}

pub async fn check_timeouts(state: &AppState) -> Result<Value, String> {
    let timed_out = state
        .orchestrator
        .check_approval_timeouts()
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "timedOut": timed_out.len(), "approvals": timed_out }))
}
