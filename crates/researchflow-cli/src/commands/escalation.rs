//! `researchflow escalation` - Review and close escalations.

use serde_json::{json, Value};

use researchflow_core::models::EscalationStatus;
use researchflow_core::{AppState, EscalationAction};

/// `status` is an escalation status or `all`; pending_review when unset.
pub async fn list(
    state: &AppState,
    status: Option<&str>,
    request_id: Option<&str>,
) -> Result<Value, String> {
    let status = match status.unwrap_or("pending_review") {
        "all" => None,
        s => Some(
            EscalationStatus::from_str(s).ok_or_else(|| format!("Unknown escalation status: {}", s))?,
        ),
    };
    let escalations = state
        .orchestrator
        .escalations()
        .list(status, request_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "escalations": escalations }))
}

pub async fn resolve(
    state: &AppState,
    escalation_id: &str,
    action: &str,
    notes: Option<String>,
) -> Result<Value, String> {
    let action = EscalationAction::from_str(action).ok_or_else(|| {
        format!(
            "Unknown action '{}': expected retry, resolve, dismiss or abort",
            action
        )
    })?;
    let resolution = state
        .orchestrator
        .resolve_escalation(escalation_id, action, notes)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(resolution).map_err(|e| e.to_string())
}
