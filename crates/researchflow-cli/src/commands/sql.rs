//! `researchflow sql` - Read-only query against the research warehouse.

use serde_json::Value;

use researchflow_core::AppState;

pub async fn execute(state: &AppState, query: &str) -> Result<Value, String> {
    let result = state.sandbox.execute(query).await.map_err(|e| e.to_string())?;
    serde_json::to_value(result).map_err(|e| e.to_string())
}
