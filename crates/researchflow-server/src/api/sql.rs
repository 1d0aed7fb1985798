use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

use researchflow_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new().route("/execute", post(execute))
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    sql: String,
}

/// POST /api/sql/execute - Read-only query against the warehouse
async fn execute(
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let result = state.sandbox.execute(&body.sql).await?;
    Ok(Json(serde_json::to_value(result)?))
}
