use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use researchflow_core::viewdef::ViewDefinition;
use researchflow_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_materialized).post(create_materialized))
        .route("/{name}", get(get_materialized).delete(drop_materialized))
        .route("/{name}/refresh", post(refresh_materialized))
}

async fn list_materialized(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let views = state.materialized_views.list().await?;
    Ok(Json(serde_json::json!({ "materializedViews": views })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    /// Table suffix: rows land in `mv_<name>`.
    name: String,
    /// Saved view to run.
    view_name: Option<String>,
    /// Inline ViewDefinition, used when `viewName` is absent.
    view: Option<serde_json::Value>,
}

/// POST /api/materialized-views - Run a view and store its rows as a table
async fn create_materialized(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let view = match (body.view_name, body.view) {
        (Some(name), _) => state.view_manager.load(&name)?,
        (None, Some(inline)) => ViewDefinition::from_value(inline)?,
        (None, None) => {
            return Err(ServerError::BadRequest(
                "viewName or view is required".to_string(),
            ))
        }
    };
    let record = state
        .materialized_views
        .refresh(&body.name, &view, &state.view_runner)
        .await?;
    Ok(Json(serde_json::json!({ "materializedView": record })))
}

async fn get_materialized(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    match state.materialized_views.get(&name).await? {
        Some(mv) => Ok(Json(serde_json::json!({ "materializedView": mv }))),
        None => Err(ServerError::NotFound(format!("Materialized view {} not found", name))),
    }
}

/// POST /api/materialized-views/{name}/refresh - Re-run the saved source view
async fn refresh_materialized(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let existing = state
        .materialized_views
        .get(&name)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Materialized view {} not found", name)))?;
    let view = state.view_manager.load(&existing.view_name)?;
    let record = state
        .materialized_views
        .refresh(&name, &view, &state.view_runner)
        .await?;
    Ok(Json(serde_json::json!({ "materializedView": record })))
}

async fn drop_materialized(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !state.materialized_views.drop_view(&name).await? {
        return Err(ServerError::NotFound(format!("Materialized view {} not found", name)));
    }
    Ok(Json(serde_json::json!({ "dropped": true })))
}
