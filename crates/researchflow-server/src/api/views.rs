use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use researchflow_core::viewdef::{ViewDefinition, ViewResult, ViewSummary};
use researchflow_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_views).post(save_view))
        .route("/validate", post(validate_view))
        .route("/run", post(run_inline))
        .route("/cache", get(cache_stats).delete(clear_cache))
        .route("/{name}", get(get_view).delete(delete_view))
        .route("/{name}/run", post(run_saved))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunOptions {
    /// FHIR search parameters passed to the source.
    #[serde(default)]
    params: BTreeMap<String, String>,
    /// Cap on returned rows; the full count is still reported.
    limit: Option<usize>,
}

impl RunOptions {
    fn search_params(&self) -> Vec<(String, String)> {
        self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn run_response(mut result: ViewResult, limit: Option<usize>) -> serde_json::Value {
    let total = result.rows.len();
    if let Some(limit) = limit {
        result.rows.truncate(limit);
    }
    serde_json::json!({
        "result": result,
        "totalRows": total,
    })
}

async fn list_views(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ServerError> {
    let views = state.view_manager.list()?;
    Ok(Json(serde_json::json!({ "views": views })))
}

/// POST /api/views - Save (or replace) a ViewDefinition
async fn save_view(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let view = ViewDefinition::from_value(body)?;
    let path = state.view_manager.save(&view)?;
    let invalidated = state.view_runner.cache().invalidate_view(&view.name);
    Ok(Json(serde_json::json!({
        "view": ViewSummary::from(&view),
        "path": path.display().to_string(),
        "invalidatedCacheEntries": invalidated,
    })))
}

/// POST /api/views/validate - Check a ViewDefinition without saving it
async fn validate_view(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
    let checked = ViewDefinition::from_value(body).and_then(|view| view.validate().map(|_| view));
    match checked {
        Ok(view) => Json(serde_json::json!({
            "valid": true,
            "columns": view.column_names(),
        })),
        Err(e) => Json(serde_json::json!({
            "valid": false,
            "error": e.to_string(),
        })),
    }
}

async fn get_view(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let view = state.view_manager.load(&name)?;
    Ok(Json(serde_json::json!({ "view": view })))
}

async fn delete_view(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let deleted = state.view_manager.delete(&name)?;
    if !deleted {
        return Err(ServerError::NotFound(format!("View {} not found", name)));
    }
    state.view_runner.cache().invalidate_view(&name);
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// POST /api/views/{name}/run - Run a saved view
async fn run_saved(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<RunOptions>>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    let view = state.view_manager.load(&name)?;
    let result = state.view_runner.run(&view, &options.search_params()).await?;
    Ok(Json(run_response(result, options.limit)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineRun {
    view: serde_json::Value,
    #[serde(flatten)]
    options: RunOptions,
}

/// POST /api/views/run - Run an unsaved ViewDefinition
async fn run_inline(
    State(state): State<AppState>,
    Json(body): Json<InlineRun>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let view = ViewDefinition::from_value(body.view)?;
    let result = state
        .view_runner
        .run(&view, &body.options.search_params())
        .await?;
    Ok(Json(run_response(result, body.options.limit)))
}

async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "cache": state.view_runner.cache().stats() }))
}

async fn clear_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.view_runner.cache().clear();
    tracing::info!("[Views] Result cache cleared");
    Json(serde_json::json!({ "cleared": true }))
}
