//! `researchflow view` - Validate, store and run SQL-on-FHIR ViewDefinitions.

use std::path::Path;

use serde_json::{json, Value};

use researchflow_core::viewdef::{ViewDefinition, ViewSummary};
use researchflow_core::AppState;

/// Read a ViewDefinition from a `.json`, `.yaml` or `.yml` file.
pub fn read_view_file(path: &Path) -> Result<ViewDefinition, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| format!("Invalid YAML in {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&content).map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))?
    };
    ViewDefinition::from_value(value).map_err(|e| e.to_string())
}

/// Never fails on an invalid definition; reports it in the output instead.
pub fn validate(path: &Path) -> Result<Value, String> {
    let checked = read_view_file(path)
        .and_then(|view| view.validate().map(|_| view).map_err(|e| e.to_string()));
    Ok(match checked {
        Ok(view) => json!({
            "valid": true,
            "name": view.name,
            "columns": view.column_names(),
        }),
        Err(error) => json!({ "valid": false, "error": error }),
    })
}

pub fn save(state: &AppState, path: &Path) -> Result<Value, String> {
    let view = read_view_file(path)?;
    let saved = state.view_manager.save(&view).map_err(|e| e.to_string())?;
    let invalidated = state.view_runner.cache().invalidate_view(&view.name);
    Ok(json!({
        "view": ViewSummary::from(&view),
        "path": saved.display().to_string(),
        "invalidatedCacheEntries": invalidated,
    }))
}

pub fn list(state: &AppState) -> Result<Value, String> {
    let views = state.view_manager.list().map_err(|e| e.to_string())?;
    Ok(json!({ "views": views }))
}

/// Split `key=value` search parameters.
pub fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    raw.iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| format!("Invalid parameter '{}': expected key=value", p))
        })
        .collect()
}

pub async fn run(
    state: &AppState,
    name: &str,
    params: &[(String, String)],
    limit: Option<usize>,
) -> Result<Value, String> {
    let view = state.view_manager.load(name).map_err(|e| e.to_string())?;
    let mut result = state
        .view_runner
        .run(&view, params)
        .await
        .map_err(|e| e.to_string())?;
    let total = result.rows.len();
    if let Some(limit) = limit {
        result.rows.truncate(limit);
    }
    Ok(json!({ "result": result, "totalRows": total }))
}
