//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses
//! the researchflow-core domain logic through `AppState`. Commands return
//! the JSON they would print so tests can inspect it.

pub mod approval;
pub mod escalation;
pub mod request;
pub mod server;
pub mod sql;
pub mod view;

use std::path::Path;

use researchflow_core::{AppConfig, AppState};

/// Resolve config: YAML file (if given), environment, then `--db`.
pub fn load_config(config_path: Option<&str>, db: Option<&str>) -> Result<AppConfig, String> {
    let mut config = AppConfig::load(config_path.map(Path::new))
        .map_err(|e| format!("Failed to load config: {}", e))?;
    if let Some(db) = db {
        config.database_url = db.to_string();
    }
    Ok(config)
}

/// Initialize a shared `AppState` with the bundled views installed.
///
/// Uses the same bootstrap as `researchflow server`.
pub async fn init_state(config: AppConfig) -> Result<AppState, String> {
    tracing::debug!(
        "[Cli] Opening {} (views in {})",
        config.database_url,
        config.viewdef_dir.display()
    );
    researchflow_server::create_app_state(config).await
}

/// Parse a JSON argument, naming the flag in the error.
pub fn parse_json_arg(flag: &str, raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("Invalid JSON for {}: {}", flag, e))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
