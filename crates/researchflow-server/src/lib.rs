//! ResearchFlow Server - HTTP API for clinical research data requests.
//!
//! A thin axum adapter over `researchflow-core`, providing:
//! - request submission, processing and history
//! - the approval and escalation review queues
//! - ViewDefinition storage, execution and materialization
//! - read-only SQL against the research warehouse
//!
//! All domain logic lives in the core crate; handlers only translate
//! between HTTP and the orchestrator, stores and view engine.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use researchflow_core::config::DEFAULT_DATABASE_URL;
use researchflow_core::{AppConfig, AppState, AppStateInner};

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "researchflow_server=info,researchflow_core=info,tower_http=info";

/// Configuration for the HTTP listener.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Overrides `AppConfig::database_url` when set.
    pub db_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3210,
            db_path: None,
        }
    }
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .try_init();
}

/// Create a shared `AppState` from configuration and install the bundled
/// ViewDefinitions that are not on disk yet.
///
/// This is useful when the state is shared between the HTTP server and
/// other consumers (e.g. CLI commands run in the same process).
pub async fn create_app_state(config: AppConfig) -> Result<AppState, String> {
    let state: AppState = Arc::new(
        AppStateInner::new(config).map_err(|e| format!("Failed to initialize state: {}", e))?,
    );

    let installed = state
        .view_manager
        .install_builtins(false)
        .map_err(|e| format!("Failed to install built-in views: {}", e))?;
    if !installed.is_empty() {
        tracing::info!("[Server] Installed built-in views: {}", installed.join(", "));
    }

    Ok(state)
}

/// Build the full router over `state`.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .route("/api/ready", axum::routing::get(readiness_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server.
///
/// Returns the actual address the server is listening on.
pub async fn start_server(config: ServerConfig, mut app_config: AppConfig) -> Result<SocketAddr, String> {
    init_tracing();

    if let Some(db_path) = config.db_path.as_ref().filter(|p| !p.trim().is_empty()) {
        app_config.database_url = db_path.clone();
    } else if app_config.database_url.trim().is_empty() {
        app_config.database_url = DEFAULT_DATABASE_URL.to_string();
    }

    tracing::info!(
        "[Server] Starting ResearchFlow on {}:{} (database: {})",
        config.host,
        config.port,
        app_config.database_url
    );

    let state = create_app_state(app_config).await?;
    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let app = app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("[Server] Listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("[Server] Server error: {}", e);
        }
    });

    Ok(local_addr)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "researchflow-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready once both databases answer.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.db.ping().await;
    let warehouse = state.warehouse.ping().await;
    let ready = database.is_ok() && warehouse.is_ok();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if ready { "ready" } else { "unavailable" },
        "database": database.err().map(|e| e.to_string()).unwrap_or_else(|| "ok".to_string()),
        "warehouse": warehouse.err().map(|e| e.to_string()).unwrap_or_else(|| "ok".to_string()),
        "llm": state.llm.has_primary(),
        "viewSource": state.view_runner.source_name(),
        "cohortBackend": state.config.cohort_backend.as_str(),
    });
    (status, axum::Json(body))
}
