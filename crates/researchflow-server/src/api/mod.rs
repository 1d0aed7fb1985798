pub mod approvals;
pub mod escalations;
pub mod materialized_views;
pub mod requests;
pub mod sql;
pub mod views;

use axum::Router;

use researchflow_core::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/requests", requests::router())
        .nest("/api/approvals", approvals::router())
        .nest("/api/escalations", escalations::router())
        .nest("/api/views", views::router())
        .nest("/api/materialized-views", materialized_views::router())
        .nest("/api/sql", sql::router())
}
