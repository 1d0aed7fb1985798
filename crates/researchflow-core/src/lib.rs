//! ResearchFlow Core - transport-agnostic domain logic for clinical research
//! data requests.
//!
//! This crate contains the workflow state machine, the agents, the approval
//! service, SQLite stores, the read-only SQL sandbox and the SQL-on-FHIR
//! ViewDefinition runner. It has **no HTTP framework dependency** by default,
//! making it suitable for use in:
//!
//! - HTTP servers (via `researchflow-server`)
//! - CLI tools (via `researchflow-cli`)
//! - embedding in batch jobs
//!
//! # Feature Flags
//!
//! - `axum` - Enables `IntoResponse` impl on `ServerError` for use in axum handlers.

pub mod agents;
pub mod cohort;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod sql;
pub mod state;
pub mod store;
pub mod viewdef;
pub mod workflow;

// Convenience re-exports
pub use config::AppConfig;
pub use db::Database;
pub use error::ServerError;
pub use orchestration::{EscalationAction, Orchestrator, ProcessOutcome};
pub use state::{AppState, AppStateBuilder, AppStateInner};
