//! SQL-on-FHIR ViewDefinition engine.
//!
//! A ViewDefinition flattens FHIR resources into rows: resources are
//! fetched from a [`FhirSource`], filtered by `where` clauses and pushed
//! through the `select` tree, whose column paths are FHIRPath expressions.
//!
//! ```json
//! {
//!   "name": "patient_demographics",
//!   "resource": "Patient",
//!   "select": [
//!     { "column": [
//!         { "name": "id", "path": "getResourceKey()" },
//!         { "name": "gender", "path": "gender" }
//!     ] },
//!     { "forEachOrNull": "name.where(use = 'official').first()",
//!       "column": [{ "name": "family", "path": "family" }] }
//!   ]
//! }
//! ```

pub mod builtin;
pub mod cache;
pub mod fhirpath;
pub mod manager;
pub mod materialize;
pub mod model;
pub mod runner;
pub mod source;

pub use cache::{CacheKey, CacheStats, ViewCache};
pub use fhirpath::FhirPath;
pub use manager::{ViewDefinitionManager, ViewSummary};
pub use materialize::MaterializedViewStore;
pub use model::{Column, Constant, SelectNode, ViewDefinition, WhereClause};
pub use runner::{ViewResult, ViewRunner};
pub use source::{FhirHttpClient, FhirSource, InMemoryFhirSource, WarehouseFhirSource};

use crate::error::ServerError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ViewError {
    #[error("Invalid ViewDefinition: {0}")]
    Invalid(String),

    #[error("FHIRPath parse error in '{expr}': {message}")]
    Parse { expr: String, message: String },

    #[error("FHIRPath evaluation error: {0}")]
    Eval(String),

    #[error("FHIR fetch failed: {0}")]
    Fetch(String),

    #[error("ViewDefinition not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<std::io::Error> for ViewError {
    fn from(e: std::io::Error) -> Self {
        ViewError::Io(e.to_string())
    }
}

impl From<ServerError> for ViewError {
    fn from(e: ServerError) -> Self {
        ViewError::Database(e.to_string())
    }
}

impl From<ViewError> for ServerError {
    fn from(e: ViewError) -> Self {
        match e {
            ViewError::Invalid(_) | ViewError::Parse { .. } => ServerError::BadRequest(e.to_string()),
            ViewError::NotFound(_) => ServerError::NotFound(e.to_string()),
            ViewError::Database(msg) => ServerError::Database(msg),
            other => ServerError::Internal(other.to_string()),
        }
    }
}
