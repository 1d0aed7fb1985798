//! Read-only SQL access to the research data warehouse.

pub mod phenotype;
pub mod sandbox;

pub use phenotype::{parse_age_range, AgeRange, ConditionConcept, PhenotypeQuery};
pub use sandbox::{validate_select, QueryResult, SqlSandbox, DEFAULT_MAX_ROWS};

use crate::error::ServerError;

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("Query is empty")]
    Empty,

    #[error("Only a single statement is allowed")]
    MultipleStatements,

    #[error("Only SELECT queries are allowed (got '{0}')")]
    NotSelect(String),

    #[error("Forbidden keyword in query: {0}")]
    ForbiddenKeyword(String),

    #[error("Statement is not read-only")]
    NotReadOnly,

    #[error("Query failed: {0}")]
    Execution(String),
}

impl From<ServerError> for SqlError {
    fn from(e: ServerError) -> Self {
        SqlError::Execution(e.to_string())
    }
}

impl From<rusqlite::Error> for SqlError {
    fn from(e: rusqlite::Error) -> Self {
        SqlError::Execution(e.to_string())
    }
}

impl From<SqlError> for ServerError {
    fn from(e: SqlError) -> Self {
        match e {
            SqlError::Execution(msg) => ServerError::Database(msg),
            other => ServerError::BadRequest(other.to_string()),
        }
    }
}

/// Quote a string as a SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
