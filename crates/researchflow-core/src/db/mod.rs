//! SQLite database layer for ResearchFlow.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.
//!
//! The same handle type backs two logical databases: the application
//! database (requests, approvals, audit log, ...) and the research data
//! warehouse queried by the SQL sandbox. By default both live in one file.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ServerError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open a database from a connection string.
    ///
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, `sqlite::memory:`,
    /// `:memory:` or a bare file path.
    pub fn open_url(url: &str) -> Result<Self, ServerError> {
        match parse_database_url(url)? {
            None => Self::open_in_memory(),
            Some(path) => Self::open(&path),
        }
    }

    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, ServerError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ServerError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| ServerError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Round-trip a trivial query; used by the readiness probe.
    pub async fn ping(&self) -> Result<(), ServerError> {
        self.with_conn_async(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), ServerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS research_requests (
                    id                  TEXT PRIMARY KEY,
                    researcher_name     TEXT NOT NULL,
                    researcher_email    TEXT NOT NULL,
                    department          TEXT,
                    initial_request     TEXT NOT NULL,
                    current_state       TEXT NOT NULL DEFAULT 'new_request',
                    state_history       TEXT NOT NULL DEFAULT '[]',
                    context             TEXT NOT NULL DEFAULT '{}',
                    last_error          TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    completed_at        INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_requests_state ON research_requests(current_state);

                CREATE TABLE IF NOT EXISTS requirements (
                    request_id      TEXT PRIMARY KEY REFERENCES research_requests(id) ON DELETE CASCADE,
                    data            TEXT NOT NULL DEFAULT '{}',
                    version         INTEGER NOT NULL DEFAULT 1,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS feasibility_reports (
                    id              TEXT PRIMARY KEY,
                    request_id      TEXT NOT NULL REFERENCES research_requests(id) ON DELETE CASCADE,
                    feasible        INTEGER NOT NULL,
                    score           REAL NOT NULL,
                    estimated_count INTEGER NOT NULL,
                    report          TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_feasibility_request ON feasibility_reports(request_id);

                CREATE TABLE IF NOT EXISTS approvals (
                    id              TEXT PRIMARY KEY,
                    request_id      TEXT NOT NULL REFERENCES research_requests(id) ON DELETE CASCADE,
                    approval_type   TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    approval_data   TEXT NOT NULL DEFAULT '{}',
                    requested_by    TEXT NOT NULL,
                    reviewer        TEXT,
                    review_notes    TEXT,
                    modifications   TEXT,
                    created_at      INTEGER NOT NULL,
                    reviewed_at     INTEGER,
                    timeout_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_approvals_request ON approvals(request_id);
                CREATE INDEX IF NOT EXISTS idx_approvals_pending ON approvals(timeout_at) WHERE status = 'pending';

                CREATE TABLE IF NOT EXISTS agent_executions (
                    id              TEXT PRIMARY KEY,
                    request_id      TEXT NOT NULL,
                    agent_id        TEXT NOT NULL,
                    task            TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    retry_count     INTEGER NOT NULL DEFAULT 0,
                    duration_ms     INTEGER NOT NULL DEFAULT 0,
                    error           TEXT,
                    result_summary  TEXT,
                    started_at      INTEGER NOT NULL,
                    completed_at    INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_executions_request ON agent_executions(request_id);

                CREATE TABLE IF NOT EXISTS escalations (
                    id              TEXT PRIMARY KEY,
                    request_id      TEXT NOT NULL,
                    agent_id        TEXT,
                    reason          TEXT NOT NULL,
                    severity        TEXT NOT NULL,
                    details         TEXT NOT NULL DEFAULT '{}',
                    status          TEXT NOT NULL DEFAULT 'pending_review',
                    resolution      TEXT,
                    created_at      INTEGER NOT NULL,
                    resolved_at     INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_escalations_request ON escalations(request_id);

                CREATE TABLE IF NOT EXISTS deliveries (
                    id              TEXT PRIMARY KEY,
                    request_id      TEXT NOT NULL REFERENCES research_requests(id) ON DELETE CASCADE,
                    location        TEXT NOT NULL,
                    format          TEXT NOT NULL,
                    phi_level       TEXT NOT NULL,
                    files           TEXT NOT NULL DEFAULT '[]',
                    record_count    INTEGER NOT NULL DEFAULT 0,
                    delivered_at    INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id              TEXT PRIMARY KEY,
                    request_id      TEXT,
                    event_type      TEXT NOT NULL,
                    actor           TEXT NOT NULL,
                    details         TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_audit_request ON audit_log(request_id);

                CREATE TABLE IF NOT EXISTS materialized_views (
                    name            TEXT PRIMARY KEY,
                    view_name       TEXT NOT NULL,
                    table_name      TEXT NOT NULL,
                    row_count       INTEGER NOT NULL DEFAULT 0,
                    refreshed_at    INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS patients (
                    patient_id      TEXT PRIMARY KEY,
                    mrn             TEXT,
                    name            TEXT,
                    birth_date      TEXT,
                    gender          TEXT,
                    address         TEXT,
                    phone           TEXT,
                    email           TEXT
                );

                CREATE TABLE IF NOT EXISTS conditions (
                    id              TEXT PRIMARY KEY,
                    patient_id      TEXT NOT NULL,
                    code            TEXT NOT NULL,
                    system          TEXT NOT NULL DEFAULT 'icd10',
                    description     TEXT,
                    onset_date      TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_conditions_patient ON conditions(patient_id);

                CREATE TABLE IF NOT EXISTS observations (
                    id              TEXT PRIMARY KEY,
                    patient_id      TEXT NOT NULL,
                    code            TEXT NOT NULL,
                    description     TEXT,
                    value           REAL,
                    unit            TEXT,
                    observed_at     TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_observations_patient ON observations(patient_id);

                CREATE TABLE IF NOT EXISTS medications (
                    id              TEXT PRIMARY KEY,
                    patient_id      TEXT NOT NULL,
                    code            TEXT,
                    name            TEXT NOT NULL,
                    start_date      TEXT,
                    end_date        TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_medications_patient ON medications(patient_id);

                CREATE TABLE IF NOT EXISTS procedures (
                    id              TEXT PRIMARY KEY,
                    patient_id      TEXT NOT NULL,
                    code            TEXT NOT NULL,
                    description     TEXT,
                    performed_at    TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_procedures_patient ON procedures(patient_id);
                "
            )
        })?;
        self.run_migrations()
    }

    /// Apply incremental migrations for schema changes on existing databases.
    fn run_migrations(&self) -> Result<(), ServerError> {
        self.with_conn(|conn| {
            // Added after the first release; ignore the error when the column exists.
            let _ = conn.execute("ALTER TABLE research_requests ADD COLUMN department TEXT", []);
            let _ = conn.execute("ALTER TABLE agent_executions ADD COLUMN result_summary TEXT", []);
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_executions_agent ON agent_executions(agent_id);
                 CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status);"
            )
        })
    }
}

/// Resolve a connection string to a file path (`None` means in-memory).
pub fn parse_database_url(url: &str) -> Result<Option<String>, ServerError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ServerError::BadRequest("Empty database URL".to_string()));
    }
    if url == ":memory:" || url == "sqlite::memory:" || url == "sqlite://:memory:" {
        return Ok(None);
    }
    if let Some(rest) = url.strip_prefix("sqlite://") {
        return Ok(Some(rest.to_string()));
    }
    if let Some(rest) = url.strip_prefix("sqlite:") {
        return Ok(Some(rest.to_string()));
    }
    if url.contains("://") {
        return Err(ServerError::BadRequest(format!(
            "Unsupported database URL '{}': only sqlite is available",
            url
        )));
    }
    Ok(Some(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_database_url() {
        assert_eq!(parse_database_url("sqlite::memory:").unwrap(), None);
        assert_eq!(parse_database_url(":memory:").unwrap(), None);
        assert_eq!(
            parse_database_url("sqlite://data/app.db").unwrap(),
            Some("data/app.db".to_string())
        );
        assert_eq!(
            parse_database_url("research.db").unwrap(),
            Some("research.db".to_string())
        );
        assert!(parse_database_url("postgres://localhost/db").is_err());
    }

    #[tokio::test]
    async fn test_open_in_memory_and_ping() {
        let db = Database::open_in_memory().unwrap();
        db.ping().await.unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'approvals'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
