use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{millis_to_dt, AgentExecution, AuditEntry, ExecutionStatus};

/// Append-only audit trail plus the per-agent execution log.
#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        request_id: Option<&str>,
        event_type: &str,
        actor: &str,
        details: serde_json::Value,
    ) -> Result<AuditEntry, ServerError> {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.map(|s| s.to_string()),
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            details,
            created_at: Utc::now(),
        };
        let e = entry.clone();
        let details = serde_json::to_string(&e.details)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (id, request_id, event_type, actor, details, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        e.id,
                        e.request_id,
                        e.event_type,
                        e.actor,
                        details,
                        e.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(entry)
    }

    pub async fn list_for_request(&self, request_id: &str) -> Result<Vec<AuditEntry>, ServerError> {
        let rid = request_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, request_id, event_type, actor, details, created_at
                     FROM audit_log WHERE request_id = ?1 ORDER BY created_at ASC, rowid ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![rid], |row| Ok(row_to_audit(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn record_execution(&self, execution: &AgentExecution) -> Result<(), ServerError> {
        let x = execution.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO agent_executions (id, request_id, agent_id, task, status, retry_count,
                        duration_ms, error, result_summary, started_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        x.id,
                        x.request_id,
                        x.agent_id,
                        x.task,
                        x.status.as_str(),
                        x.retry_count as i64,
                        x.duration_ms as i64,
                        x.error,
                        x.result_summary,
                        x.started_at.timestamp_millis(),
                        x.completed_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_executions(&self, request_id: &str) -> Result<Vec<AgentExecution>, ServerError> {
        let rid = request_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, request_id, agent_id, task, status, retry_count, duration_ms, error,
                            result_summary, started_at, completed_at
                     FROM agent_executions WHERE request_id = ?1 ORDER BY started_at ASC, rowid ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![rid], |row| Ok(row_to_execution(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> AuditEntry {
    let details: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    AuditEntry {
        id: row.get(0).unwrap_or_default(),
        request_id: row.get(1).unwrap_or(None),
        event_type: row.get(2).unwrap_or_default(),
        actor: row.get(3).unwrap_or_default(),
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        created_at: millis_to_dt(row.get(5).unwrap_or(0)),
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> AgentExecution {
    let status: String = row.get(4).unwrap_or_default();
    AgentExecution {
        id: row.get(0).unwrap_or_default(),
        request_id: row.get(1).unwrap_or_default(),
        agent_id: row.get(2).unwrap_or_default(),
        task: row.get(3).unwrap_or_default(),
        status: ExecutionStatus::from_str(&status).unwrap_or(ExecutionStatus::Failed),
        retry_count: row.get::<_, i64>(5).unwrap_or(0) as u32,
        duration_ms: row.get::<_, i64>(6).unwrap_or(0) as u64,
        error: row.get(7).unwrap_or(None),
        result_summary: row.get(8).unwrap_or(None),
        started_at: millis_to_dt(row.get(9).unwrap_or(0)),
        completed_at: millis_to_dt(row.get(10).unwrap_or(0)),
    }
}
