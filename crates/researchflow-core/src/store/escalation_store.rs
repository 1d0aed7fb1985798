use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{
    millis_to_dt, opt_millis_to_dt, Escalation, EscalationReason, EscalationStatus,
    NewEscalation, Severity,
};

const ESCALATION_COLUMNS: &str =
    "id, request_id, agent_id, reason, severity, details, status, resolution, created_at, resolved_at";

#[derive(Clone)]
pub struct EscalationStore {
    db: Database,
}

impl EscalationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: NewEscalation) -> Result<Escalation, ServerError> {
        let escalation = Escalation {
            id: Uuid::new_v4().to_string(),
            request_id: input.request_id,
            agent_id: input.agent_id,
            reason: input.reason,
            severity: input.severity,
            details: input.details,
            status: EscalationStatus::PendingReview,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let e = escalation.clone();
        let details = serde_json::to_string(&e.details)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO escalations (id, request_id, agent_id, reason, severity, details, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        e.id,
                        e.request_id,
                        e.agent_id,
                        e.reason.as_str(),
                        e.severity.as_str(),
                        details,
                        e.status.as_str(),
                        e.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;

        tracing::warn!(
            "[EscalationStore] Escalation {} opened for request {} ({}, severity {})",
            escalation.id,
            escalation.request_id,
            escalation.reason.as_str(),
            escalation.severity.as_str()
        );
        Ok(escalation)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Escalation>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM escalations WHERE id = ?1", ESCALATION_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_escalation(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(
        &self,
        status: Option<EscalationStatus>,
        request_id: Option<&str>,
    ) -> Result<Vec<Escalation>, ServerError> {
        let status = status.map(|s| s.as_str().to_string());
        let request_id = request_id.map(|s| s.to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM escalations
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR request_id = ?2)
                     ORDER BY created_at DESC",
                    ESCALATION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status, request_id], |row| Ok(row_to_escalation(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Close a pending escalation. Already-closed escalations are a conflict.
    pub async fn resolve(
        &self,
        id: &str,
        status: EscalationStatus,
        resolution: Option<String>,
    ) -> Result<Escalation, ServerError> {
        if status == EscalationStatus::PendingReview {
            return Err(ServerError::BadRequest(
                "An escalation can only be resolved or dismissed".to_string(),
            ));
        }
        let id_owned = id.to_string();
        let now = Utc::now().timestamp_millis();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE escalations SET status = ?2, resolution = ?3, resolved_at = ?4
                     WHERE id = ?1 AND status = 'pending_review'",
                    rusqlite::params![id_owned, status.as_str(), resolution, now],
                )?;
                Ok(n > 0)
            })
            .await?;

        let escalation = self
            .get(id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Escalation {} not found", id)))?;
        if !updated {
            return Err(ServerError::Conflict(format!(
                "Escalation {} is already {}",
                id,
                escalation.status.as_str()
            )));
        }
        Ok(escalation)
    }
}

fn row_to_escalation(row: &rusqlite::Row<'_>) -> Escalation {
    let reason: String = row.get(3).unwrap_or_default();
    let severity: String = row.get(4).unwrap_or_default();
    let details: String = row.get(5).unwrap_or_else(|_| "{}".to_string());
    let status: String = row.get(6).unwrap_or_default();

    Escalation {
        id: row.get(0).unwrap_or_default(),
        request_id: row.get(1).unwrap_or_default(),
        agent_id: row.get(2).unwrap_or(None),
        reason: EscalationReason::from_str(&reason).unwrap_or(EscalationReason::AgentError),
        severity: Severity::from_str(&severity).unwrap_or(Severity::Medium),
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        status: EscalationStatus::from_str(&status).unwrap_or(EscalationStatus::PendingReview),
        resolution: row.get(7).unwrap_or(None),
        created_at: millis_to_dt(row.get(8).unwrap_or(0)),
        resolved_at: opt_millis_to_dt(row.get(9).unwrap_or(None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_is_one_shot() {
        let store = EscalationStore::new(Database::open_in_memory().unwrap());
        let e = store
            .create(NewEscalation {
                request_id: "req-1".to_string(),
                agent_id: Some("qa_agent".to_string()),
                reason: EscalationReason::AgentError,
                severity: Severity::Medium,
                details: serde_json::json!({ "error": "boom" }),
            })
            .await
            .unwrap();

        let resolved = store
            .resolve(&e.id, EscalationStatus::Resolved, Some("rerun manually".into()))
            .await
            .unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let again = store.resolve(&e.id, EscalationStatus::Dismissed, None).await;
        assert!(matches!(again, Err(ServerError::Conflict(_))));
        let missing = store.resolve("nope", EscalationStatus::Resolved, None).await;
        assert!(matches!(missing, Err(ServerError::NotFound(_))));
    }
}
