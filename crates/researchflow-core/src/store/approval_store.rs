use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{
    millis_to_dt, opt_millis_to_dt, Approval, ApprovalStatus, ApprovalType,
};

const APPROVAL_COLUMNS: &str = "id, request_id, approval_type, status, approval_data, requested_by, \
     reviewer, review_notes, modifications, created_at, reviewed_at, timeout_at";

/// Row-level access to approval records.
///
/// Status changes go through [`ApprovalStore::resolve`], which only
/// touches rows that are still pending.
#[derive(Clone)]
pub struct ApprovalStore {
    db: Database,
}

impl ApprovalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, approval: &Approval) -> Result<(), ServerError> {
        let a = approval.clone();
        let data = serde_json::to_string(&a.approval_data)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO approvals (id, request_id, approval_type, status, approval_data, requested_by,
                        reviewer, review_notes, modifications, created_at, reviewed_at, timeout_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, ?7, NULL, ?8)",
                    rusqlite::params![
                        a.id,
                        a.request_id,
                        a.approval_type.as_str(),
                        a.status.as_str(),
                        data,
                        a.requested_by,
                        a.created_at.timestamp_millis(),
                        a.timeout_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Approval>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM approvals WHERE id = ?1", APPROVAL_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_approval(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(
        &self,
        status: Option<ApprovalStatus>,
        request_id: Option<&str>,
    ) -> Result<Vec<Approval>, ServerError> {
        let status = status.map(|s| s.as_str().to_string());
        let request_id = request_id.map(|s| s.to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approvals
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR request_id = ?2)
                     ORDER BY created_at DESC",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status, request_id], |row| Ok(row_to_approval(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, ServerError> {
        let now_ms = now.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approvals WHERE status = 'pending' AND timeout_at < ?1
                     ORDER BY timeout_at ASC",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![now_ms], |row| Ok(row_to_approval(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Move a pending approval to `status`. Returns `false` when the row
    /// was not pending (or does not exist); nothing is written then.
    pub async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        reviewer: Option<String>,
        notes: Option<String>,
        modifications: Option<serde_json::Value>,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let modifications = modifications
            .map(|m| serde_json::to_string(&m))
            .transpose()?;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE approvals
                     SET status = ?2, reviewer = ?3, review_notes = ?4, modifications = ?5, reviewed_at = ?6
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id, status.as_str(), reviewer, notes, modifications, now],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> Approval {
    let approval_type: String = row.get(2).unwrap_or_default();
    let status: String = row.get(3).unwrap_or_default();
    let data: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    let modifications: Option<String> = row.get(8).unwrap_or(None);

    Approval {
        id: row.get(0).unwrap_or_default(),
        request_id: row.get(1).unwrap_or_default(),
        approval_type: ApprovalType::from_str(&approval_type).unwrap_or(ApprovalType::Requirements),
        status: ApprovalStatus::from_str(&status).unwrap_or(ApprovalStatus::Pending),
        approval_data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        requested_by: row.get(5).unwrap_or_default(),
        reviewer: row.get(6).unwrap_or(None),
        review_notes: row.get(7).unwrap_or(None),
        modifications: modifications.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: millis_to_dt(row.get(9).unwrap_or(0)),
        reviewed_at: opt_millis_to_dt(row.get(10).unwrap_or(None)),
        timeout_at: millis_to_dt(row.get(11).unwrap_or(0)),
    }
}
