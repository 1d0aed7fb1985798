//! Approval gates: creation with per-type deadlines, reviewer decisions and
//! the timeout sweep.
//!
//! Every status change is a compare-and-set on `status = 'pending'`, so an
//! approval resolves at most once.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::ServerError;
use crate::models::{
    Approval, ApprovalStatus, ApprovalType, EscalationReason, NewEscalation, Severity,
};
use crate::store::{ApprovalStore, AuditStore, EscalationStore};

#[derive(Clone)]
pub struct ApprovalService {
    approvals: ApprovalStore,
    escalations: EscalationStore,
    audit: AuditStore,
}

impl ApprovalService {
    pub fn new(approvals: ApprovalStore, escalations: EscalationStore, audit: AuditStore) -> Self {
        Self {
            approvals,
            escalations,
            audit,
        }
    }

    pub async fn create(
        &self,
        request_id: &str,
        approval_type: ApprovalType,
        approval_data: serde_json::Value,
        requested_by: &str,
    ) -> Result<Approval, ServerError> {
        let now = Utc::now();
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            approval_type,
            status: ApprovalStatus::Pending,
            approval_data,
            requested_by: requested_by.to_string(),
            reviewer: None,
            review_notes: None,
            modifications: None,
            created_at: now,
            reviewed_at: None,
            timeout_at: now + approval_type.timeout(),
        };
        self.approvals.insert(&approval).await?;
        self.audit
            .record(
                Some(request_id),
                "approval_requested",
                requested_by,
                json!({
                    "approvalId": approval.id,
                    "approvalType": approval_type.as_str(),
                    "timeoutAt": approval.timeout_at,
                }),
            )
            .await?;

        tracing::info!(
            "[ApprovalService] {} approval {} opened for request {} (due {})",
            approval_type,
            approval.id,
            request_id,
            approval.timeout_at
        );
        Ok(approval)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Approval>, ServerError> {
        self.approvals.get(id).await
    }

    pub async fn require(&self, id: &str) -> Result<Approval, ServerError> {
        self.get(id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Approval {} not found", id)))
    }

    pub async fn list(
        &self,
        status: Option<ApprovalStatus>,
        request_id: Option<&str>,
    ) -> Result<Vec<Approval>, ServerError> {
        self.approvals.list(status, request_id).await
    }

    pub async fn list_pending(&self) -> Result<Vec<Approval>, ServerError> {
        self.list(Some(ApprovalStatus::Pending), None).await
    }

    pub async fn approve(
        &self,
        id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<Approval, ServerError> {
        self.resolve(id, ApprovalStatus::Approved, reviewer, notes, None)
            .await
    }

    pub async fn modify(
        &self,
        id: &str,
        reviewer: &str,
        modifications: serde_json::Value,
        notes: Option<String>,
    ) -> Result<Approval, ServerError> {
        if !modifications.is_object() {
            return Err(ServerError::BadRequest(
                "Modifications must be a JSON object".to_string(),
            ));
        }
        self.resolve(
            id,
            ApprovalStatus::Modified,
            reviewer,
            notes,
            Some(modifications),
        )
        .await
    }

    pub async fn reject(
        &self,
        id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<Approval, ServerError> {
        self.resolve(id, ApprovalStatus::Rejected, reviewer, notes, None)
            .await
    }

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        reviewer: &str,
        notes: Option<String>,
        modifications: Option<serde_json::Value>,
    ) -> Result<Approval, ServerError> {
        let changed = self
            .approvals
            .resolve(
                id,
                status,
                Some(reviewer.to_string()),
                notes,
                modifications,
            )
            .await?;
        let approval = self.require(id).await?;
        if !changed {
            return Err(ServerError::Conflict(format!(
                "Approval {} is already {}",
                id,
                approval.status.as_str()
            )));
        }

        self.audit
            .record(
                Some(&approval.request_id),
                "approval_resolved",
                reviewer,
                json!({
                    "approvalId": approval.id,
                    "approvalType": approval.approval_type.as_str(),
                    "status": status.as_str(),
                    "notes": approval.review_notes,
                }),
            )
            .await?;
        tracing::info!(
            "[ApprovalService] Approval {} {} by {}",
            id,
            status.as_str(),
            reviewer
        );
        Ok(approval)
    }

    /// Time out every approval still pending past its deadline at `now`,
    /// opening a high-severity escalation for each.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, ServerError> {
        let overdue = self.approvals.list_overdue(now).await?;
        let mut timed_out = Vec::with_capacity(overdue.len());

        for approval in overdue {
            let changed = self
                .approvals
                .resolve(
                    &approval.id,
                    ApprovalStatus::Timeout,
                    None,
                    Some("No response before deadline".to_string()),
                    None,
                )
                .await?;
            if !changed {
                // Resolved by a reviewer between the scan and the update.
                continue;
            }

            self.escalations
                .create(NewEscalation {
                    request_id: approval.request_id.clone(),
                    agent_id: Some(approval.requested_by.clone()),
                    reason: EscalationReason::ApprovalTimeout,
                    severity: Severity::High,
                    details: json!({
                        "approvalId": approval.id,
                        "approvalType": approval.approval_type.as_str(),
                        "timeoutAt": approval.timeout_at,
                    }),
                })
                .await?;
            self.audit
                .record(
                    Some(&approval.request_id),
                    "approval_timeout",
                    "system",
                    json!({
                        "approvalId": approval.id,
                        "approvalType": approval.approval_type.as_str(),
                    }),
                )
                .await?;

            tracing::warn!(
                "[ApprovalService] {} approval {} for request {} timed out",
                approval.approval_type,
                approval.id,
                approval.request_id
            );
            timed_out.push(self.require(&approval.id).await?);
        }

        Ok(timed_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{CreateRequestInput, EscalationStatus};
    use crate::store::RequestStore;
    use chrono::Duration;

    async fn setup() -> (ApprovalService, EscalationStore, String) {
        let db = Database::open_in_memory().unwrap();
        let request = RequestStore::new(db.clone())
            .create(CreateRequestInput {
                researcher_name: "Dr. Lee".into(),
                researcher_email: "lee@example.org".into(),
                department: None,
                initial_request: "Diabetes cohort".into(),
                requirements: None,
            })
            .await
            .unwrap();
        let escalations = EscalationStore::new(db.clone());
        let service = ApprovalService::new(
            ApprovalStore::new(db.clone()),
            escalations.clone(),
            AuditStore::new(db),
        );
        (service, escalations, request.id)
    }

    #[tokio::test]
    async fn test_create_sets_deadline_by_type() {
        let (service, _, request_id) = setup().await;
        let approval = service
            .create(&request_id, ApprovalType::PhenotypeSql, json!({ "sql": "SELECT 1" }), "phenotype_agent")
            .await
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.timeout_at - approval.created_at, Duration::hours(48));
    }

    #[tokio::test]
    async fn test_resolution_is_monotonic() {
        let (service, _, request_id) = setup().await;
        let approval = service
            .create(&request_id, ApprovalType::Requirements, json!({}), "requirements_agent")
            .await
            .unwrap();

        let approved = service.approve(&approval.id, "irb", None).await.unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);

        let second = service.reject(&approval.id, "someone-else", Some("late".into())).await;
        assert!(matches!(second, Err(ServerError::Conflict(_))));

        let modify = service
            .modify(&approval.id, "someone-else", json!({ "minimum_cohort_size": 10 }), None)
            .await;
        assert!(matches!(modify, Err(ServerError::Conflict(_))));

        let stored = service.require(&approval.id).await.unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.reviewer.as_deref(), Some("irb"));
        assert!(stored.modifications.is_none());
    }

    #[tokio::test]
    async fn test_unknown_approval_is_not_found() {
        let (service, _, _) = setup().await;
        let result = service.approve("missing", "irb", None).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_check_timeouts_escalates_high() {
        let (service, escalations, request_id) = setup().await;
        let approval = service
            .create(&request_id, ApprovalType::Qa, json!({}), "qa_agent")
            .await
            .unwrap();

        let early = service.check_timeouts(Utc::now()).await.unwrap();
        assert!(early.is_empty());

        let later = Utc::now() + Duration::hours(25);
        let timed_out = service.check_timeouts(later).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].status, ApprovalStatus::Timeout);

        let opened = escalations
            .list(Some(EscalationStatus::PendingReview), Some(&request_id))
            .await
            .unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].severity, Severity::High);
        assert_eq!(opened[0].reason, EscalationReason::ApprovalTimeout);

        // Timed-out approvals cannot be approved afterwards.
        let late = service.approve(&approval.id, "irb", None).await;
        assert!(matches!(late, Err(ServerError::Conflict(_))));
        assert!(service.check_timeouts(later).await.unwrap().is_empty());
    }
}
