use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::request::WorkflowState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Requirements,
    PhenotypeSql,
    Extraction,
    Qa,
    ScopeChange,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::PhenotypeSql => "phenotype_sql",
            Self::Extraction => "extraction",
            Self::Qa => "qa",
            Self::ScopeChange => "scope_change",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requirements" => Some(Self::Requirements),
            "phenotype_sql" => Some(Self::PhenotypeSql),
            "extraction" => Some(Self::Extraction),
            "qa" => Some(Self::Qa),
            "scope_change" => Some(Self::ScopeChange),
            _ => None,
        }
    }

    /// How long a reviewer has before the approval times out.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Requirements => Duration::hours(24),
            Self::PhenotypeSql => Duration::hours(48),
            Self::Extraction => Duration::hours(24),
            Self::Qa => Duration::hours(24),
            Self::ScopeChange => Duration::hours(72),
        }
    }

    /// The review state a request sits in while this approval is pending.
    pub fn review_state(&self) -> WorkflowState {
        match self {
            Self::Requirements => WorkflowState::RequirementsReview,
            Self::PhenotypeSql => WorkflowState::PhenotypeReview,
            Self::Extraction => WorkflowState::ExtractionReview,
            Self::Qa => WorkflowState::QaReview,
            Self::ScopeChange => WorkflowState::ScopeChangeReview,
        }
    }
}

impl std::fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Modified,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Modified => "modified",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "modified" => Some(Self::Modified),
            "rejected" => Some(Self::Rejected),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub request_id: String,
    pub approval_type: ApprovalType,
    pub status: ApprovalStatus,
    pub approval_data: serde_json::Value,
    pub requested_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifications: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    pub timeout_at: DateTime<Utc>,
}

impl Approval {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.timeout_at < now
    }
}

/// A reviewer's answer to an approval gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Modify,
    Reject,
}

impl Decision {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "modify" | "modified" => Some(Self::Modify),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub reviewer: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Changes a reviewer applied when the decision is `modify`.
    #[serde(default)]
    pub modifications: Option<serde_json::Value>,
}

impl ApprovalDecision {
    pub fn approve(reviewer: &str) -> Self {
        Self {
            decision: Decision::Approve,
            reviewer: reviewer.to_string(),
            notes: None,
            modifications: None,
        }
    }

    pub fn modify(reviewer: &str, modifications: serde_json::Value) -> Self {
        Self {
            decision: Decision::Modify,
            modifications: Some(modifications),
            ..Self::approve(reviewer)
        }
    }

    pub fn reject(reviewer: &str, notes: &str) -> Self {
        Self {
            decision: Decision::Reject,
            notes: Some(notes.to_string()),
            ..Self::approve(reviewer)
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_table() {
        assert_eq!(ApprovalType::Requirements.timeout(), Duration::hours(24));
        assert_eq!(ApprovalType::PhenotypeSql.timeout(), Duration::hours(48));
        assert_eq!(ApprovalType::ScopeChange.timeout(), Duration::hours(72));
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!(Decision::from_str("Approve"), Some(Decision::Approve));
        assert_eq!(Decision::from_str("modified"), Some(Decision::Modify));
        assert_eq!(Decision::from_str("nope"), None);
    }
}
