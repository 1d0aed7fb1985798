use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every state a research request can be in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    NewRequest,
    RequirementsGathering,
    RequirementsReview,
    FeasibilityValidation,
    PhenotypeReview,
    ScheduleKickoff,
    DataExtraction,
    ExtractionReview,
    QaValidation,
    QaReview,
    DataDelivery,
    ScopeChangeReview,
    HumanReview,
    Complete,
    Failed,
    NotFeasible,
    QaFailed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 17] = [
        Self::NewRequest,
        Self::RequirementsGathering,
        Self::RequirementsReview,
        Self::FeasibilityValidation,
        Self::PhenotypeReview,
        Self::ScheduleKickoff,
        Self::DataExtraction,
        Self::ExtractionReview,
        Self::QaValidation,
        Self::QaReview,
        Self::DataDelivery,
        Self::ScopeChangeReview,
        Self::HumanReview,
        Self::Complete,
        Self::Failed,
        Self::NotFeasible,
        Self::QaFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewRequest => "new_request",
            Self::RequirementsGathering => "requirements_gathering",
            Self::RequirementsReview => "requirements_review",
            Self::FeasibilityValidation => "feasibility_validation",
            Self::PhenotypeReview => "phenotype_review",
            Self::ScheduleKickoff => "schedule_kickoff",
            Self::DataExtraction => "data_extraction",
            Self::ExtractionReview => "extraction_review",
            Self::QaValidation => "qa_validation",
            Self::QaReview => "qa_review",
            Self::DataDelivery => "data_delivery",
            Self::ScopeChangeReview => "scope_change_review",
            Self::HumanReview => "human_review",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::NotFeasible => "not_feasible",
            Self::QaFailed => "qa_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == s)
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::NotFeasible | Self::QaFailed
        )
    }

    /// States in which the workflow waits on a human decision.
    pub fn is_review(&self) -> bool {
        matches!(
            self,
            Self::RequirementsReview
                | Self::PhenotypeReview
                | Self::ExtractionReview
                | Self::QaReview
                | Self::ScopeChangeReview
                | Self::HumanReview
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only state history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRequest {
    pub id: String,
    pub researcher_name: String,
    pub researcher_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    pub initial_request: String,
    pub current_state: WorkflowState,
    #[serde(default)]
    pub state_history: Vec<StateTransition>,
    /// Accumulated workflow context handed to agents.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchRequest {
    pub fn new(
        id: String,
        researcher_name: String,
        researcher_email: String,
        department: Option<String>,
        initial_request: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            researcher_name,
            researcher_email,
            department,
            initial_request,
            current_state: WorkflowState::NewRequest,
            state_history: Vec::new(),
            context: serde_json::Map::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The context an agent sees: request identity plus accumulated results.
    pub fn agent_context(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut ctx = self.context.clone();
        ctx.insert("request_id".into(), self.id.clone().into());
        ctx.insert("researcher_name".into(), self.researcher_name.clone().into());
        ctx.insert("researcher_email".into(), self.researcher_email.clone().into());
        ctx.insert("initial_request".into(), self.initial_request.clone().into());
        ctx
    }
}

/// Input for submitting a new research request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestInput {
    pub researcher_name: String,
    pub researcher_email: String,
    #[serde(default)]
    pub department: Option<String>,
    pub initial_request: String,
    /// Optional structured requirements supplied up front by the researcher.
    #[serde(default)]
    pub requirements: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_round_trip() {
        for state in WorkflowState::ALL {
            assert_eq!(WorkflowState::from_str(state.as_str()), Some(state));
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, serde_json::Value::String(state.as_str().to_string()));
        }
        assert_eq!(WorkflowState::from_str("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = WorkflowState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        assert_eq!(terminal, vec!["complete", "failed", "not_feasible", "qa_failed"]);
        assert!(!WorkflowState::HumanReview.is_terminal());
    }
}
