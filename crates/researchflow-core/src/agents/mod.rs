//! Per-stage task handlers.
//!
//! Agents never touch the request row. They read a context map and return
//! an [`AgentResult`]; the orchestrator decides what happens next and
//! persists everything.

pub mod calendar;
pub mod coordinator;
pub mod delivery;
pub mod extraction;
pub mod feasibility;
pub mod phenotype;
pub mod qa;
pub mod requirements;
pub mod runner;

pub use calendar::CalendarAgent;
pub use coordinator::CoordinatorAgent;
pub use delivery::DeliveryAgent;
pub use extraction::ExtractionAgent;
pub use phenotype::PhenotypeAgent;
pub use qa::QaAgent;
pub use requirements::RequirementsAgent;
pub use runner::{AgentFailure, AgentRegistry, AgentRun, AgentRunner, AgentState, RetryPolicy, TaskRecord};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ServerError;
use crate::llm::LlmError;
use crate::models::{ApprovalType, Requirements};
use crate::sql::SqlError;
use crate::viewdef::ViewError;

pub const REQUIREMENTS_AGENT: &str = "requirements_agent";
pub const PHENOTYPE_AGENT: &str = "phenotype_agent";
pub const CALENDAR_AGENT: &str = "calendar_agent";
pub const EXTRACTION_AGENT: &str = "extraction_agent";
pub const QA_AGENT: &str = "qa_agent";
pub const DELIVERY_AGENT: &str = "delivery_agent";
pub const COORDINATOR_AGENT: &str = "coordinator_agent";

/// Error kinds worth retrying.
pub const TRANSIENT_KINDS: &[&str] = &[
    "TimeoutError",
    "ConnectionError",
    "RateLimitError",
    "ServiceUnavailableError",
];

/// An agent failure, classified by kind name.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: String,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("ValidationError", message)
    }

    pub fn unknown_task(agent: &str, task: &str) -> Self {
        Self::new("UnknownTaskError", format!("{} does not handle task '{}'", agent, task))
    }

    pub fn is_transient(&self) -> bool {
        TRANSIENT_KINDS.contains(&self.kind.as_str())
    }
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ServerError> for AgentError {
    fn from(e: ServerError) -> Self {
        Self::new("DatabaseError", e.to_string())
    }
}

impl From<SqlError> for AgentError {
    fn from(e: SqlError) -> Self {
        Self::new("SqlError", e.to_string())
    }
}

impl From<ViewError> for AgentError {
    fn from(e: ViewError) -> Self {
        match e {
            ViewError::Fetch(_) => Self::new("ConnectionError", e.to_string()),
            _ => Self::new("ViewError", e.to_string()),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::new("IoError", e.to_string())
    }
}

/// What the orchestrator should do with a result. Auto-routing and an
/// approval request cannot both be set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Routing {
    /// Let the workflow engine decide.
    None,
    Forward { agent: String, task: String },
    Approval {
        approval_type: ApprovalType,
        approval_data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    /// Result payload; object keys are merged into the request context.
    pub data: Value,
    pub routing: Routing,
}

impl AgentResult {
    pub fn done(data: Value) -> Self {
        Self {
            data,
            routing: Routing::None,
        }
    }

    pub fn forward(data: Value, agent: &str, task: &str) -> Self {
        Self {
            data,
            routing: Routing::Forward {
                agent: agent.to_string(),
                task: task.to_string(),
            },
        }
    }

    pub fn approval(data: Value, approval_type: ApprovalType, approval_data: Value) -> Self {
        Self {
            data,
            routing: Routing::Approval {
                approval_type,
                approval_data,
            },
        }
    }

    pub fn requires_approval(&self) -> bool {
        matches!(self.routing, Routing::Approval { .. })
    }

    /// Short human-readable summary for the execution log.
    pub fn summary(&self) -> String {
        let keys: Vec<&str> = self
            .data
            .as_object()
            .map(|m| m.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        match &self.routing {
            Routing::None => format!("keys: {}", keys.join(", ")),
            Routing::Forward { agent, task } => {
                format!("keys: {}; forward to {}/{}", keys.join(", "), agent, task)
            }
            Routing::Approval { approval_type, .. } => {
                format!("keys: {}; awaiting {} approval", keys.join(", "), approval_type)
            }
        }
    }
}

pub type TaskContext = Map<String, Value>;

#[async_trait]
pub trait ResearchAgent: Send + Sync {
    fn id(&self) -> &str;

    /// Tasks this agent accepts.
    fn tasks(&self) -> &'static [&'static str];

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError>;
}

/// Structured requirements from the context, if any were recorded.
pub(crate) fn context_requirements(context: &TaskContext) -> Result<Option<Requirements>, AgentError> {
    match context.get("requirements") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| AgentError::validation(format!("invalid requirements in context: {}", e))),
    }
}

pub(crate) fn require_requirements(context: &TaskContext) -> Result<Requirements, AgentError> {
    context_requirements(context)?
        .ok_or_else(|| AgentError::validation("no requirements recorded for this request"))
}

pub(crate) fn context_str<'a>(context: &'a TaskContext, key: &str) -> Option<&'a str> {
    context.get(key).and_then(|v| v.as_str()).filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::from(LlmError::RateLimited("slow down".into())).is_transient());
        assert!(AgentError::from(LlmError::Timeout("30s".into())).is_transient());
        assert!(!AgentError::validation("bad").is_transient());
        assert!(!AgentError::from(LlmError::NotConfigured).is_transient());
    }

    #[test]
    fn test_summary_mentions_routing() {
        let result = AgentResult::approval(json!({ "feasible": true }), ApprovalType::PhenotypeSql, json!({}));
        assert!(result.requires_approval());
        assert!(result.summary().contains("phenotype_sql"));
        assert_eq!(
            AgentResult::forward(json!({}), QA_AGENT, "validate_extraction").summary(),
            "keys: ; forward to qa_agent/validate_extraction"
        );
    }
}
