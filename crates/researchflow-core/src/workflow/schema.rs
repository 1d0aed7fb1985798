//! Transition table types.
//!
//! The built-in table lives in [`super::engine::WorkflowEngine::default`];
//! deployments may override it with a YAML file of the same shape:
//!
//! ```yaml
//! name: "research-data-request"
//! transitions:
//!   - agent: phenotype_agent
//!     task: validate_feasibility
//!     rules:
//!       - when: { falsy: feasible }
//!         next_state: not_feasible
//!   - agent: calendar_agent
//!     task: schedule_kickoff
//!     rules:
//!       - when: always
//!         next_agent: extraction_agent
//!         next_task: extract_data
//!         next_state: data_extraction
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::WorkflowState;

/// Predicate over an agent result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    /// `data[field] == value`
    Equals { field: String, value: Value },
    /// `data[field]` is present and not false / null / 0 / "" / [] / {}
    Truthy(String),
    Falsy(String),
}

impl Condition {
    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn truthy(field: &str) -> Self {
        Self::Truthy(field.to_string())
    }

    pub fn falsy(field: &str) -> Self {
        Self::Falsy(field.to_string())
    }

    pub fn holds(&self, data: &Value) -> bool {
        match self {
            Self::Always => true,
            Self::Equals { field, value } => lookup(data, field) == Some(value),
            Self::Truthy(field) => lookup(data, field).is_some_and(is_truthy),
            Self::Falsy(field) => !lookup(data, field).is_some_and(is_truthy),
        }
    }
}

/// Dotted path lookup (`qa_report.overall_status`).
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |value, key| value.get(key))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRule {
    #[serde(rename = "when")]
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<String>,
    pub next_state: WorkflowState,
}

/// All rules for one `(agent, task)` pair, evaluated in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransitions {
    pub agent: String,
    pub task: String,
    #[serde(default)]
    pub rules: Vec<TransitionRule>,
    /// Working state an explicitly routed call to this task runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_state: Option<WorkflowState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TaskTransitions>,
}

impl WorkflowDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse workflow YAML: {}", e))
    }

    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read workflow file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conditions() {
        let data = json!({ "feasible": false, "qa_report": { "overall_status": "failed" }, "rows": [] });
        assert!(Condition::Always.holds(&data));
        assert!(Condition::falsy("feasible").holds(&data));
        assert!(Condition::falsy("missing").holds(&data));
        assert!(!Condition::truthy("rows").holds(&data));
        assert!(Condition::equals("qa_report.overall_status", "failed").holds(&data));
        assert!(!Condition::equals("qa_report.overall_status", "passed").holds(&data));
    }

    #[test]
    fn test_parse_yaml_table() {
        let yaml = r#"
name: "research-data-request"
transitions:
  - agent: qa_agent
    task: validate_extraction
    rules:
      - when:
          equals: { field: overall_status, value: failed }
        next_state: qa_failed
  - agent: delivery_agent
    task: deliver_data
    working_state: data_delivery
    rules:
      - when: { truthy: delivered }
        next_state: complete
  - agent: calendar_agent
    task: schedule_kickoff
    rules:
      - when: always
        next_agent: extraction_agent
        next_task: extract_data
        next_state: data_extraction
"#;
        let def = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.transitions.len(), 3);
        assert_eq!(def.transitions[0].rules[0].condition, Condition::equals("overall_status", "failed"));
        assert_eq!(def.transitions[1].working_state, Some(WorkflowState::DataDelivery));
        assert_eq!(def.transitions[2].rules[0].condition, Condition::Always);
        assert_eq!(def.transitions[2].rules[0].next_state, WorkflowState::DataExtraction);
    }
}
