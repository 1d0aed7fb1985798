//! Result-driven transition lookup.
//!
//! `determine_next_step` is pure: same `(agent, task, result)` in, same
//! step out. `None` means the workflow pauses where it is.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use super::schema::{Condition, TaskTransitions, TransitionRule, WorkflowDefinition};
use crate::agents::{
    calendar::SCHEDULE_KICKOFF, delivery::DELIVER_DATA, extraction::EXTRACT_DATA,
    phenotype::{GENERATE_SQL, VALIDATE_FEASIBILITY}, qa::VALIDATE_EXTRACTION,
    requirements::GATHER_REQUIREMENTS, CALENDAR_AGENT, DELIVERY_AGENT, EXTRACTION_AGENT,
    PHENOTYPE_AGENT, QA_AGENT, REQUIREMENTS_AGENT,
};
use crate::models::WorkflowState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_task: Option<String>,
    pub next_state: WorkflowState,
}

impl NextStep {
    /// The `(agent, task)` to dispatch, when the step names both.
    pub fn dispatch(&self) -> Option<(&str, &str)> {
        match (&self.next_agent, &self.next_task) {
            (Some(agent), Some(task)) => Some((agent.as_str(), task.as_str())),
            _ => None,
        }
    }
}

type TaskKey = (String, String);

#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    rules: HashMap<TaskKey, Vec<TransitionRule>>,
    working_states: HashMap<TaskKey, WorkflowState>,
}

fn key(agent: &str, task: &str) -> TaskKey {
    (agent.to_string(), task.to_string())
}

fn rule(condition: Condition, next: Option<(&str, &str)>, next_state: WorkflowState) -> TransitionRule {
    TransitionRule {
        condition,
        next_agent: next.map(|(a, _)| a.to_string()),
        next_task: next.map(|(_, t)| t.to_string()),
        next_state,
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        let mut engine = Self::empty();

        engine.add_rule(
            PHENOTYPE_AGENT,
            VALIDATE_FEASIBILITY,
            rule(Condition::falsy("feasible"), None, WorkflowState::NotFeasible),
        );
        engine.add_rule(
            CALENDAR_AGENT,
            SCHEDULE_KICKOFF,
            rule(
                Condition::Always,
                Some((EXTRACTION_AGENT, EXTRACT_DATA)),
                WorkflowState::DataExtraction,
            ),
        );
        engine.add_rule(
            EXTRACTION_AGENT,
            EXTRACT_DATA,
            rule(
                Condition::Always,
                Some((QA_AGENT, VALIDATE_EXTRACTION)),
                WorkflowState::QaValidation,
            ),
        );
        engine.add_rule(
            QA_AGENT,
            VALIDATE_EXTRACTION,
            rule(Condition::equals("overall_status", "failed"), None, WorkflowState::QaFailed),
        );
        engine.add_rule(
            DELIVERY_AGENT,
            DELIVER_DATA,
            rule(Condition::truthy("delivered"), None, WorkflowState::Complete),
        );

        for (agent, task, state) in [
            (REQUIREMENTS_AGENT, GATHER_REQUIREMENTS, WorkflowState::RequirementsGathering),
            (PHENOTYPE_AGENT, VALIDATE_FEASIBILITY, WorkflowState::FeasibilityValidation),
            (PHENOTYPE_AGENT, GENERATE_SQL, WorkflowState::FeasibilityValidation),
            (CALENDAR_AGENT, SCHEDULE_KICKOFF, WorkflowState::ScheduleKickoff),
            (EXTRACTION_AGENT, EXTRACT_DATA, WorkflowState::DataExtraction),
            (QA_AGENT, VALIDATE_EXTRACTION, WorkflowState::QaValidation),
            (DELIVERY_AGENT, DELIVER_DATA, WorkflowState::DataDelivery),
        ] {
            engine.working_states.insert(key(agent, task), state);
        }
        engine
    }
}

impl WorkflowEngine {
    /// An engine with no transitions.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            working_states: HashMap::new(),
        }
    }

    /// Default table with the definition's entries layered on top. A
    /// definition entry replaces the default rules for its `(agent, task)`.
    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        let mut engine = Self::default();
        for TaskTransitions {
            agent,
            task,
            rules,
            working_state,
        } in &definition.transitions
        {
            engine.rules.insert(key(agent, task), rules.clone());
            if let Some(state) = working_state {
                engine.working_states.insert(key(agent, task), *state);
            }
        }
        tracing::info!(
            "[WorkflowEngine] Loaded workflow '{}' ({} transition entries)",
            definition.name,
            definition.transitions.len()
        );
        engine
    }

    pub fn add_rule(&mut self, agent: &str, task: &str, rule: TransitionRule) {
        self.rules.entry(key(agent, task)).or_default().push(rule);
    }

    pub fn determine_next_step(&self, agent: &str, task: &str, result: &Value) -> Option<NextStep> {
        let rules = self.rules.get(&key(agent, task))?;
        rules
            .iter()
            .find(|r| r.condition.holds(result))
            .map(|r| NextStep {
                next_agent: r.next_agent.clone(),
                next_task: r.next_task.clone(),
                next_state: r.next_state,
            })
    }

    pub fn state_for_task(&self, agent: &str, task: &str) -> Option<WorkflowState> {
        self.working_states.get(&key(agent, task)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_table() {
        let engine = WorkflowEngine::default();

        let step = engine
            .determine_next_step(PHENOTYPE_AGENT, VALIDATE_FEASIBILITY, &json!({ "feasible": false }))
            .unwrap();
        assert_eq!(step.next_state, WorkflowState::NotFeasible);
        assert!(step.dispatch().is_none());

        let step = engine
            .determine_next_step(EXTRACTION_AGENT, EXTRACT_DATA, &json!({}))
            .unwrap();
        assert_eq!(step.dispatch(), Some((QA_AGENT, VALIDATE_EXTRACTION)));
        assert_eq!(step.next_state, WorkflowState::QaValidation);

        let step = engine
            .determine_next_step(DELIVERY_AGENT, DELIVER_DATA, &json!({ "delivered": true }))
            .unwrap();
        assert_eq!(step.next_state, WorkflowState::Complete);
    }

    #[test]
    fn test_absent_transition_pauses() {
        let engine = WorkflowEngine::default();
        assert!(engine
            .determine_next_step(PHENOTYPE_AGENT, VALIDATE_FEASIBILITY, &json!({ "feasible": true }))
            .is_none());
        assert!(engine
            .determine_next_step(QA_AGENT, VALIDATE_EXTRACTION, &json!({ "overall_status": "passed" }))
            .is_none());
        assert!(engine.determine_next_step("unknown_agent", "x", &json!({})).is_none());
        assert!(WorkflowEngine::empty()
            .determine_next_step(EXTRACTION_AGENT, EXTRACT_DATA, &json!({}))
            .is_none());
    }

    #[test]
    fn test_determine_next_step_is_pure() {
        let engine = WorkflowEngine::default();
        let result = json!({ "overall_status": "failed" });
        let a = engine.determine_next_step(QA_AGENT, VALIDATE_EXTRACTION, &result);
        let b = engine.determine_next_step(QA_AGENT, VALIDATE_EXTRACTION, &result);
        assert_eq!(a, b);
        assert_eq!(a.map(|s| s.next_state), Some(WorkflowState::QaFailed));
    }

    #[test]
    fn test_definition_overrides_default() {
        let def = WorkflowDefinition::from_yaml(
            r#"
name: "strict-delivery"
transitions:
  - agent: delivery_agent
    task: deliver_data
    rules:
      - when: { falsy: delivered }
        next_state: human_review
"#,
        )
        .unwrap();
        let engine = WorkflowEngine::from_definition(&def);
        assert!(engine
            .determine_next_step(DELIVERY_AGENT, DELIVER_DATA, &json!({ "delivered": true }))
            .is_none());
        assert_eq!(
            engine
                .determine_next_step(DELIVERY_AGENT, DELIVER_DATA, &json!({}))
                .map(|s| s.next_state),
            Some(WorkflowState::HumanReview)
        );
        assert_eq!(
            engine.state_for_task(QA_AGENT, VALIDATE_EXTRACTION),
            Some(WorkflowState::QaValidation)
        );
    }
}
