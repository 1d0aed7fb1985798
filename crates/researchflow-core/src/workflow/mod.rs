//! Workflow state machine.
//!
//! ```text
//! AgentResult.data ──► WorkflowEngine::determine_next_step ──► NextStep
//!                          │                                   (agent?, task?, state)
//!                  (agent, task) → [TransitionRule]
//!                          │
//!                  default table, optionally overridden by workflow YAML
//! ```

pub mod engine;
pub mod schema;

pub use engine::{NextStep, WorkflowEngine};
pub use schema::{Condition, TaskTransitions, TransitionRule, WorkflowDefinition};
