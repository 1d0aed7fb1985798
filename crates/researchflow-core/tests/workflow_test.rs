//! End-to-end tests for the orchestrator: approval gates, retries and
//! escalations, timeouts and scope changes, driven against an in-memory
//! SQLite database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use researchflow_core::agents::requirements::GATHER_REQUIREMENTS;
use researchflow_core::agents::{
    AgentError, AgentRegistry, AgentResult, ResearchAgent, RetryPolicy, TaskContext,
    REQUIREMENTS_AGENT,
};
use researchflow_core::cohort::{CohortCounter, SqlCohortCounter};
use researchflow_core::llm::LlmRouter;
use researchflow_core::models::{
    ApprovalDecision, ApprovalStatus, ApprovalType, CreateRequestInput, EscalationReason,
    EscalationStatus, ExecutionStatus, Requirements, Severity, WorkflowState,
};
use researchflow_core::orchestration::{EscalationAction, Orchestrator, ProcessOutcome};
use researchflow_core::sql::{PhenotypeQuery, SqlSandbox};
use researchflow_core::state::default_agents;
use researchflow_core::workflow::WorkflowEngine;
use researchflow_core::{AppConfig, Database, ServerError};

// ─── Fixtures ────────────────────────────────────────────────────────────

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
    }
}

struct FixedCount(u64);

#[async_trait]
impl CohortCounter for FixedCount {
    fn backend(&self) -> &str {
        "fixed"
    }

    async fn count(&self, _: &Requirements, _: &PhenotypeQuery) -> Result<u64, ServerError> {
        Ok(self.0)
    }
}

/// Fails `failures` times with `kind`, then reports incomplete requirements.
struct FlakyAgent {
    failures: usize,
    kind: &'static str,
    calls: AtomicUsize,
}

impl FlakyAgent {
    fn new(failures: usize, kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            failures,
            kind,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResearchAgent for FlakyAgent {
    fn id(&self) -> &str {
        REQUIREMENTS_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[GATHER_REQUIREMENTS]
    }

    async fn execute_task(&self, _task: &str, _context: &TaskContext) -> Result<AgentResult, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(AgentError::new(self.kind, "upstream did not answer"));
        }
        Ok(AgentResult::done(json!({ "requirements_complete": false })))
    }
}

fn seed_diabetic_patients(db: &Database, count: usize) {
    db.with_conn(|conn| {
        for i in 0..count {
            conn.execute(
                "INSERT INTO patients (patient_id, mrn, name, birth_date, gender, address, phone, email)
                 VALUES (?1, ?2, ?3, '1970-05-20', 'female', '1 Main St', '555-0100', ?4)",
                rusqlite::params![
                    format!("p{}", i),
                    format!("MRN-{}", i),
                    format!("Patient {}", i),
                    format!("patient{}@example.org", i),
                ],
            )?;
            conn.execute(
                "INSERT INTO conditions (id, patient_id, code, system, description, onset_date)
                 VALUES (?1, ?2, 'E11.9', 'icd10', 'Type 2 diabetes mellitus', '2024-03-01')",
                rusqlite::params![format!("c{}", i), format!("p{}", i)],
            )?;
        }
        Ok(())
    })
    .unwrap();
}

struct Harness {
    db: Database,
    orchestrator: Orchestrator,
    _dir: tempfile::TempDir,
}

fn harness(counter: Option<Arc<dyn CohortCounter>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let sandbox = SqlSandbox::new(db.clone());
    let counter = counter.unwrap_or_else(|| Arc::new(SqlCohortCounter::new(sandbox.clone())));
    let config = AppConfig {
        delivery_dir: dir.path().join("deliveries"),
        ..AppConfig::default()
    };
    let agents = default_agents(&config, &LlmRouter::disabled(), &sandbox, counter, fast_policy());
    Harness {
        orchestrator: Orchestrator::new(&db, agents, WorkflowEngine::default()),
        db,
        _dir: dir,
    }
}

fn harness_with(agent: Arc<dyn ResearchAgent>) -> (Database, Orchestrator) {
    let db = Database::open_in_memory().unwrap();
    let mut agents = AgentRegistry::new();
    agents.register(agent, fast_policy());
    let orchestrator = Orchestrator::new(&db, agents, WorkflowEngine::default());
    (db, orchestrator)
}

fn input(text: &str, requirements: Option<Value>) -> CreateRequestInput {
    CreateRequestInput {
        researcher_name: "Dr. Rivera".to_string(),
        researcher_email: "rivera@example.org".to_string(),
        department: Some("Endocrinology".to_string()),
        initial_request: text.to_string(),
        requirements,
    }
}

fn diabetes_requirements(minimum: u64) -> Value {
    json!({
        "study_title": "Glycaemic control in type 2 diabetes",
        "inclusion_criteria": ["diabetes"],
        "data_elements": ["demographics", "diagnoses"],
        "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
        "phi_level": "de_identified",
        "minimum_cohort_size": minimum
    })
}

fn awaiting(outcome: &ProcessOutcome, expected: ApprovalType) -> String {
    match outcome {
        ProcessOutcome::AwaitingApproval {
            approval_id,
            approval_type,
            ..
        } => {
            assert_eq!(*approval_type, expected);
            approval_id.clone()
        }
        other => panic!("expected awaiting {} approval, got {:?}", expected, other),
    }
}

const REVIEWER: &str = "governance@example.org";

// ─── Happy path ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_runs_through_every_gate_to_complete() {
    let h = harness(None);
    seed_diabetic_patients(&h.db, 60);
    let orch = &h.orchestrator;

    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort for 2024", Some(diabetes_requirements(50))), true)
        .await
        .unwrap();
    let outcome = outcome.unwrap();
    assert_eq!(outcome.state(), WorkflowState::RequirementsReview);
    let approval = awaiting(&outcome, ApprovalType::Requirements);

    let outcome = orch
        .process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    assert_eq!(outcome.state(), WorkflowState::PhenotypeReview);
    let approval = awaiting(&outcome, ApprovalType::PhenotypeSql);

    let feasibility = orch.artifacts().latest_feasibility(&request.id).await.unwrap().unwrap();
    assert!(feasibility.feasible);
    assert_eq!(feasibility.estimated_count, 60);

    let outcome = orch
        .process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    assert_eq!(outcome.state(), WorkflowState::QaReview);
    let approval = awaiting(&outcome, ApprovalType::Qa);

    let outcome = orch
        .process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            request_id: request.id.clone(),
            state: WorkflowState::Complete,
        }
    );

    let history = orch.history(&request.id).await.unwrap();
    assert_eq!(history.request.current_state, WorkflowState::Complete);
    assert!(history.request.completed_at.is_some());
    assert!(history.request.last_error.is_none());
    assert_eq!(history.approvals.len(), 3);
    assert!(history.approvals.iter().all(|a| a.status == ApprovalStatus::Approved));
    assert_eq!(history.executions.len(), 6);
    assert!(history
        .executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Succeeded));
    assert!(history.request.context.contains_key("kickoff_meeting"));

    assert_eq!(history.deliveries.len(), 1);
    let delivery = &history.deliveries[0];
    assert_eq!(delivery.record_count, 120);
    let demographics = delivery.files.iter().find(|f| f.name == "demographics.json").unwrap();
    let rows: Vec<Value> =
        serde_json::from_str(&std::fs::read_to_string(&demographics.path).unwrap()).unwrap();
    assert_eq!(rows.len(), 60);
    assert!(rows[0].get("name").is_none());
    assert!(rows[0].get("mrn").is_none());
    assert_eq!(rows[0]["birth_date"], "1970");
    assert!(!rows[0]["patient_id"].as_str().unwrap().starts_with('p'));
}

#[tokio::test]
async fn test_small_diabetes_cohort_is_not_feasible() {
    let h = harness(Some(Arc::new(FixedCount(40))));
    let orch = &h.orchestrator;

    let requirements = json!({
        "inclusion_criteria": ["diabetes"],
        "data_elements": ["demographics"],
        "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
        "phi_level": "de_identified",
        "minimum_cohort_size": 50
    });
    let (request, outcome) = orch
        .submit_request(input("Diabetes patients seen in 2024", Some(requirements)), true)
        .await
        .unwrap();
    let approval = awaiting(&outcome.unwrap(), ApprovalType::Requirements);

    let outcome = orch
        .process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            request_id: request.id.clone(),
            state: WorkflowState::NotFeasible,
        }
    );

    let record = orch.artifacts().latest_feasibility(&request.id).await.unwrap().unwrap();
    assert!(!record.feasible);
    assert_eq!(record.estimated_count, 40);
    let warning = record.report["warnings"]
        .as_array()
        .unwrap()
        .iter()
        .find(|w| w["kind"] == "small_cohort")
        .cloned()
        .unwrap();
    assert!(!warning["suggestion"].as_str().unwrap().is_empty());

    let err = orch.process_request(&request.id).await.unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));
}

// ─── Pauses and researcher input ─────────────────────────────────────────

#[tokio::test]
async fn test_incomplete_requirements_pause_until_researcher_answers() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;

    let (request, outcome) = orch
        .submit_request(input("Need some records please", None), true)
        .await
        .unwrap();
    let outcome = outcome.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Paused { .. }));
    assert_eq!(outcome.state(), WorkflowState::RequirementsGathering);

    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.context["requirements_complete"], false);
    assert!(!stored.context["questions"].as_array().unwrap().is_empty());
    assert!(orch.approvals().list_pending().await.unwrap().is_empty());

    let outcome = orch
        .submit_researcher_response(
            &request.id,
            "Adults with diabetes, demographics only, all of 2024, de-identified",
            Some(diabetes_requirements(50)),
        )
        .await
        .unwrap();
    awaiting(&outcome, ApprovalType::Requirements);

    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.context["conversation"].as_array().unwrap().len(), 1);
    let saved = orch.artifacts().get_requirements(&request.id).await.unwrap().unwrap();
    assert_eq!(saved.data.inclusion_criteria, vec!["diabetes".to_string()]);

    let err = orch
        .submit_researcher_response(&request.id, "one more thing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));
}

// ─── Approvals ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejected_requirements_are_gathered_again() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;

    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort", Some(diabetes_requirements(50))), true)
        .await
        .unwrap();
    let first = awaiting(&outcome.unwrap(), ApprovalType::Requirements);

    let outcome = orch
        .process_approval_response(&first, ApprovalDecision::reject(REVIEWER, "Add an IRB number"))
        .await
        .unwrap();
    let second = awaiting(&outcome, ApprovalType::Requirements);
    assert_ne!(first, second);
    assert_eq!(outcome.state(), WorkflowState::RequirementsReview);

    let rejected = orch.approvals().require(&first).await.unwrap();
    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.context["review_feedback"]["notes"], "Add an IRB number");
}

#[tokio::test]
async fn test_second_resolution_is_a_conflict() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;

    let (_, outcome) = orch
        .submit_request(input("Diabetes cohort", Some(diabetes_requirements(50))), true)
        .await
        .unwrap();
    let approval = awaiting(&outcome.unwrap(), ApprovalType::Requirements);

    orch.process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    let err = orch
        .process_approval_response(&approval, ApprovalDecision::reject(REVIEWER, "too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));

    let stored = orch.approvals().require(&approval).await.unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);
    assert!(stored.review_notes.is_none());
}

#[tokio::test]
async fn test_modified_phenotype_sql_drives_extraction() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    seed_diabetic_patients(&h.db, 5);
    let orch = &h.orchestrator;

    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort", Some(diabetes_requirements(3))), true)
        .await
        .unwrap();
    let approval = awaiting(&outcome.unwrap(), ApprovalType::Requirements);
    let outcome = orch
        .process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    let phenotype = awaiting(&outcome, ApprovalType::PhenotypeSql);

    let err = orch
        .process_approval_response(
            &phenotype,
            ApprovalDecision::modify(REVIEWER, json!({ "sql": "DELETE FROM patients" })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BadRequest(_)));
    let untouched = orch.approvals().require(&phenotype).await.unwrap();
    assert_eq!(untouched.status, ApprovalStatus::Pending);

    let outcome = orch
        .process_approval_response(
            &phenotype,
            ApprovalDecision::modify(
                REVIEWER,
                json!({ "sql": "SELECT patient_id FROM patients WHERE patient_id IN ('p1', 'p2')" }),
            ),
        )
        .await
        .unwrap();
    // Cohort of two is below the minimum of three: QA warns but still asks for review.
    awaiting(&outcome, ApprovalType::Qa);

    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.context["extraction"]["cohort_size"], 2);
    assert_eq!(stored.context["overall_status"], "warning");
}

// ─── Failures and escalations ────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failures_escalate_after_retries_then_retry_succeeds() {
    let agent = FlakyAgent::new(3, "TimeoutError");
    let (_db, orch) = harness_with(agent.clone());

    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort", None), true)
        .await
        .unwrap();
    let outcome = outcome.unwrap();
    let escalation_id = match &outcome {
        ProcessOutcome::Escalated { escalation_id, .. } => escalation_id.clone(),
        other => panic!("expected escalation, got {:?}", other),
    };
    assert_eq!(outcome.state(), WorkflowState::HumanReview);
    assert_eq!(agent.calls(), 3);

    let executions = orch.audit().list_executions(&request.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Escalated);
    assert_eq!(executions[0].retry_count, 2);

    let escalation = orch.escalations().get(&escalation_id).await.unwrap().unwrap();
    assert_eq!(escalation.reason, EscalationReason::RetriesExhausted);
    assert_eq!(escalation.severity, Severity::High);
    assert_eq!(escalation.details["task"], GATHER_REQUIREMENTS);

    let stored = orch.requests().require(&request.id).await.unwrap();
    assert!(stored.last_error.as_deref().unwrap().contains("TimeoutError"));
    assert!(matches!(
        orch.process_request(&request.id).await.unwrap_err(),
        ServerError::Conflict(_)
    ));

    let resolution = orch
        .resolve_escalation(&escalation_id, EscalationAction::Retry, Some("provider back".into()))
        .await
        .unwrap();
    assert_eq!(resolution.escalation.status, EscalationStatus::Resolved);
    let outcome = resolution.outcome.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Paused { .. }));
    assert_eq!(outcome.state(), WorkflowState::RequirementsGathering);
    assert_eq!(agent.calls(), 4);
    assert!(orch.requests().require(&request.id).await.unwrap().last_error.is_none());

    let err = orch
        .resolve_escalation(&escalation_id, EscalationAction::Dismiss, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));
}

#[tokio::test]
async fn test_non_transient_error_escalates_without_retry() {
    let agent = FlakyAgent::new(1, "ValidationError");
    let (_db, orch) = harness_with(agent.clone());

    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort", None), true)
        .await
        .unwrap();
    assert!(matches!(outcome.unwrap(), ProcessOutcome::Escalated { .. }));
    assert_eq!(agent.calls(), 1);

    let open = orch
        .escalations()
        .list(Some(EscalationStatus::PendingReview), Some(&request.id))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].reason, EscalationReason::AgentError);
    assert_eq!(open[0].severity, Severity::Medium);

    let resolution = orch
        .resolve_escalation(&open[0].id, EscalationAction::Abort, None)
        .await
        .unwrap();
    assert_eq!(resolution.outcome.unwrap().state(), WorkflowState::Failed);
    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.current_state, WorkflowState::Failed);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_unknown_agent_fails_the_request() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;
    let (request, _) = orch
        .submit_request(input("Diabetes cohort", None), false)
        .await
        .unwrap();

    let outcome = orch
        .route_task(&request.id, "billing_agent", "send_invoice", None)
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
    assert_eq!(outcome.state(), WorkflowState::Failed);

    let audit = orch.audit().list_for_request(&request.id).await.unwrap();
    assert!(audit.iter().any(|e| e.event_type == "routing_error"));
}

// ─── Timeouts and scope changes ──────────────────────────────────────────

#[tokio::test]
async fn test_approval_timeout_moves_request_to_human_review() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;
    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort", Some(diabetes_requirements(50))), true)
        .await
        .unwrap();
    let approval = awaiting(&outcome.unwrap(), ApprovalType::Requirements);

    assert!(orch.check_approval_timeouts().await.unwrap().is_empty());

    let timed_out = orch
        .check_approval_timeouts_at(Utc::now() + chrono::Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(timed_out.len(), 1);
    assert_eq!(timed_out[0].id, approval);
    assert_eq!(timed_out[0].status, ApprovalStatus::Timeout);

    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.current_state, WorkflowState::HumanReview);

    let open = orch
        .escalations()
        .list(Some(EscalationStatus::PendingReview), Some(&request.id))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].reason, EscalationReason::ApprovalTimeout);
    assert_eq!(open[0].severity, Severity::High);

    let resolution = orch
        .resolve_escalation(&open[0].id, EscalationAction::Retry, None)
        .await
        .unwrap();
    awaiting(&resolution.outcome.unwrap(), ApprovalType::Requirements);
}

#[tokio::test]
async fn test_resolved_timeout_lets_request_continue() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;
    let (request, outcome) = orch
        .submit_request(input("Diabetes cohort", Some(diabetes_requirements(50))), true)
        .await
        .unwrap();
    awaiting(&outcome.unwrap(), ApprovalType::Requirements);

    orch.check_approval_timeouts_at(Utc::now() + chrono::Duration::hours(25))
        .await
        .unwrap();
    let open = orch
        .escalations()
        .list(Some(EscalationStatus::PendingReview), Some(&request.id))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);

    let resolution = orch
        .resolve_escalation(&open[0].id, EscalationAction::Resolve, Some("reviewer back".into()))
        .await
        .unwrap();
    assert_eq!(resolution.escalation.status, EscalationStatus::Resolved);
    let outcome = resolution.outcome.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Paused { .. }));
    assert_eq!(outcome.state(), WorkflowState::RequirementsGathering);

    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.current_state, WorkflowState::RequirementsGathering);
    assert!(stored.last_error.is_none());

    let outcome = orch.process_request(&request.id).await.unwrap();
    let approval = awaiting(&outcome, ApprovalType::Requirements);
    let outcome = orch
        .process_approval_response(&approval, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    awaiting(&outcome, ApprovalType::PhenotypeSql);
}

#[tokio::test]
async fn test_dismissed_scope_change_timeout_restores_previous_state() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;
    let (request, _) = orch
        .submit_request(input("Need some records please", None), true)
        .await
        .unwrap();
    let outcome = orch
        .request_scope_change(&request.id, json!({ "data_elements": ["medications"] }), "rivera@example.org")
        .await
        .unwrap();
    awaiting(&outcome, ApprovalType::ScopeChange);

    orch.check_approval_timeouts_at(Utc::now() + chrono::Duration::hours(73))
        .await
        .unwrap();
    let stored = orch.requests().require(&request.id).await.unwrap();
    assert_eq!(stored.current_state, WorkflowState::HumanReview);
    let open = orch
        .escalations()
        .list(Some(EscalationStatus::PendingReview), Some(&request.id))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);

    let err = orch
        .resolve_escalation(&open[0].id, EscalationAction::Retry, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BadRequest(_)));

    let resolution = orch
        .resolve_escalation(&open[0].id, EscalationAction::Dismiss, None)
        .await
        .unwrap();
    assert_eq!(resolution.escalation.status, EscalationStatus::Dismissed);
    assert_eq!(
        resolution.outcome.unwrap().state(),
        WorkflowState::RequirementsGathering
    );
    let stored = orch.requests().require(&request.id).await.unwrap();
    assert!(!stored.context.contains_key("scope_change"));

    let outcome = orch
        .submit_researcher_response(&request.id, "Diabetes cohort for 2024", Some(diabetes_requirements(50)))
        .await
        .unwrap();
    awaiting(&outcome, ApprovalType::Requirements);
}

#[tokio::test]
async fn test_scope_change_reject_restores_state_and_approve_regathers() {
    let h = harness(Some(Arc::new(FixedCount(500))));
    let orch = &h.orchestrator;
    let (request, outcome) = orch
        .submit_request(input("Need some records please", None), true)
        .await
        .unwrap();
    assert_eq!(outcome.unwrap().state(), WorkflowState::RequirementsGathering);

    let outcome = orch
        .request_scope_change(&request.id, json!({ "data_elements": ["medications"] }), "rivera@example.org")
        .await
        .unwrap();
    assert_eq!(outcome.state(), WorkflowState::ScopeChangeReview);
    let change = awaiting(&outcome, ApprovalType::ScopeChange);

    let outcome = orch
        .process_approval_response(&change, ApprovalDecision::reject(REVIEWER, "out of scope"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Paused { .. }));
    assert_eq!(outcome.state(), WorkflowState::RequirementsGathering);

    let outcome = orch
        .request_scope_change(&request.id, diabetes_requirements(50), "rivera@example.org")
        .await
        .unwrap();
    let change = awaiting(&outcome, ApprovalType::ScopeChange);
    let outcome = orch
        .process_approval_response(&change, ApprovalDecision::approve(REVIEWER))
        .await
        .unwrap();
    awaiting(&outcome, ApprovalType::Requirements);

    let err = orch
        .request_scope_change(&request.id, json!({ "data_elements": ["vitals"] }), "rivera@example.org")
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));
}
