//! Orchestrator - drives a research request through its agents.
//!
//! The orchestrator is the only writer of `current_state`:
//!   1. Moves the request into the working state of the task it dispatches
//!   2. Runs the agent through its retrying runner and records the execution
//!   3. Persists result artefacts and merges the payload into the context
//!   4. Opens an approval, follows an explicit forward, consults the
//!      workflow engine, or pauses
//!
//! Reviewer decisions re-enter the loop through fixed forward/backward maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agents::{
    calendar::SCHEDULE_KICKOFF, coordinator::{NOTIFY_ESCALATION, SEND_NOTIFICATION},
    delivery::DELIVER_DATA, extraction::EXTRACT_DATA, phenotype::VALIDATE_FEASIBILITY,
    qa::VALIDATE_EXTRACTION, requirements::GATHER_REQUIREMENTS, AgentFailure, AgentRegistry,
    Routing, TaskContext, CALENDAR_AGENT, COORDINATOR_AGENT, DELIVERY_AGENT, EXTRACTION_AGENT,
    PHENOTYPE_AGENT, QA_AGENT, REQUIREMENTS_AGENT,
};
use crate::db::Database;
use crate::error::ServerError;
use crate::models::{
    AgentExecution, Approval, ApprovalDecision, ApprovalStatus, ApprovalType, AuditEntry,
    CreateRequestInput, Decision, Delivery, Escalation, EscalationReason, EscalationStatus,
    ExecutionStatus, NewEscalation, Requirements, ResearchRequest, Severity, WorkflowState,
};
use crate::services::ApprovalService;
use crate::sql::validate_select;
use crate::store::{ApprovalStore, ArtifactStore, AuditStore, EscalationStore, RequestStore};
use crate::workflow::WorkflowEngine;

const ORCHESTRATOR: &str = "orchestrator";

/// Upper bound on agent hops within one `route_task` call.
const MAX_HOPS: usize = 16;

// ─── Outcomes ────────────────────────────────────────────────────────────

/// Where a request ended up after the orchestrator stopped driving it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProcessOutcome {
    AwaitingApproval {
        request_id: String,
        state: WorkflowState,
        approval_id: String,
        approval_type: ApprovalType,
    },
    /// No transition applies; the request waits for input.
    Paused {
        request_id: String,
        state: WorkflowState,
        reason: String,
    },
    /// The request reached a terminal state.
    Completed {
        request_id: String,
        state: WorkflowState,
    },
    Escalated {
        request_id: String,
        state: WorkflowState,
        escalation_id: String,
        error: String,
    },
    Failed {
        request_id: String,
        state: WorkflowState,
        error: String,
    },
}

impl ProcessOutcome {
    pub fn state(&self) -> WorkflowState {
        match self {
            Self::AwaitingApproval { state, .. }
            | Self::Paused { state, .. }
            | Self::Completed { state, .. }
            | Self::Escalated { state, .. }
            | Self::Failed { state, .. } => *state,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::AwaitingApproval { request_id, .. }
            | Self::Paused { request_id, .. }
            | Self::Completed { request_id, .. }
            | Self::Escalated { request_id, .. }
            | Self::Failed { request_id, .. } => request_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::AwaitingApproval { .. } => "awaiting_approval",
            Self::Paused { .. } => "paused",
            Self::Completed { .. } => "completed",
            Self::Escalated { .. } => "escalated",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a reviewer does with an open escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Close it and re-run the task that failed.
    Retry,
    /// Close it; the issue was handled outside the workflow.
    Resolve,
    /// Close it as not actionable.
    Dismiss,
    /// Close it and fail the request.
    Abort,
}

impl EscalationAction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "resolve" | "resolved" => Some(Self::Resolve),
            "dismiss" | "dismissed" => Some(Self::Dismiss),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Resolve => "resolve",
            Self::Dismiss => "dismiss",
            Self::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationResolution {
    pub escalation: Escalation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ProcessOutcome>,
}

/// Everything recorded about one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHistory {
    pub request: ResearchRequest,
    pub audit: Vec<AuditEntry>,
    pub executions: Vec<AgentExecution>,
    pub approvals: Vec<Approval>,
    pub escalations: Vec<Escalation>,
    pub deliveries: Vec<Delivery>,
}

// ─── Routing maps ────────────────────────────────────────────────────────

/// Task to run after an approval is granted (approve or modify).
pub fn forward_route(approval_type: ApprovalType) -> (&'static str, &'static str) {
    match approval_type {
        ApprovalType::Requirements => (PHENOTYPE_AGENT, VALIDATE_FEASIBILITY),
        ApprovalType::PhenotypeSql => (CALENDAR_AGENT, SCHEDULE_KICKOFF),
        ApprovalType::Extraction => (QA_AGENT, VALIDATE_EXTRACTION),
        ApprovalType::Qa => (DELIVERY_AGENT, DELIVER_DATA),
        ApprovalType::ScopeChange => (REQUIREMENTS_AGENT, GATHER_REQUIREMENTS),
    }
}

/// Task to re-run after a rejection. Scope changes have none; the request
/// returns to the state it was in before the change was requested.
pub fn backward_route(approval_type: ApprovalType) -> Option<(&'static str, &'static str)> {
    match approval_type {
        ApprovalType::Requirements => Some((REQUIREMENTS_AGENT, GATHER_REQUIREMENTS)),
        ApprovalType::PhenotypeSql => Some((REQUIREMENTS_AGENT, GATHER_REQUIREMENTS)),
        ApprovalType::Extraction => Some((EXTRACTION_AGENT, EXTRACT_DATA)),
        ApprovalType::Qa => Some((EXTRACTION_AGENT, EXTRACT_DATA)),
        ApprovalType::ScopeChange => None,
    }
}

/// The task whose result asked for an approval of this type.
fn requesting_task(approval_type: ApprovalType) -> Option<(&'static str, &'static str)> {
    match approval_type {
        ApprovalType::Requirements => Some((REQUIREMENTS_AGENT, GATHER_REQUIREMENTS)),
        ApprovalType::PhenotypeSql => Some((PHENOTYPE_AGENT, VALIDATE_FEASIBILITY)),
        ApprovalType::Extraction => Some((EXTRACTION_AGENT, EXTRACT_DATA)),
        ApprovalType::Qa => Some((QA_AGENT, VALIDATE_EXTRACTION)),
        ApprovalType::ScopeChange => None,
    }
}

/// The task that moves a request on from a working state.
fn task_for_state(state: WorkflowState) -> Option<(&'static str, &'static str)> {
    match state {
        WorkflowState::NewRequest | WorkflowState::RequirementsGathering => {
            Some((REQUIREMENTS_AGENT, GATHER_REQUIREMENTS))
        }
        WorkflowState::FeasibilityValidation => Some((PHENOTYPE_AGENT, VALIDATE_FEASIBILITY)),
        WorkflowState::ScheduleKickoff => Some((CALENDAR_AGENT, SCHEDULE_KICKOFF)),
        WorkflowState::DataExtraction => Some((EXTRACTION_AGENT, EXTRACT_DATA)),
        WorkflowState::QaValidation => Some((QA_AGENT, VALIDATE_EXTRACTION)),
        WorkflowState::DataDelivery => Some((DELIVERY_AGENT, DELIVER_DATA)),
        _ => None,
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Orchestrator {
    requests: RequestStore,
    artifacts: ArtifactStore,
    audit: AuditStore,
    escalations: EscalationStore,
    approvals: ApprovalService,
    agents: AgentRegistry,
    engine: WorkflowEngine,
}

impl Orchestrator {
    pub fn new(db: &Database, agents: AgentRegistry, engine: WorkflowEngine) -> Self {
        let audit = AuditStore::new(db.clone());
        let escalations = EscalationStore::new(db.clone());
        Self {
            requests: RequestStore::new(db.clone()),
            artifacts: ArtifactStore::new(db.clone()),
            approvals: ApprovalService::new(
                ApprovalStore::new(db.clone()),
                escalations.clone(),
                audit.clone(),
            ),
            audit,
            escalations,
            agents,
            engine,
        }
    }

    pub fn requests(&self) -> &RequestStore {
        &self.requests
    }

    pub fn approvals(&self) -> &ApprovalService {
        &self.approvals
    }

    pub fn escalations(&self) -> &EscalationStore {
        &self.escalations
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn audit(&self) -> &AuditStore {
        &self.audit
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    // ─── Entry points ────────────────────────────────────────────────────

    /// Store a new request and, when `auto_start` is set, start gathering
    /// requirements right away.
    pub async fn submit_request(
        &self,
        input: CreateRequestInput,
        auto_start: bool,
    ) -> Result<(ResearchRequest, Option<ProcessOutcome>), ServerError> {
        let request = self.requests.create(input).await?;
        self.audit
            .record(
                Some(&request.id),
                "request_submitted",
                &request.researcher_email,
                json!({ "researcherName": request.researcher_name, "department": request.department }),
            )
            .await?;
        tracing::info!(
            "[Orchestrator] Request {} submitted by {}",
            request.id,
            request.researcher_email
        );

        if !auto_start {
            return Ok((request, None));
        }
        let outcome = self.process_request(&request.id).await?;
        let request = self.requests.require(&request.id).await?;
        Ok((request, Some(outcome)))
    }

    /// Run whatever task the request's current state calls for.
    pub async fn process_request(&self, request_id: &str) -> Result<ProcessOutcome, ServerError> {
        let request = self.requests.require(request_id).await?;
        let state = request.current_state;
        if state.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "Request {} is already {}",
                request_id, state
            )));
        }
        if state == WorkflowState::HumanReview {
            return Err(ServerError::Conflict(format!(
                "Request {} is waiting on an escalation to be resolved",
                request_id
            )));
        }
        if state.is_review() {
            return Err(ServerError::Conflict(format!(
                "Request {} is waiting on a reviewer ({})",
                request_id, state
            )));
        }
        let (agent, task) = task_for_state(state).ok_or_else(|| {
            ServerError::Internal(format!("No task is defined for state {}", state))
        })?;
        self.route_task(request_id, agent, task, None).await
    }

    /// Run `agent_id/task` for a request and keep going until the workflow
    /// needs a human, pauses or finishes. `context` entries are merged into
    /// the stored context first.
    ///
    /// Failures after the request has been loaded never propagate: the
    /// request moves to `human_review` and the outcome reports the error.
    pub async fn route_task(
        &self,
        request_id: &str,
        agent_id: &str,
        task: &str,
        context: Option<TaskContext>,
    ) -> Result<ProcessOutcome, ServerError> {
        let request = self.requests.require(request_id).await?;
        if request.current_state.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "Request {} is already {}",
                request_id, request.current_state
            )));
        }
        if let Some(patch) = context.filter(|c| !c.is_empty()) {
            let mut merged = request.context.clone();
            merged.extend(patch);
            self.requests.update_context(request_id, merged).await?;
        }

        match self.drive(request_id, agent_id.to_string(), task.to_string()).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => self.recover(request_id, agent_id, task, error).await,
        }
    }

    /// Apply a reviewer decision and re-enter the workflow.
    pub async fn process_approval_response(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ProcessOutcome, ServerError> {
        let approval = self.approvals.require(approval_id).await?;
        if approval.status.is_resolved() {
            return Err(ServerError::Conflict(format!(
                "Approval {} is already {}",
                approval_id,
                approval.status.as_str()
            )));
        }
        let request = self.requests.require(&approval.request_id).await?;
        let review_state = approval.approval_type.review_state();
        if request.current_state != review_state {
            return Err(ServerError::Conflict(format!(
                "Request {} is in {}, not {}",
                request.id, request.current_state, review_state
            )));
        }

        let reviewer = decision.reviewer.trim();
        if reviewer.is_empty() {
            return Err(ServerError::BadRequest("reviewer is required".to_string()));
        }
        if let (Decision::Modify, Some(modifications)) = (decision.decision, decision.modifications.as_ref()) {
            check_modifications(&request, approval.approval_type, modifications)?;
        }
        let resolved = match decision.decision {
            Decision::Approve => self.approvals.approve(approval_id, reviewer, decision.notes).await?,
            Decision::Modify => {
                let modifications = decision.modifications.ok_or_else(|| {
                    ServerError::BadRequest("modify requires modifications".to_string())
                })?;
                self.approvals
                    .modify(approval_id, reviewer, modifications, decision.notes)
                    .await?
            }
            Decision::Reject => self.approvals.reject(approval_id, reviewer, decision.notes).await?,
        };

        match resolved.status {
            ApprovalStatus::Approved | ApprovalStatus::Modified => {
                self.apply_approval(&request, &resolved).await?;
                let (agent, task) = forward_route(resolved.approval_type);
                self.route_task(&request.id, agent, task, None).await
            }
            _ => self.apply_rejection(&request, &resolved).await,
        }
    }

    /// Open a scope change review for a request that is not waiting on
    /// another reviewer.
    pub async fn request_scope_change(
        &self,
        request_id: &str,
        changes: Value,
        requested_by: &str,
    ) -> Result<ProcessOutcome, ServerError> {
        if !changes.as_object().is_some_and(|c| !c.is_empty()) {
            return Err(ServerError::BadRequest(
                "Scope changes must be a non-empty JSON object".to_string(),
            ));
        }
        let request = self.requests.require(request_id).await?;
        let state = request.current_state;
        if state.is_terminal() || state.is_review() {
            return Err(ServerError::Conflict(format!(
                "Request {} cannot change scope while {}",
                request_id, state
            )));
        }

        let mut context = request.context.clone();
        context.insert(
            "scope_change".into(),
            json!({
                "previous_state": state,
                "changes": changes,
                "requested_by": requested_by,
                "requested_at": Utc::now(),
            }),
        );
        self.requests.update_context(request_id, context).await?;

        let data = json!({
            "changes": changes,
            "previous_state": state,
            "current_requirements": request.context.get("requirements").cloned().unwrap_or(Value::Null),
        });
        self.open_approval(request_id, requested_by, ApprovalType::ScopeChange, data)
            .await
    }

    /// Record a researcher reply and re-run requirements gathering.
    pub async fn submit_researcher_response(
        &self,
        request_id: &str,
        message: &str,
        requirements: Option<Value>,
    ) -> Result<ProcessOutcome, ServerError> {
        if message.trim().is_empty() && requirements.is_none() {
            return Err(ServerError::BadRequest(
                "A message or requirements are required".to_string(),
            ));
        }
        let request = self.requests.require(request_id).await?;
        if !matches!(
            request.current_state,
            WorkflowState::NewRequest | WorkflowState::RequirementsGathering
        ) {
            return Err(ServerError::Conflict(format!(
                "Request {} is not gathering requirements ({})",
                request_id, request.current_state
            )));
        }

        let mut context = request.context.clone();
        if !message.trim().is_empty() {
            let entry = json!({ "role": "researcher", "content": message.trim(), "at": Utc::now() });
            match context.get_mut("conversation").and_then(|c| c.as_array_mut()) {
                Some(conversation) => conversation.push(entry),
                None => {
                    context.insert("conversation".into(), Value::Array(vec![entry]));
                }
            }
        }
        if let Some(patch) = requirements {
            let updated = patch_requirements(&context, &patch)?;
            context.insert("requirements".into(), serde_json::to_value(&updated)?);
        }
        self.requests.update_context(request_id, context).await?;
        self.audit
            .record(
                Some(request_id),
                "researcher_response",
                &request.researcher_email,
                json!({ "length": message.len() }),
            )
            .await?;

        self.route_task(request_id, REQUIREMENTS_AGENT, GATHER_REQUIREMENTS, None)
            .await
    }

    pub async fn check_approval_timeouts(&self) -> Result<Vec<Approval>, ServerError> {
        self.check_approval_timeouts_at(Utc::now()).await
    }

    /// Time out overdue approvals as of `now` and move their requests to
    /// `human_review` when they are still waiting on that approval.
    pub async fn check_approval_timeouts_at(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, ServerError> {
        let timed_out = self.approvals.check_timeouts(now).await?;
        for approval in &timed_out {
            let Some(request) = self.requests.get(&approval.request_id).await? else {
                continue;
            };
            if request.current_state != approval.approval_type.review_state() {
                continue;
            }
            let reason = format!("{} approval {} timed out", approval.approval_type, approval.id);
            self.move_to(&request.id, WorkflowState::HumanReview, &reason).await?;
            self.requests.set_error(&request.id, Some(reason)).await?;

            let open = self
                .escalations
                .list(Some(EscalationStatus::PendingReview), Some(&request.id))
                .await?;
            if let Some(escalation) = open
                .iter()
                .find(|e| e.details["approvalId"].as_str() == Some(approval.id.as_str()))
            {
                self.notify_escalation(escalation).await;
            }
        }
        if !timed_out.is_empty() {
            tracing::warn!("[Orchestrator] {} approval(s) timed out", timed_out.len());
        }
        Ok(timed_out)
    }

    pub async fn resolve_escalation(
        &self,
        escalation_id: &str,
        action: EscalationAction,
        notes: Option<String>,
    ) -> Result<EscalationResolution, ServerError> {
        let escalation = self
            .escalations
            .get(escalation_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Escalation {} not found", escalation_id)))?;
        if escalation.status != EscalationStatus::PendingReview {
            return Err(ServerError::Conflict(format!(
                "Escalation {} is already {}",
                escalation_id,
                escalation.status.as_str()
            )));
        }
        let request_id = escalation.request_id.clone();

        let retry_target = match action {
            EscalationAction::Retry => {
                let target = retry_target(&escalation).ok_or_else(|| {
                    ServerError::BadRequest(format!(
                        "Escalation {} has no task to retry",
                        escalation_id
                    ))
                })?;
                let request = self.requests.require(&request_id).await?;
                if request.current_state != WorkflowState::HumanReview {
                    return Err(ServerError::Conflict(format!(
                        "Request {} is in {}, not human_review",
                        request_id, request.current_state
                    )));
                }
                Some(target)
            }
            _ => None,
        };

        let status = match action {
            EscalationAction::Dismiss => EscalationStatus::Dismissed,
            _ => EscalationStatus::Resolved,
        };
        let resolution = notes.or_else(|| Some(action.as_str().to_string()));
        let escalation = self.escalations.resolve(escalation_id, status, resolution).await?;
        self.audit
            .record(
                Some(&request_id),
                "escalation_resolved",
                ORCHESTRATOR,
                json!({ "escalationId": escalation_id, "action": action.as_str() }),
            )
            .await?;

        let outcome = match (action, retry_target) {
            (EscalationAction::Retry, Some((agent, task))) => {
                self.requests.set_error(&request_id, None).await?;
                Some(self.route_task(&request_id, &agent, &task, None).await?)
            }
            (EscalationAction::Abort, _) => {
                let request = self.requests.require(&request_id).await?;
                let state = if request.current_state.is_terminal() {
                    request.current_state
                } else {
                    self.move_to(&request_id, WorkflowState::Failed, "aborted after escalation")
                        .await?
                };
                Some(ProcessOutcome::Failed {
                    request_id: request_id.clone(),
                    state,
                    error: "Aborted by reviewer".to_string(),
                })
            }
            (EscalationAction::Resolve | EscalationAction::Dismiss, _) => {
                self.reopen_after_escalation(&request_id, &escalation).await?
            }
            _ => None,
        };
        Ok(EscalationResolution { escalation, outcome })
    }

    /// Move a request out of `human_review` once its last open escalation
    /// is closed without a retry, so it can be processed again.
    async fn reopen_after_escalation(
        &self,
        request_id: &str,
        escalation: &Escalation,
    ) -> Result<Option<ProcessOutcome>, ServerError> {
        let request = self.requests.require(request_id).await?;
        if request.current_state != WorkflowState::HumanReview {
            return Ok(None);
        }
        let open = self
            .escalations
            .list(Some(EscalationStatus::PendingReview), Some(request_id))
            .await?;
        if !open.is_empty() {
            tracing::info!(
                "[Orchestrator] Request {} still has {} open escalation(s)",
                request_id,
                open.len()
            );
            return Ok(None);
        }

        let resumed = resume_state(&request, escalation);
        if request.context.contains_key("scope_change") {
            let mut context = request.context.clone();
            context.remove("scope_change");
            self.requests.update_context(request_id, context).await?;
        }
        self.requests.set_error(request_id, None).await?;
        let state = self
            .move_to(request_id, resumed, "escalation closed by reviewer")
            .await?;
        tracing::info!(
            "[Orchestrator] Request {} resumed in {} after escalation {}",
            request_id,
            state,
            escalation.id
        );
        Ok(Some(ProcessOutcome::Paused {
            request_id: request_id.to_string(),
            state,
            reason: "Escalation closed; ready to continue".to_string(),
        }))
    }

    pub async fn history(&self, request_id: &str) -> Result<RequestHistory, ServerError> {
        let request = self.requests.require(request_id).await?;
        Ok(RequestHistory {
            audit: self.audit.list_for_request(request_id).await?,
            executions: self.audit.list_executions(request_id).await?,
            approvals: self.approvals.list(None, Some(request_id)).await?,
            escalations: self.escalations.list(None, Some(request_id)).await?,
            deliveries: self.artifacts.list_deliveries(request_id).await?,
            request,
        })
    }

    // ─── Routing loop ────────────────────────────────────────────────────

    async fn drive(
        &self,
        request_id: &str,
        mut agent_id: String,
        mut task: String,
    ) -> Result<ProcessOutcome, ServerError> {
        for _ in 0..MAX_HOPS {
            let Some(runner) = self.agents.get(&agent_id) else {
                let error = format!("Unknown agent '{}'", agent_id);
                tracing::error!("[Orchestrator] {} (request {})", error, request_id);
                let state = self.move_to(request_id, WorkflowState::Failed, &error).await?;
                self.requests.set_error(request_id, Some(error.clone())).await?;
                self.audit
                    .record(
                        Some(request_id),
                        "routing_error",
                        ORCHESTRATOR,
                        json!({ "agentId": agent_id, "task": task, "error": error }),
                    )
                    .await?;
                return Ok(ProcessOutcome::Failed {
                    request_id: request_id.to_string(),
                    state,
                    error,
                });
            };

            if let Some(working) = self.engine.state_for_task(&agent_id, &task) {
                self.move_to(request_id, working, &format!("dispatch {}/{}", agent_id, task))
                    .await?;
            }
            let request = self.requests.require(request_id).await?;
            self.audit
                .record(
                    Some(request_id),
                    "agent_dispatched",
                    ORCHESTRATOR,
                    json!({ "agentId": agent_id, "task": task, "state": request.current_state }),
                )
                .await?;
            tracing::info!("[Orchestrator] {} → {}/{}", request_id, agent_id, task);

            let run = match runner.run(&task, &request.agent_context()).await {
                Ok(run) => run,
                Err(failure) => return self.escalate_failure(&request, &agent_id, &task, failure).await,
            };
            self.record_execution(
                request_id,
                &agent_id,
                &task,
                ExecutionStatus::Succeeded,
                run.retry_count,
                run.duration_ms,
                None,
                Some(run.result.summary()),
                run.started_at,
            )
            .await?;
            self.persist_result(&request, &agent_id, &run.result.data).await?;

            match run.result.routing {
                Routing::Approval {
                    approval_type,
                    approval_data,
                } => {
                    return self
                        .open_approval(request_id, &agent_id, approval_type, approval_data)
                        .await;
                }
                Routing::Forward { agent, task: next } => {
                    agent_id = agent;
                    task = next;
                    continue;
                }
                Routing::None => {}
            }

            let Some(step) = self.engine.determine_next_step(&agent_id, &task, &run.result.data) else {
                let state = self.current_state(request_id).await?;
                tracing::info!(
                    "[Orchestrator] No transition after {}/{}; request {} paused in {}",
                    agent_id,
                    task,
                    request_id,
                    state
                );
                return Ok(ProcessOutcome::Paused {
                    request_id: request_id.to_string(),
                    state,
                    reason: format!("Waiting for input after {}/{}", agent_id, task),
                });
            };

            let reason = format!("{}/{} completed", agent_id, task);
            let state = self.move_to(request_id, step.next_state, &reason).await?;
            if let Some((next_agent, next_task)) = step.dispatch() {
                agent_id = next_agent.to_string();
                task = next_task.to_string();
                continue;
            }
            if state.is_terminal() {
                self.audit
                    .record(Some(request_id), "request_finished", ORCHESTRATOR, json!({ "state": state }))
                    .await?;
                return Ok(ProcessOutcome::Completed {
                    request_id: request_id.to_string(),
                    state,
                });
            }
            return Ok(ProcessOutcome::Paused {
                request_id: request_id.to_string(),
                state,
                reason,
            });
        }
        Err(ServerError::Internal(format!(
            "Routing for request {} exceeded {} hops",
            request_id, MAX_HOPS
        )))
    }

    /// Move to `human_review` after an unexpected routing error.
    async fn recover(
        &self,
        request_id: &str,
        agent_id: &str,
        task: &str,
        error: ServerError,
    ) -> Result<ProcessOutcome, ServerError> {
        let message = error.to_string();
        tracing::error!(
            "[Orchestrator] Routing {}/{} for request {} failed: {}",
            agent_id,
            task,
            request_id,
            message
        );
        let state = match self
            .move_to(request_id, WorkflowState::HumanReview, &format!("routing error: {}", message))
            .await
        {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("[Orchestrator] Could not move {} to human_review: {}", request_id, e);
                self.current_state(request_id).await.unwrap_or(WorkflowState::HumanReview)
            }
        };
        if let Err(e) = self.requests.set_error(request_id, Some(message.clone())).await {
            tracing::error!("[Orchestrator] Could not record error for {}: {}", request_id, e);
        }
        if let Err(e) = self
            .audit
            .record(
                Some(request_id),
                "routing_error",
                ORCHESTRATOR,
                json!({ "agentId": agent_id, "task": task, "error": message }),
            )
            .await
        {
            tracing::error!("[Orchestrator] Could not audit routing error: {}", e);
        }
        Ok(ProcessOutcome::Failed {
            request_id: request_id.to_string(),
            state,
            error: message,
        })
    }

    async fn escalate_failure(
        &self,
        request: &ResearchRequest,
        agent_id: &str,
        task: &str,
        failure: AgentFailure,
    ) -> Result<ProcessOutcome, ServerError> {
        let (reason, severity) = if failure.retries_exhausted {
            (EscalationReason::RetriesExhausted, Severity::High)
        } else {
            (EscalationReason::AgentError, Severity::Medium)
        };
        let error = failure.error.to_string();
        self.record_execution(
            &request.id,
            agent_id,
            task,
            ExecutionStatus::Escalated,
            failure.retry_count,
            failure.duration_ms,
            Some(error.clone()),
            None,
            failure.started_at,
        )
        .await?;

        let escalation = self
            .escalations
            .create(NewEscalation {
                request_id: request.id.clone(),
                agent_id: Some(agent_id.to_string()),
                reason,
                severity,
                details: json!({
                    "task": task,
                    "errorKind": failure.error.kind,
                    "error": failure.error.message,
                    "retryCount": failure.retry_count,
                    "state": request.current_state,
                }),
            })
            .await?;
        let state = self
            .move_to(&request.id, WorkflowState::HumanReview, &format!("{} failed: {}", agent_id, error))
            .await?;
        self.requests.set_error(&request.id, Some(error.clone())).await?;
        self.audit
            .record(
                Some(&request.id),
                "agent_failed",
                agent_id,
                json!({ "task": task, "error": error, "escalationId": escalation.id }),
            )
            .await?;
        self.notify_escalation(&escalation).await;

        Ok(ProcessOutcome::Escalated {
            request_id: request.id.clone(),
            state,
            escalation_id: escalation.id,
            error,
        })
    }

    async fn open_approval(
        &self,
        request_id: &str,
        requested_by: &str,
        approval_type: ApprovalType,
        approval_data: Value,
    ) -> Result<ProcessOutcome, ServerError> {
        let approval = self
            .approvals
            .create(request_id, approval_type, approval_data, requested_by)
            .await?;
        let state = self
            .move_to(
                request_id,
                approval_type.review_state(),
                &format!("awaiting {} approval", approval_type),
            )
            .await?;
        self.notify_approval(&approval).await;
        Ok(ProcessOutcome::AwaitingApproval {
            request_id: request_id.to_string(),
            state,
            approval_id: approval.id,
            approval_type,
        })
    }

    // ─── Persistence helpers ─────────────────────────────────────────────

    /// Transition unless the request is already in `to`.
    async fn move_to(&self, request_id: &str, to: WorkflowState, reason: &str) -> Result<WorkflowState, ServerError> {
        let current = self.current_state(request_id).await?;
        if current == to {
            return Ok(to);
        }
        Ok(self.requests.transition(request_id, to, reason).await?.current_state)
    }

    async fn current_state(&self, request_id: &str) -> Result<WorkflowState, ServerError> {
        Ok(self.requests.require(request_id).await?.current_state)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_execution(
        &self,
        request_id: &str,
        agent_id: &str,
        task: &str,
        status: ExecutionStatus,
        retry_count: u32,
        duration_ms: u64,
        error: Option<String>,
        result_summary: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Result<(), ServerError> {
        self.audit
            .record_execution(&AgentExecution {
                id: Uuid::new_v4().to_string(),
                request_id: request_id.to_string(),
                agent_id: agent_id.to_string(),
                task: task.to_string(),
                status,
                retry_count,
                duration_ms,
                error,
                result_summary,
                started_at,
                completed_at: Utc::now(),
            })
            .await
    }

    /// Merge a result payload into the context and store its artefacts.
    async fn persist_result(&self, request: &ResearchRequest, agent_id: &str, data: &Value) -> Result<(), ServerError> {
        let Some(payload) = data.as_object() else {
            return Ok(());
        };

        if agent_id == REQUIREMENTS_AGENT {
            if let Some(Ok(requirements)) = payload
                .get("requirements")
                .map(|r| serde_json::from_value::<Requirements>(r.clone()))
            {
                self.artifacts.save_requirements(&request.id, &requirements).await?;
            }
        }
        if let Some(report) = payload.get("feasibility_report") {
            self.artifacts
                .save_feasibility(
                    &request.id,
                    payload.get("feasible").and_then(|v| v.as_bool()).unwrap_or(false),
                    payload.get("feasibility_score").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    payload.get("estimated_cohort_size").and_then(|v| v.as_u64()).unwrap_or(0),
                    report.clone(),
                )
                .await?;
        }
        if let Some(delivery) = payload.get("delivery") {
            let delivery: Delivery = serde_json::from_value(delivery.clone())?;
            self.artifacts.save_delivery(&delivery).await?;
        }

        let mut context = self.requests.require(&request.id).await?.context;
        for (key, value) in payload {
            context.insert(key.clone(), value.clone());
        }
        self.requests.update_context(&request.id, context).await?;
        if request.last_error.is_some() {
            self.requests.set_error(&request.id, None).await?;
        }
        Ok(())
    }

    /// Fold an approved (or modified) approval into the request context.
    async fn apply_approval(&self, request: &ResearchRequest, approval: &Approval) -> Result<(), ServerError> {
        let mut context = self.requests.require(&request.id).await?.context;

        if approval.approval_type == ApprovalType::ScopeChange {
            if let Some(changes) = approval.approval_data.get("changes") {
                let updated = patch_requirements(&context, changes)?;
                context.insert("requirements".into(), serde_json::to_value(&updated)?);
            }
            context.remove("scope_change");
        }

        if let Some(modifications) = approval.modifications.as_ref().and_then(|m| m.as_object()) {
            match approval.approval_type {
                ApprovalType::Requirements | ApprovalType::ScopeChange => {
                    let updated = patch_requirements(&context, &requirements_patch(modifications))?;
                    context.insert("requirements".into(), serde_json::to_value(&updated)?);
                }
                ApprovalType::PhenotypeSql => {
                    if let Some(sql) = modifications.get("sql").and_then(|s| s.as_str()) {
                        let sql = validate_select(sql)?;
                        context.insert("phenotype_sql".into(), Value::String(sql));
                    }
                }
                ApprovalType::Extraction | ApprovalType::Qa => {
                    for (key, value) in modifications {
                        context.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        if let Some(Ok(requirements)) = context
            .get("requirements")
            .map(|r| serde_json::from_value::<Requirements>(r.clone()))
        {
            if matches!(
                approval.approval_type,
                ApprovalType::Requirements | ApprovalType::ScopeChange
            ) {
                self.artifacts.save_requirements(&request.id, &requirements).await?;
            }
        }
        context.insert(
            format!("{}_approval", approval.approval_type.as_str()),
            json!({
                "approval_id": approval.id,
                "status": approval.status,
                "reviewer": approval.reviewer,
                "notes": approval.review_notes,
            }),
        );
        self.requests.update_context(&request.id, context).await
    }

    async fn apply_rejection(&self, request: &ResearchRequest, approval: &Approval) -> Result<ProcessOutcome, ServerError> {
        let mut context = self.requests.require(&request.id).await?.context;
        context.insert(
            "review_feedback".into(),
            json!({
                "approval_type": approval.approval_type,
                "reviewer": approval.reviewer,
                "notes": approval.review_notes,
                "at": approval.reviewed_at,
            }),
        );

        match backward_route(approval.approval_type) {
            Some((agent, task)) => {
                self.requests.update_context(&request.id, context).await?;
                self.route_task(&request.id, agent, task, None).await
            }
            None => {
                let previous = context
                    .get("scope_change")
                    .and_then(|s| s.get("previous_state"))
                    .and_then(|s| s.as_str())
                    .and_then(WorkflowState::from_str)
                    .unwrap_or(WorkflowState::HumanReview);
                context.remove("scope_change");
                self.requests.update_context(&request.id, context).await?;
                let state = self
                    .move_to(&request.id, previous, "scope change rejected")
                    .await?;
                Ok(ProcessOutcome::Paused {
                    request_id: request.id.clone(),
                    state,
                    reason: "Scope change rejected".to_string(),
                })
            }
        }
    }

    // ─── Notifications ───────────────────────────────────────────────────

    async fn notify(&self, task: &str, context: TaskContext) {
        let Some(coordinator) = self.agents.get(COORDINATOR_AGENT) else {
            tracing::debug!("[Orchestrator] No coordinator registered; skipping {}", task);
            return;
        };
        if let Err(failure) = coordinator.run(task, &context).await {
            tracing::warn!("[Orchestrator] Notification {} failed: {}", task, failure.error);
        }
    }

    async fn notify_approval(&self, approval: &Approval) {
        let mut context = TaskContext::new();
        context.insert("request_id".into(), Value::String(approval.request_id.clone()));
        match serde_json::to_value(approval) {
            Ok(value) => {
                context.insert("approval".into(), value);
                self.notify(SEND_NOTIFICATION, context).await;
            }
            Err(e) => tracing::warn!("[Orchestrator] Could not serialize approval: {}", e),
        }
    }

    async fn notify_escalation(&self, escalation: &Escalation) {
        let mut context = TaskContext::new();
        context.insert("request_id".into(), Value::String(escalation.request_id.clone()));
        match serde_json::to_value(escalation) {
            Ok(value) => {
                context.insert("escalation".into(), value);
                self.notify(NOTIFY_ESCALATION, context).await;
            }
            Err(e) => tracing::warn!("[Orchestrator] Could not serialize escalation: {}", e),
        }
    }
}

/// Requirements from the context with `patch` applied on top.
fn patch_requirements(context: &TaskContext, patch: &Value) -> Result<Requirements, ServerError> {
    if !patch.is_object() {
        return Err(ServerError::BadRequest("Requirements patch must be a JSON object".to_string()));
    }
    let current: Requirements = match context.get("requirements") {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|e| ServerError::BadRequest(format!("Stored requirements are invalid: {}", e)))?,
        _ => Requirements::default(),
    };
    current
        .patched(patch)
        .map_err(|e| ServerError::BadRequest(format!("Invalid requirements patch: {}", e)))
}

/// Reviewers may send `{"requirements": {...}}` or the patch itself.
fn requirements_patch(modifications: &serde_json::Map<String, Value>) -> Value {
    modifications
        .get("requirements")
        .filter(|r| r.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(modifications.clone()))
}

/// Reject modifications that could not be applied, before the approval is
/// resolved.
fn check_modifications(
    request: &ResearchRequest,
    approval_type: ApprovalType,
    modifications: &Value,
) -> Result<(), ServerError> {
    let Some(map) = modifications.as_object() else {
        return Err(ServerError::BadRequest("Modifications must be a JSON object".to_string()));
    };
    match approval_type {
        ApprovalType::Requirements | ApprovalType::ScopeChange => {
            patch_requirements(&request.context, &requirements_patch(map))?;
        }
        ApprovalType::PhenotypeSql => {
            if let Some(sql) = map.get("sql") {
                let sql = sql
                    .as_str()
                    .ok_or_else(|| ServerError::BadRequest("sql must be a string".to_string()))?;
                validate_select(sql)?;
            }
        }
        ApprovalType::Extraction | ApprovalType::Qa => {}
    }
    Ok(())
}

/// The `(agent, task)` a retry should re-run for an escalation.
fn retry_target(escalation: &Escalation) -> Option<(String, String)> {
    if escalation.reason == EscalationReason::ApprovalTimeout {
        let approval_type = escalation.details["approvalType"]
            .as_str()
            .and_then(ApprovalType::from_str)?;
        let (agent, task) = requesting_task(approval_type)?;
        return Some((agent.to_string(), task.to_string()));
    }
    let agent = escalation.agent_id.clone()?;
    let task = escalation.details["task"].as_str()?.to_string();
    Some((agent, task))
}

/// The working state that runs `task`.
fn working_state(task: &str) -> Option<WorkflowState> {
    match task {
        GATHER_REQUIREMENTS => Some(WorkflowState::RequirementsGathering),
        VALIDATE_FEASIBILITY => Some(WorkflowState::FeasibilityValidation),
        SCHEDULE_KICKOFF => Some(WorkflowState::ScheduleKickoff),
        EXTRACT_DATA => Some(WorkflowState::DataExtraction),
        VALIDATE_EXTRACTION => Some(WorkflowState::QaValidation),
        DELIVER_DATA => Some(WorkflowState::DataDelivery),
        _ => None,
    }
}

/// Where a request in `human_review` picks up when its escalation is closed.
///
/// Agent failures record the state they failed in. Approval timeouts go
/// back to the task that asked for the approval, and a timed-out scope
/// change goes back to wherever the request was before it. Anything else
/// falls back to the state the request left for `human_review`.
fn resume_state(request: &ResearchRequest, escalation: &Escalation) -> WorkflowState {
    let resumable = |state: &WorkflowState| !state.is_review() && !state.is_terminal();

    if let Some(state) = escalation.details["state"]
        .as_str()
        .and_then(WorkflowState::from_str)
        .filter(resumable)
    {
        return state;
    }
    if escalation.reason == EscalationReason::ApprovalTimeout {
        let approval_type = escalation.details["approvalType"]
            .as_str()
            .and_then(ApprovalType::from_str);
        if approval_type == Some(ApprovalType::ScopeChange) {
            if let Some(previous) = request
                .context
                .get("scope_change")
                .and_then(|s| s.get("previous_state"))
                .and_then(|s| s.as_str())
                .and_then(WorkflowState::from_str)
                .filter(resumable)
            {
                return previous;
            }
        }
        if let Some(state) = approval_type
            .and_then(requesting_task)
            .and_then(|(_, task)| working_state(task))
        {
            return state;
        }
    }
    request
        .state_history
        .iter()
        .rev()
        .find(|t| t.to == WorkflowState::HumanReview && resumable(&t.from))
        .map(|t| t.from)
        .unwrap_or(WorkflowState::RequirementsGathering)
}
