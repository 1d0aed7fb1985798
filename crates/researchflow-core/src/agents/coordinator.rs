//! coordinator_agent: reviewer and researcher notifications.
//!
//! There is no mail transport; messages are drafted (LLM when available,
//! otherwise a template) and logged.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{context_str, AgentError, AgentResult, ResearchAgent, TaskContext, COORDINATOR_AGENT};
use crate::llm::{LlmRequest, LlmRouter, TaskCriticality};

pub const SEND_NOTIFICATION: &str = "send_notification";
pub const NOTIFY_ESCALATION: &str = "notify_escalation";

const DEFAULT_REVIEWERS: &str = "data-governance@researchflow.local";

pub struct CoordinatorAgent {
    llm: LlmRouter,
}

struct Draft {
    to: String,
    subject: String,
    body: String,
}

impl CoordinatorAgent {
    pub fn new(llm: LlmRouter) -> Self {
        Self { llm }
    }

    async fn polish(&self, draft: &Draft) -> (String, &'static str) {
        if !self.llm.is_configured() {
            return (draft.body.clone(), "template");
        }
        let request = LlmRequest::new(format!(
            "Rewrite this notification email body so it is clear and brief. \
             Keep every fact, add nothing. Subject: {}\n\n{}",
            draft.subject, draft.body
        ))
        .with_system("You write short operational emails for a clinical research data team.");
        match self.llm.complete(TaskCriticality::NonCritical, &request).await {
            Ok(response) if !response.content.trim().is_empty() => (response.content.trim().to_string(), "llm"),
            Ok(_) => (draft.body.clone(), "template"),
            Err(e) => {
                tracing::warn!("[CoordinatorAgent] Drafting failed, using template: {}", e);
                (draft.body.clone(), "template")
            }
        }
    }

    async fn send(&self, draft: Draft, kind: &str) -> Result<AgentResult, AgentError> {
        let (body, body_source) = self.polish(&draft).await;
        tracing::info!(
            "[CoordinatorAgent] Email transport not configured; {} to {} logged: {}",
            kind,
            draft.to,
            draft.subject
        );
        Ok(AgentResult::done(json!({
            "notification": {
                "kind": kind,
                "channel": "email",
                "to": draft.to,
                "subject": draft.subject,
                "body": body,
                "body_source": body_source,
                "status": "logged",
            }
        })))
    }

    fn approval_draft(context: &TaskContext) -> Result<Draft, AgentError> {
        let approval = context
            .get("approval")
            .filter(|a| a.is_object())
            .ok_or_else(|| AgentError::validation("No approval in notification context"))?;
        let approval_type = approval["approvalType"]
            .as_str()
            .or_else(|| approval["approval_type"].as_str())
            .unwrap_or("unknown");
        let approval_id = approval["id"].as_str().unwrap_or_default();
        let request_id = context_str(context, "request_id").unwrap_or_default();
        let timeout = approval["timeoutAt"].as_str().unwrap_or("unspecified");
        let to = context_str(context, "reviewer_email").unwrap_or(DEFAULT_REVIEWERS);

        Ok(Draft {
            to: to.to_string(),
            subject: format!("[ResearchFlow] {} approval needed for request {}", approval_type, request_id),
            body: format!(
                "A {} approval ({}) is waiting for review on request {}.\n\
                 Please respond before {}.\n\nDetails:\n{}",
                approval_type,
                approval_id,
                request_id,
                timeout,
                pretty(&approval["approvalData"])
            ),
        })
    }

    fn escalation_draft(context: &TaskContext) -> Result<Draft, AgentError> {
        let escalation = context
            .get("escalation")
            .filter(|e| e.is_object())
            .ok_or_else(|| AgentError::validation("No escalation in notification context"))?;
        let reason = escalation["reason"].as_str().unwrap_or("unknown");
        let severity = escalation["severity"].as_str().unwrap_or("medium");
        let request_id = escalation["requestId"]
            .as_str()
            .or_else(|| context_str(context, "request_id"))
            .unwrap_or_default();
        let to = context_str(context, "reviewer_email").unwrap_or(DEFAULT_REVIEWERS);

        Ok(Draft {
            to: to.to_string(),
            subject: format!("[ResearchFlow] {} escalation on request {}", severity, request_id),
            body: format!(
                "Request {} needs human attention ({}).\n\nDetails:\n{}",
                request_id,
                reason,
                pretty(&escalation["details"])
            ),
        })
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[async_trait]
impl ResearchAgent for CoordinatorAgent {
    fn id(&self) -> &str {
        COORDINATOR_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[SEND_NOTIFICATION, NOTIFY_ESCALATION]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            SEND_NOTIFICATION => self.send(Self::approval_draft(context)?, "approval_request").await,
            NOTIFY_ESCALATION => self.send(Self::escalation_draft(context)?, "escalation").await,
            other => Err(AgentError::unknown_task(COORDINATOR_AGENT, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, ScriptedLlmClient};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_approval_notification_uses_template_without_llm() {
        let agent = CoordinatorAgent::new(LlmRouter::disabled());
        let mut ctx = TaskContext::new();
        ctx.insert("request_id".into(), json!("req-9"));
        ctx.insert(
            "approval".into(),
            json!({ "id": "a1", "approvalType": "phenotype_sql", "approvalData": { "sql": "SELECT 1" } }),
        );

        let result = agent.execute_task(SEND_NOTIFICATION, &ctx).await.unwrap();
        let note = &result.data["notification"];
        assert_eq!(note["body_source"], "template");
        assert_eq!(note["to"], DEFAULT_REVIEWERS);
        assert!(note["subject"].as_str().unwrap().contains("req-9"));
    }

    #[tokio::test]
    async fn test_escalation_notification_uses_llm_draft() {
        let llm = Arc::new(ScriptedLlmClient::new().with_default("Please look at request req-3."));
        let agent = CoordinatorAgent::new(LlmRouter::new(None, Some(llm as Arc<dyn LlmClient>)));
        let mut ctx = TaskContext::new();
        ctx.insert(
            "escalation".into(),
            json!({ "requestId": "req-3", "reason": "retries_exhausted", "severity": "high", "details": {} }),
        );

        let result = agent.execute_task(NOTIFY_ESCALATION, &ctx).await.unwrap();
        assert_eq!(result.data["notification"]["body_source"], "llm");
    }

    #[tokio::test]
    async fn test_missing_payload_is_validation_error() {
        let agent = CoordinatorAgent::new(LlmRouter::disabled());
        let err = agent.execute_task(NOTIFY_ESCALATION, &TaskContext::new()).await.unwrap_err();
        assert_eq!(err.kind, "ValidationError");
    }
}
