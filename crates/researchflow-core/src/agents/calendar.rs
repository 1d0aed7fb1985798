//! calendar_agent: proposes the kickoff meeting once the phenotype is
//! approved. No calendar system is wired in; invites are only logged.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde_json::json;

use super::{context_requirements, context_str, AgentError, AgentResult, ResearchAgent, TaskContext, CALENDAR_AGENT};
use crate::llm::{LlmRequest, LlmRouter, TaskCriticality};

pub const SCHEDULE_KICKOFF: &str = "schedule_kickoff";

const MEETING_MINUTES: i64 = 30;

pub struct CalendarAgent {
    llm: LlmRouter,
}

/// 10:00 UTC on the first weekday at least two days after `now`.
pub fn next_kickoff_slot(now: DateTime<Utc>) -> DateTime<Utc> {
    let mut day = (now + Duration::days(2)).date_naive();
    while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day += Duration::days(1);
    }
    let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&day.and_time(ten))
}

fn template_agenda(title: &str) -> String {
    format!(
        "Kickoff: {}\n\
         1. Confirm study scope and approved cohort definition\n\
         2. Review requested data elements and PHI level\n\
         3. Agree on delivery format and timeline\n\
         4. Questions",
        title
    )
}

impl CalendarAgent {
    pub fn new(llm: LlmRouter) -> Self {
        Self { llm }
    }

    async fn agenda(&self, title: &str, context: &TaskContext) -> (String, &'static str) {
        if !self.llm.is_configured() {
            return (template_agenda(title), "template");
        }
        let summary = context
            .get("requirements")
            .map(|r| r.to_string())
            .unwrap_or_default();
        let request = LlmRequest::new(format!(
            "Draft a short numbered agenda (max 6 items) for a 30 minute kickoff meeting \
             between a researcher and the data team for the study '{}'. Requirements: {}",
            title, summary
        ));
        match self.llm.complete(TaskCriticality::NonCritical, &request).await {
            Ok(response) if !response.content.trim().is_empty() => {
                (response.content.trim().to_string(), "llm")
            }
            Ok(_) => (template_agenda(title), "template"),
            Err(e) => {
                tracing::warn!("[CalendarAgent] Agenda drafting failed, using template: {}", e);
                (template_agenda(title), "template")
            }
        }
    }

    async fn schedule_kickoff(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let title = context_requirements(context)?
            .and_then(|r| r.study_title)
            .or_else(|| context_str(context, "initial_request").map(|s| s.chars().take(80).collect()))
            .unwrap_or_else(|| "Research data request".to_string());
        let start = next_kickoff_slot(Utc::now());
        let (agenda, agenda_source) = self.agenda(&title, context).await;

        let mut attendees = vec!["data-team@researchflow.local".to_string()];
        if let Some(email) = context_str(context, "researcher_email") {
            attendees.insert(0, email.to_string());
        }

        tracing::info!(
            "[CalendarAgent] Calendar integration not configured; kickoff for '{}' at {} logged only ({})",
            title,
            start,
            attendees.join(", ")
        );

        Ok(AgentResult::done(json!({
            "kickoff_meeting": {
                "title": format!("Kickoff: {}", title),
                "start": start,
                "end": start + Duration::minutes(MEETING_MINUTES),
                "attendees": attendees,
                "agenda": agenda,
                "agenda_source": agenda_source,
                "status": "proposed",
            }
        })))
    }
}

#[async_trait]
impl ResearchAgent for CalendarAgent {
    fn id(&self) -> &str {
        CALENDAR_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[SCHEDULE_KICKOFF]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            SCHEDULE_KICKOFF => self.schedule_kickoff(context).await,
            other => Err(AgentError::unknown_task(CALENDAR_AGENT, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, LlmError, ScriptedLlmClient};
    use std::sync::Arc;

    #[test]
    fn test_slot_skips_weekend() {
        // Thursday -> Saturday -> Monday.
        let thursday = Utc.with_ymd_and_hms(2024, 5, 2, 15, 0, 0).unwrap();
        let slot = next_kickoff_slot(thursday);
        assert_eq!(slot, Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_agenda_falls_back_to_template() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_error(LlmError::ServiceUnavailable("down".into()));
        let agent = CalendarAgent::new(LlmRouter::new(None, Some(llm as Arc<dyn LlmClient>)));

        let mut ctx = TaskContext::new();
        ctx.insert("researcher_email".into(), json!("lee@example.org"));
        ctx.insert("requirements".into(), json!({ "study_title": "Diabetes outcomes" }));
        let result = agent.execute_task(SCHEDULE_KICKOFF, &ctx).await.unwrap();

        let meeting = &result.data["kickoff_meeting"];
        assert_eq!(meeting["agenda_source"], "template");
        assert!(meeting["agenda"].as_str().unwrap().contains("Diabetes outcomes"));
        assert_eq!(meeting["attendees"][0], "lee@example.org");
    }
}
