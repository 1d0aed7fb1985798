//! requirements_agent: turns the researcher's request into structured
//! [`Requirements`].
//!
//! Structured fields submitted with the request win. Gaps are filled from an
//! LLM extraction over the request text and conversation (when a primary
//! provider is configured) and then from keyword heuristics.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::{json, Value};

use super::{
    context_requirements, context_str, AgentError, AgentResult, ResearchAgent, TaskContext,
    REQUIREMENTS_AGENT,
};
use crate::llm::{extract_json, LlmRequest, LlmRouter, TaskCriticality};
use crate::models::{ApprovalType, PhiLevel, Requirements, TimePeriod};
use crate::sql::{parse_age_range, AgeRange, ConditionConcept};

pub const GATHER_REQUIREMENTS: &str = "gather_requirements";

const SYSTEM_PROMPT: &str = "You extract clinical research data requirements. Reply with a single JSON object \
with the keys study_title, inclusion_criteria (array of strings), exclusion_criteria (array of strings), \
data_elements (array from: demographics, diagnoses, medications, lab_results, vitals, procedures, notes, imaging), \
time_period ({\"start\": \"YYYY-MM-DD\", \"end\": \"YYYY-MM-DD\"}), phi_level (de_identified, limited_dataset \
or identified), minimum_cohort_size (integer), irb_number. Use null for anything not stated.";

const ELEMENT_KEYWORDS: &[(&str, &[&str])] = &[
    ("demographics", &["demographic", "age", "gender", "sex", "race", "ethnicity"]),
    ("diagnoses", &["diagnos", "condition", "comorbid", "icd"]),
    ("medications", &["medication", "drug", "prescription", "metformin", "insulin"]),
    ("lab_results", &["lab", "a1c", "hba1c", "glucose", "cholesterol"]),
    ("vitals", &["vital", "blood pressure reading", "bmi", "weight", "heart rate"]),
    ("procedures", &["procedure", "surgery", "surgical"]),
    ("notes", &["clinical note", "notes", "narrative"]),
    ("imaging", &["imaging", "x-ray", "mri", "ct scan", "radiology"]),
];

pub struct RequirementsAgent {
    llm: LlmRouter,
}

impl RequirementsAgent {
    pub fn new(llm: LlmRouter) -> Self {
        Self { llm }
    }

    async fn gather(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let mut requirements = context_requirements(context)?.unwrap_or_default();
        let text = conversation_text(context);
        let mut sources = vec!["submitted"];

        if !requirements.is_complete() && self.llm.has_primary() && !text.is_empty() {
            let request = LlmRequest::new(format!(
                "Research request and follow-up messages:\n\n{}\n\nAlready known (keep these): {}",
                text,
                serde_json::to_string(&requirements).unwrap_or_default()
            ))
            .with_system(SYSTEM_PROMPT);
            let response = self.llm.complete(TaskCriticality::Critical, &request).await?;
            match extract_json(&response.content).map(|v| serde_json::from_value::<Requirements>(without_nulls(v))) {
                Some(Ok(extracted)) => {
                    requirements.fill_from(extracted);
                    sources.push("llm");
                }
                Some(Err(e)) => tracing::warn!(
                    "[RequirementsAgent] LLM requirements did not match the schema: {}",
                    e
                ),
                None => tracing::warn!("[RequirementsAgent] No JSON object in LLM reply"),
            }
        }

        if !requirements.is_complete() {
            requirements.fill_from(heuristic_requirements(&text));
            sources.push("heuristics");
        }

        let missing = requirements.missing_fields();
        if missing.is_empty() {
            tracing::info!(
                "[RequirementsAgent] Requirements complete for request {}",
                context_str(context, "request_id").unwrap_or("?")
            );
            return Ok(AgentResult::approval(
                json!({
                    "requirements": requirements,
                    "requirements_complete": true,
                    "requirements_sources": sources,
                }),
                ApprovalType::Requirements,
                json!({ "requirements": requirements }),
            ));
        }

        let questions: Vec<&str> = missing.iter().map(|f| question_for(f)).collect();
        tracing::info!(
            "[RequirementsAgent] Requirements incomplete, missing: {}",
            missing.join(", ")
        );
        Ok(AgentResult::done(json!({
            "requirements": requirements,
            "requirements_complete": false,
            "missing_fields": missing,
            "questions": questions,
            "requirements_sources": sources,
        })))
    }
}

#[async_trait]
impl ResearchAgent for RequirementsAgent {
    fn id(&self) -> &str {
        REQUIREMENTS_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[GATHER_REQUIREMENTS]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            GATHER_REQUIREMENTS => self.gather(context).await,
            other => Err(AgentError::unknown_task(REQUIREMENTS_AGENT, other)),
        }
    }
}

fn question_for(field: &str) -> &'static str {
    match field {
        "inclusion_criteria" => "Which patients should be included (diagnoses, age range, other criteria)?",
        "data_elements" => "Which data elements do you need (demographics, diagnoses, medications, lab results, ...)?",
        "time_period" => "What time period should the data cover (start and end dates)?",
        "phi_level" => "Do you need de-identified data, a limited dataset, or identified data (IRB approval required)?",
        _ => "Please provide any further detail about the request.",
    }
}

fn without_nulls(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.retain(|_, v| !v.is_null());
    }
    value
}

/// The initial request followed by every researcher message.
fn conversation_text(context: &TaskContext) -> String {
    let mut parts: Vec<String> = context_str(context, "initial_request")
        .map(|s| vec![s.to_string()])
        .unwrap_or_default();
    if let Some(Value::Array(messages)) = context.get("conversation") {
        parts.extend(
            messages
                .iter()
                .filter(|m| m.get("role").and_then(|r| r.as_str()) != Some("agent"))
                .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                .map(|s| s.to_string()),
        );
    }
    parts.join("\n")
}

fn age_label(range: AgeRange) -> Option<String> {
    match (range.min, range.max) {
        (Some(a), Some(b)) => Some(format!("age {}-{}", a, b)),
        (Some(a), None) => Some(format!("age >= {}", a)),
        (None, Some(b)) => Some(format!("age <= {}", b)),
        (None, None) => None,
    }
}

fn concept_label(concept: ConditionConcept) -> &'static str {
    match concept {
        ConditionConcept::Diabetes => "diabetes",
        ConditionConcept::Hypertension => "hypertension",
    }
}

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19[5-9]\d|20\d{2})\b").expect("Invalid regex pattern for years"));
static MINIMUM_COHORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:at least|minimum of|min(?:imum)?)\s+(\d+)\s+(?:patients|subjects|participants)")
        .expect("Invalid regex pattern for cohort minimums")
});

fn year_bounds(text: &str) -> Option<TimePeriod> {
    let years: Vec<i32> = YEAR
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    let first = *years.iter().min()?;
    let last = *years.iter().max()?;
    Some(TimePeriod {
        start: NaiveDate::from_ymd_opt(first, 1, 1),
        end: NaiveDate::from_ymd_opt(last, 12, 31),
    })
}

fn phi_level(text: &str) -> Option<PhiLevel> {
    let t = text.to_lowercase();
    if ["de-identified", "deidentified", "de identified", "anonymized", "anonymised"]
        .iter()
        .any(|k| t.contains(k))
    {
        Some(PhiLevel::DeIdentified)
    } else if t.contains("limited data") {
        Some(PhiLevel::LimitedDataset)
    } else if ["identified", "identifiable", "patient names", "mrn"]
        .iter()
        .any(|k| t.contains(k))
    {
        Some(PhiLevel::Identified)
    } else {
        None
    }
}

/// Best-effort requirements from keywords in free text.
pub fn heuristic_requirements(text: &str) -> Requirements {
    let lower = text.to_lowercase();
    let mut inclusion = Vec::new();
    if let Some(concept) = ConditionConcept::detect(text) {
        inclusion.push(concept_label(concept).to_string());
    }
    if let Some(label) = parse_age_range(text).and_then(age_label) {
        inclusion.push(label);
    }

    let data_elements = ELEMENT_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(element, _)| element.to_string())
        .collect();

    let minimum_cohort_size = MINIMUM_COHORT
        .captures(&lower)
        .and_then(|c| c[1].parse().ok());

    Requirements {
        inclusion_criteria: inclusion,
        data_elements,
        time_period: year_bounds(text),
        phi_level: phi_level(text),
        minimum_cohort_size,
        ..Requirements::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, ScriptedLlmClient};
    use std::sync::Arc;

    fn context(initial: &str, requirements: Option<Value>) -> TaskContext {
        let mut ctx = TaskContext::new();
        ctx.insert("request_id".into(), json!("req-1"));
        ctx.insert("initial_request".into(), json!(initial));
        if let Some(r) = requirements {
            ctx.insert("requirements".into(), r);
        }
        ctx
    }

    #[test]
    fn test_heuristics() {
        let req = heuristic_requirements(
            "De-identified demographics and HbA1c labs for adults aged 40-65 with type 2 diabetes, 2020 to 2023, at least 200 patients",
        );
        assert_eq!(req.inclusion_criteria, vec!["diabetes", "age 40-65"]);
        assert!(req.data_elements.contains(&"demographics".to_string()));
        assert!(req.data_elements.contains(&"lab_results".to_string()));
        assert_eq!(req.phi_level, Some(PhiLevel::DeIdentified));
        assert_eq!(req.time_period.unwrap().start, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(req.time_period.unwrap().end, NaiveDate::from_ymd_opt(2023, 12, 31));
        assert_eq!(req.minimum_cohort_size, Some(200));
    }

    #[test]
    fn test_heuristic_patterns() {
        assert!(YEAR.captures_len() > 1 && MINIMUM_COHORT.captures_len() > 1);
        let req = heuristic_requirements("minimum of 75 subjects seen between 1999 and 2004");
        assert_eq!(req.minimum_cohort_size, Some(75));
        assert_eq!(req.time_period.unwrap().start, NaiveDate::from_ymd_opt(1999, 1, 1));
        assert_eq!(req.time_period.unwrap().end, NaiveDate::from_ymd_opt(2004, 12, 31));
    }

    #[tokio::test]
    async fn test_incomplete_request_asks_questions() {
        let agent = RequirementsAgent::new(LlmRouter::disabled());
        let result = agent
            .execute_task(GATHER_REQUIREMENTS, &context("Patients with hypertension", None))
            .await
            .unwrap();
        assert!(!result.requires_approval());
        assert_eq!(result.data["requirements_complete"], false);
        let missing = result.data["missing_fields"].as_array().unwrap();
        assert!(missing.contains(&json!("time_period")));
        assert_eq!(result.data["questions"].as_array().unwrap().len(), missing.len());
    }

    #[tokio::test]
    async fn test_submitted_fields_win_over_llm() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_response(
            r#"Here you go: {"inclusion_criteria": ["asthma"], "data_elements": ["medications"],
               "time_period": {"start": "2019-01-01", "end": "2019-12-31"}, "phi_level": "limited_dataset",
               "exclusion_criteria": null, "irb_number": null}"#,
        );
        let agent = RequirementsAgent::new(LlmRouter::new(Some(llm.clone() as Arc<dyn LlmClient>), None));
        let result = agent
            .execute_task(
                GATHER_REQUIREMENTS,
                &context("asthma study", Some(json!({ "inclusion_criteria": ["diabetes"] }))),
            )
            .await
            .unwrap();

        assert!(result.requires_approval());
        let req: Requirements = serde_json::from_value(result.data["requirements"].clone()).unwrap();
        assert_eq!(req.inclusion_criteria, vec!["diabetes"]);
        assert_eq!(req.data_elements, vec!["medications"]);
        assert_eq!(req.phi_level, Some(PhiLevel::LimitedDataset));
        assert_eq!(llm.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let agent = RequirementsAgent::new(LlmRouter::disabled());
        let err = agent.execute_task("dance", &TaskContext::new()).await.unwrap_err();
        assert_eq!(err.kind, "UnknownTaskError");
    }
}
