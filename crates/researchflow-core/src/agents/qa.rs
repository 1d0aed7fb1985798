//! qa_agent: sanity checks over an extraction before it goes to review.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{require_requirements, AgentError, AgentResult, ResearchAgent, TaskContext, QA_AGENT};
use crate::models::ApprovalType;

pub const VALIDATE_EXTRACTION: &str = "validate_extraction";

/// Column null share above which a warning is raised.
const NULL_RATE_WARNING: f64 = 0.5;
/// Column null share above which the extraction fails.
const NULL_RATE_FAILURE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Passed,
    Warning,
    Failed,
}

impl QaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Warning => "warning",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaCheck {
    pub name: String,
    pub status: QaStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl QaCheck {
    fn new(name: &str, status: QaStatus, message: impl Into<String>, details: Value) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReport {
    pub overall_status: QaStatus,
    pub checks: Vec<QaCheck>,
}

impl QaReport {
    fn from_checks(checks: Vec<QaCheck>) -> Self {
        let overall_status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(QaStatus::Passed);
        Self {
            overall_status,
            checks,
        }
    }
}

fn element_rows<'a>(extraction: &'a Value, element: &str) -> Option<&'a Vec<Value>> {
    extraction
        .get("extracts")?
        .get(element)?
        .get("rows")?
        .as_array()
}

fn check_completeness(requested: &[String], extraction: &Value) -> QaCheck {
    let missing: Vec<&str> = requested
        .iter()
        .filter(|e| element_rows(extraction, e).is_none())
        .map(|e| e.as_str())
        .collect();
    let status = if requested.is_empty() || missing.len() == requested.len() {
        QaStatus::Failed
    } else if missing.is_empty() {
        QaStatus::Passed
    } else {
        QaStatus::Warning
    };
    let message = if missing.is_empty() {
        format!("All {} requested element(s) extracted", requested.len())
    } else {
        format!("Missing element(s): {}", missing.join(", "))
    };
    QaCheck::new("completeness", status, message, json!({ "missing": missing }))
}

fn check_cohort_size(cohort_size: u64, minimum: u64) -> QaCheck {
    let status = if cohort_size == 0 {
        QaStatus::Failed
    } else if cohort_size < minimum {
        QaStatus::Warning
    } else {
        QaStatus::Passed
    };
    QaCheck::new(
        "cohort_size",
        status,
        format!("Cohort of {} (minimum {})", cohort_size, minimum),
        json!({ "cohort_size": cohort_size, "minimum": minimum }),
    )
}

fn check_duplicates(elements: &[String], extraction: &Value) -> QaCheck {
    let mut duplicates = serde_json::Map::new();
    for element in elements {
        let Some(rows) = element_rows(extraction, element) else {
            continue;
        };
        let mut seen = HashSet::new();
        let count = rows.iter().filter(|row| !seen.insert(row.to_string())).count();
        if count > 0 {
            duplicates.insert(element.clone(), json!(count));
        }
    }
    // One row per patient is expected for demographics.
    if let Some(rows) = element_rows(extraction, "demographics") {
        let mut ids = HashSet::new();
        let repeated = rows
            .iter()
            .filter_map(|r| r.get("patient_id"))
            .filter(|id| !ids.insert(id.to_string()))
            .count();
        if repeated > 0 && !duplicates.contains_key("demographics") {
            duplicates.insert("demographics".to_string(), json!(repeated));
        }
    }
    let status = if duplicates.is_empty() {
        QaStatus::Passed
    } else {
        QaStatus::Warning
    };
    let message = if duplicates.is_empty() {
        "No duplicate rows".to_string()
    } else {
        format!("Duplicate rows in {} element(s)", duplicates.len())
    };
    QaCheck::new("duplicates", status, message, Value::Object(duplicates))
}

fn check_null_rate(elements: &[String], extraction: &Value) -> QaCheck {
    let mut worst = 0.0_f64;
    let mut flagged = serde_json::Map::new();
    for element in elements {
        let Some(rows) = element_rows(extraction, element) else {
            continue;
        };
        if rows.is_empty() {
            continue;
        }
        let columns: Vec<String> = extraction["extracts"][element.as_str()]["columns"]
            .as_array()
            .map(|c| c.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        for column in columns {
            let nulls = rows
                .iter()
                .filter(|r| r.get(&column).map_or(true, Value::is_null))
                .count();
            let rate = nulls as f64 / rows.len() as f64;
            worst = worst.max(rate);
            if rate > NULL_RATE_WARNING {
                flagged.insert(format!("{}.{}", element, column), json!((rate * 1000.0).round() / 1000.0));
            }
        }
    }
    let status = if worst > NULL_RATE_FAILURE {
        QaStatus::Failed
    } else if !flagged.is_empty() {
        QaStatus::Warning
    } else {
        QaStatus::Passed
    };
    QaCheck::new(
        "null_rate",
        status,
        format!("Highest column null rate {:.1}%", worst * 100.0),
        Value::Object(flagged),
    )
}

/// Run every check over an extraction payload.
pub fn validate(extraction: &Value, requested: &[String], minimum_cohort_size: u64) -> QaReport {
    let cohort_size = extraction["cohort_size"].as_u64().unwrap_or(0);
    QaReport::from_checks(vec![
        check_completeness(requested, extraction),
        check_cohort_size(cohort_size, minimum_cohort_size),
        check_duplicates(requested, extraction),
        check_null_rate(requested, extraction),
    ])
}

pub struct QaAgent;

impl QaAgent {
    pub fn new() -> Self {
        Self
    }

    fn validate_extraction(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let requirements = require_requirements(context)?;
        let extraction = context
            .get("extraction")
            .filter(|v| v.is_object())
            .ok_or_else(|| AgentError::validation("No extraction in context"))?;

        let report = validate(extraction, &requirements.data_elements, requirements.minimum_cohort_size());
        tracing::info!(
            "[QaAgent] Extraction QA {} ({} checks)",
            report.overall_status.as_str(),
            report.checks.len()
        );

        let data = json!({
            "overall_status": report.overall_status.as_str(),
            "qa_report": report,
        });
        if report.overall_status == QaStatus::Failed {
            return Ok(AgentResult::done(data));
        }

        let summary: Vec<Value> = report
            .checks
            .iter()
            .map(|c| json!({ "name": c.name, "status": c.status, "message": c.message }))
            .collect();
        Ok(AgentResult::approval(
            data,
            ApprovalType::Qa,
            json!({
                "overall_status": report.overall_status.as_str(),
                "checks": summary,
                "cohort_size": extraction["cohort_size"],
            }),
        ))
    }
}

impl Default for QaAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResearchAgent for QaAgent {
    fn id(&self) -> &str {
        QA_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[VALIDATE_EXTRACTION]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            VALIDATE_EXTRACTION => self.validate_extraction(context),
            other => Err(AgentError::unknown_task(QA_AGENT, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extraction(cohort_size: u64, rows: Value) -> Value {
        json!({
            "cohort_size": cohort_size,
            "extracts": {
                "demographics": {
                    "columns": ["patient_id", "gender"],
                    "rows": rows,
                }
            }
        })
    }

    fn context(extraction: Value) -> TaskContext {
        let mut ctx = TaskContext::new();
        ctx.insert(
            "requirements".into(),
            json!({ "data_elements": ["demographics"], "minimum_cohort_size": 2 }),
        );
        ctx.insert("extraction".into(), extraction);
        ctx
    }

    #[tokio::test]
    async fn test_clean_extraction_passes_and_requests_review() {
        let rows = json!([
            { "patient_id": "p1", "gender": "female" },
            { "patient_id": "p2", "gender": "male" }
        ]);
        let result = QaAgent::new()
            .execute_task(VALIDATE_EXTRACTION, &context(extraction(2, rows)))
            .await
            .unwrap();
        assert_eq!(result.data["overall_status"], "passed");
        assert!(result.requires_approval());
    }

    #[tokio::test]
    async fn test_duplicates_and_nulls_warn() {
        let rows = json!([
            { "patient_id": "p1", "gender": null },
            { "patient_id": "p1", "gender": null },
            { "patient_id": "p2", "gender": "male" }
        ]);
        let result = QaAgent::new()
            .execute_task(VALIDATE_EXTRACTION, &context(extraction(2, rows)))
            .await
            .unwrap();
        assert_eq!(result.data["overall_status"], "warning");
        let checks = result.data["qa_report"]["checks"].as_array().unwrap();
        let dup = checks.iter().find(|c| c["name"] == "duplicates").unwrap();
        assert_eq!(dup["status"], "warning");
        assert!(result.requires_approval());
    }

    #[tokio::test]
    async fn test_empty_cohort_fails_without_approval() {
        let result = QaAgent::new()
            .execute_task(VALIDATE_EXTRACTION, &context(extraction(0, json!([]))))
            .await
            .unwrap();
        assert_eq!(result.data["overall_status"], "failed");
        assert!(!result.requires_approval());
    }

    #[tokio::test]
    async fn test_missing_extraction_is_validation_error() {
        let mut ctx = TaskContext::new();
        ctx.insert("requirements".into(), json!({ "data_elements": ["demographics"] }));
        let err = QaAgent::new().execute_task(VALIDATE_EXTRACTION, &ctx).await.unwrap_err();
        assert_eq!(err.kind, "ValidationError");
    }
}
