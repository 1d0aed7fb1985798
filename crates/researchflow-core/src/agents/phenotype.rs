//! phenotype_agent: cohort SQL generation and feasibility validation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::feasibility;
use super::{require_requirements, AgentError, AgentResult, ResearchAgent, TaskContext, PHENOTYPE_AGENT};
use crate::cohort::CohortCounter;
use crate::models::ApprovalType;
use crate::sql::PhenotypeQuery;

pub const VALIDATE_FEASIBILITY: &str = "validate_feasibility";
pub const GENERATE_SQL: &str = "generate_sql";

pub struct PhenotypeAgent {
    counter: Arc<dyn CohortCounter>,
}

impl PhenotypeAgent {
    pub fn new(counter: Arc<dyn CohortCounter>) -> Self {
        Self { counter }
    }

    fn generate_sql(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let requirements = require_requirements(context)?;
        let query = PhenotypeQuery::generate(&requirements);
        Ok(AgentResult::done(json!({
            "phenotype_sql": query.cohort_sql,
            "count_sql": query.count_sql,
            "phenotype": query,
        })))
    }

    async fn validate_feasibility(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let requirements = require_requirements(context)?;
        let query = PhenotypeQuery::generate(&requirements);
        let estimated = self.counter.count(&requirements, &query).await?;
        let report = feasibility::assess(estimated, &requirements);

        tracing::info!(
            "[PhenotypeAgent] Cohort estimate {} via {} backend, score {:.3} (feasible: {})",
            estimated,
            self.counter.backend(),
            report.score,
            report.feasible
        );

        let data = json!({
            "feasible": report.feasible,
            "feasibility_score": report.score,
            "estimated_cohort_size": estimated,
            "cohort_backend": self.counter.backend(),
            "feasibility_report": report,
            "phenotype_sql": query.cohort_sql,
            "count_sql": query.count_sql,
            "phenotype": query,
        });

        if !report.feasible {
            return Ok(AgentResult::done(data));
        }
        Ok(AgentResult::approval(
            data,
            ApprovalType::PhenotypeSql,
            json!({
                "sql": query.cohort_sql,
                "estimated_cohort_size": estimated,
                "feasibility_score": report.score,
                "warnings": report.warnings,
            }),
        ))
    }
}

#[async_trait]
impl ResearchAgent for PhenotypeAgent {
    fn id(&self) -> &str {
        PHENOTYPE_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[VALIDATE_FEASIBILITY, GENERATE_SQL]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            VALIDATE_FEASIBILITY => self.validate_feasibility(context).await,
            GENERATE_SQL => self.generate_sql(context),
            other => Err(AgentError::unknown_task(PHENOTYPE_AGENT, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::models::Requirements;

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

    fn context() -> TaskContext {
        let mut ctx = TaskContext::new();
        ctx.insert(
            "requirements".into(),
            json!({
                "inclusion_criteria": ["diabetes"],
                "data_elements": ["demographics"],
                "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
                "phi_level": "de_identified",
                "minimum_cohort_size": 50
            }),
        );
        ctx
    }

    #[tokio::test]
    async fn test_small_cohort_is_not_feasible() {
        let agent = PhenotypeAgent::new(Arc::new(FixedCount(40)));
        let result = agent.execute_task(VALIDATE_FEASIBILITY, &context()).await.unwrap();
        assert!(!result.requires_approval());
        assert_eq!(result.data["feasible"], false);
        let warnings = result.data["feasibility_report"]["warnings"].as_array().unwrap();
        let small = warnings.iter().find(|w| w["kind"] == "small_cohort").unwrap();
        assert!(small["suggestion"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_feasible_cohort_requests_sql_review() {
        let agent = PhenotypeAgent::new(Arc::new(FixedCount(500)));
        let result = agent.execute_task(VALIDATE_FEASIBILITY, &context()).await.unwrap();
        assert!(result.requires_approval());
        assert_eq!(result.data["estimated_cohort_size"], 500);
        assert!(result.data["phenotype_sql"].as_str().unwrap().starts_with("SELECT DISTINCT"));
    }

    #[tokio::test]
    async fn test_missing_requirements_is_validation_error() {
        let agent = PhenotypeAgent::new(Arc::new(FixedCount(1)));
        let err = agent
            .execute_task(GENERATE_SQL, &TaskContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, "ValidationError");
        assert!(!err.is_transient());
    }
}
