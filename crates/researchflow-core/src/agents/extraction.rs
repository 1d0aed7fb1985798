//! extraction_agent: pulls the approved cohort and the requested data
//! elements from the warehouse through the read-only sandbox.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_requirements, AgentError, AgentResult, ResearchAgent, TaskContext, EXTRACTION_AGENT};
use crate::models::{ApprovalType, PhiLevel, TimePeriod};
use crate::sql::{quote_literal, PhenotypeQuery, SqlSandbox};

pub const EXTRACT_DATA: &str = "extract_data";

/// Table, selected columns and date column for one data element.
struct ElementSource {
    table: &'static str,
    columns: &'static str,
    date_column: Option<&'static str>,
    filter: Option<&'static str>,
}

fn element_source(element: &str) -> Option<ElementSource> {
    let source = match element {
        "demographics" => ElementSource {
            table: "patients",
            columns: "patient_id, mrn, name, birth_date, gender, address, phone, email",
            date_column: None,
            filter: None,
        },
        "diagnoses" | "conditions" => ElementSource {
            table: "conditions",
            columns: "patient_id, code, system, description, onset_date",
            date_column: Some("onset_date"),
            filter: None,
        },
        "lab_results" | "labs" => ElementSource {
            table: "observations",
            columns: "patient_id, code, description, value, unit, observed_at",
            date_column: Some("observed_at"),
            filter: None,
        },
        "vitals" => ElementSource {
            table: "observations",
            columns: "patient_id, code, description, value, unit, observed_at",
            date_column: Some("observed_at"),
            // LOINC vital-sign panel members.
            filter: Some("code IN ('8480-6', '8462-4', '8867-4', '39156-5', '29463-7', '8302-2', '8310-5')"),
        },
        "medications" => ElementSource {
            table: "medications",
            columns: "patient_id, code, name, start_date, end_date",
            date_column: Some("start_date"),
            filter: None,
        },
        "procedures" => ElementSource {
            table: "procedures",
            columns: "patient_id, code, description, performed_at",
            date_column: Some("performed_at"),
            filter: None,
        },
        _ => return None,
    };
    Some(source)
}

/// SELECT for one element restricted to the cohort and study period.
fn element_sql(element: &str, cohort_sql: &str, period: &TimePeriod) -> Option<String> {
    let source = element_source(element)?;
    let mut clauses = vec![format!("patient_id IN ({})", cohort_sql)];
    if let Some(column) = source.date_column {
        if let Some(start) = period.start {
            clauses.push(format!("{} >= {}", column, quote_literal(&start.to_string())));
        }
        if let Some(end) = period.end {
            clauses.push(format!("{} <= {}", column, quote_literal(&end.to_string())));
        }
    }
    if let Some(filter) = source.filter {
        clauses.push(filter.to_string());
    }
    Some(format!(
        "SELECT {} FROM {} WHERE {} ORDER BY patient_id",
        source.columns,
        source.table,
        clauses.join(" AND ")
    ))
}

pub struct ExtractionAgent {
    sandbox: SqlSandbox,
}

impl ExtractionAgent {
    pub fn new(sandbox: SqlSandbox) -> Self {
        Self { sandbox }
    }

    async fn extract(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let requirements = require_requirements(context)?;
        let cohort_sql = match context.get("phenotype_sql").and_then(|v| v.as_str()) {
            Some(sql) if !sql.trim().is_empty() => sql.trim().trim_end_matches(';').to_string(),
            _ => PhenotypeQuery::generate(&requirements).cohort_sql,
        };
        let period = requirements.time_period.unwrap_or_default();

        let cohort = self.sandbox.execute(&cohort_sql).await?;
        let cohort_size = cohort.row_count as u64;

        let mut extracts = BTreeMap::new();
        let mut row_counts = BTreeMap::new();
        let mut skipped = Vec::new();
        for element in &requirements.data_elements {
            let Some(sql) = element_sql(element, &cohort_sql, &period) else {
                tracing::warn!("[ExtractionAgent] No warehouse source for data element '{}'", element);
                skipped.push(element.clone());
                continue;
            };
            let result = self.sandbox.execute(&sql).await?;
            row_counts.insert(element.clone(), result.row_count);
            extracts.insert(
                element.clone(),
                json!({
                    "columns": result.columns,
                    "rows": result.rows,
                    "row_count": result.row_count,
                    "truncated": result.truncated,
                }),
            );
        }

        let phi_level = requirements.phi_level.unwrap_or(PhiLevel::DeIdentified);
        tracing::info!(
            "[ExtractionAgent] Extracted {} element(s) for a cohort of {} ({} skipped)",
            extracts.len(),
            cohort_size,
            skipped.len()
        );

        let data = json!({
            "extraction": {
                "cohort_size": cohort_size,
                "cohort_sql": cohort_sql,
                "extracts": extracts,
                "row_counts": row_counts,
                "skipped_elements": skipped,
                "phi_level": phi_level.as_str(),
            }
        });

        if phi_level == PhiLevel::Identified {
            return Ok(AgentResult::approval(
                data,
                ApprovalType::Extraction,
                json!({
                    "cohort_size": cohort_size,
                    "row_counts": row_counts,
                    "phi_level": phi_level.as_str(),
                    "irb_number": requirements.irb_number,
                }),
            ));
        }
        Ok(AgentResult::done(data))
    }
}

#[async_trait]
impl ResearchAgent for ExtractionAgent {
    fn id(&self) -> &str {
        EXTRACTION_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[EXTRACT_DATA]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            EXTRACT_DATA => self.extract(context).await,
            other => Err(AgentError::unknown_task(EXTRACTION_AGENT, other)),
        }
    }
}

/// Rows of one element from an extraction payload.
pub fn extract_rows<'a>(extraction: &'a Value, element: &str) -> &'a [Value] {
    extraction
        .get("extracts")
        .and_then(|e| e.get(element))
        .and_then(|e| e.get("rows"))
        .and_then(|r| r.as_array())
        .map(|r| r.as_slice())
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sandbox() -> SqlSandbox {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO patients (patient_id, name, birth_date, gender) VALUES
                    ('p1', 'Ann Smith', '1970-01-01', 'female'), ('p2', 'Bo Chen', '1980-01-01', 'male');
                 INSERT INTO conditions (id, patient_id, code, onset_date) VALUES
                    ('c1', 'p1', 'E11.9', '2024-03-01'), ('c2', 'p2', 'I10', '2024-03-01');
                 INSERT INTO observations (id, patient_id, code, value, unit, observed_at) VALUES
                    ('o1', 'p1', '4548-4', 7.2, '%', '2024-04-01'),
                    ('o2', 'p1', '4548-4', 6.9, '%', '2023-04-01');",
            )
        })
        .unwrap();
        SqlSandbox::new(db)
    }

    fn context(phi: &str) -> TaskContext {
        let mut ctx = TaskContext::new();
        ctx.insert(
            "requirements".into(),
            json!({
                "inclusion_criteria": ["diabetes"],
                "data_elements": ["demographics", "lab_results", "genomics"],
                "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
                "phi_level": phi
            }),
        );
        ctx
    }

    #[tokio::test]
    async fn test_extracts_cohort_elements_in_period() {
        let agent = ExtractionAgent::new(sandbox());
        let result = agent.execute_task(EXTRACT_DATA, &context("de_identified")).await.unwrap();
        assert!(!result.requires_approval());

        let extraction = &result.data["extraction"];
        assert_eq!(extraction["cohort_size"], 1);
        assert_eq!(extract_rows(extraction, "demographics").len(), 1);
        assert_eq!(extract_rows(extraction, "lab_results").len(), 1);
        assert_eq!(extraction["skipped_elements"], json!(["genomics"]));
    }

    #[tokio::test]
    async fn test_identified_phi_requires_approval() {
        let agent = ExtractionAgent::new(sandbox());
        let result = agent.execute_task(EXTRACT_DATA, &context("identified")).await.unwrap();
        assert!(result.requires_approval());
    }
}
