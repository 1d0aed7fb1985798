//! Cohort size estimation behind a pluggable backend.
//!
//! `sql` runs the generated phenotype count query through the sandbox.
//! `viewdef` flattens conditions and demographics with the bundled
//! ViewDefinitions and applies the criteria in process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServerError;
use crate::models::Requirements;
use crate::sql::phenotype::{age_on, CriterionMatch};
use crate::sql::AgeRange;
use crate::sql::{PhenotypeQuery, SqlSandbox};
use crate::viewdef::{builtin, ViewResult, ViewRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortBackend {
    #[default]
    Sql,
    Viewdef,
}

impl CohortBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Viewdef => "viewdef",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Some(Self::Sql),
            "viewdef" | "view" | "viewdefinition" => Some(Self::Viewdef),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CohortCounter: Send + Sync {
    fn backend(&self) -> &str;

    async fn count(
        &self,
        requirements: &Requirements,
        query: &PhenotypeQuery,
    ) -> Result<u64, ServerError>;
}

pub struct SqlCohortCounter {
    sandbox: SqlSandbox,
}

impl SqlCohortCounter {
    pub fn new(sandbox: SqlSandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl CohortCounter for SqlCohortCounter {
    fn backend(&self) -> &str {
        CohortBackend::Sql.as_str()
    }

    async fn count(
        &self,
        _requirements: &Requirements,
        query: &PhenotypeQuery,
    ) -> Result<u64, ServerError> {
        Ok(self.sandbox.count(&query.count_sql).await?)
    }
}

pub struct ViewDefinitionCohortCounter {
    runner: Arc<ViewRunner>,
}

struct ConditionRow {
    patient_id: String,
    code: String,
    display: String,
    onset: Option<NaiveDate>,
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?;
    NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok()
}

fn column<'a>(result: &ViewResult, row: &'a [Value], name: &str) -> Option<&'a Value> {
    result.column_index(name).and_then(|i| row.get(i))
}

fn text(value: Option<&Value>) -> String {
    value.and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

impl ViewDefinitionCohortCounter {
    pub fn new(runner: Arc<ViewRunner>) -> Self {
        Self { runner }
    }

    /// Patients a criterion selects. `window` bounds condition onsets.
    fn matching_patients(
        criterion: &CriterionMatch,
        conditions: &[ConditionRow],
        birth_dates: &HashMap<String, Option<NaiveDate>>,
        reference: NaiveDate,
        window: Option<(Option<NaiveDate>, Option<NaiveDate>)>,
    ) -> HashSet<String> {
        let in_age = |id: &str, range: &AgeRange| {
            birth_dates
                .get(id)
                .copied()
                .flatten()
                .map_or(false, |b| range.contains(age_on(b, reference)))
        };
        let in_window = |c: &ConditionRow| match window {
            None => true,
            Some((start, end)) => match c.onset {
                Some(d) => start.map_or(true, |s| d >= s) && end.map_or(true, |e| d <= e),
                None => start.is_none() && end.is_none(),
            },
        };
        match criterion {
            CriterionMatch::Age { range, .. } => birth_dates
                .keys()
                .filter(|id| in_age(id, range))
                .cloned()
                .collect(),
            CriterionMatch::Concept { concept, age, .. } => conditions
                .iter()
                .filter(|c| in_window(c) && concept.matches_code(&c.code))
                .filter(|c| age.as_ref().map_or(true, |range| in_age(&c.patient_id, range)))
                .map(|c| c.patient_id.clone())
                .collect(),
            CriterionMatch::Description { text } => {
                let needle = text.to_lowercase();
                conditions
                    .iter()
                    .filter(|c| in_window(c) && c.display.to_lowercase().contains(&needle))
                    .map(|c| c.patient_id.clone())
                    .collect()
            }
        }
    }
}

#[async_trait]
impl CohortCounter for ViewDefinitionCohortCounter {
    fn backend(&self) -> &str {
        CohortBackend::Viewdef.as_str()
    }

    async fn count(
        &self,
        requirements: &Requirements,
        query: &PhenotypeQuery,
    ) -> Result<u64, ServerError> {
        let patients = self.runner.run(&builtin::patient_demographics(), &[]).await?;
        let conditions = self.runner.run(&builtin::condition_cohort(), &[]).await?;

        let birth_dates: HashMap<String, Option<NaiveDate>> = patients
            .rows
            .iter()
            .map(|row| {
                let id = text(column(&patients, row, "patient_id"));
                let birth = column(&patients, row, "birth_date").and_then(parse_date);
                (id, birth)
            })
            .collect();
        let condition_rows: Vec<ConditionRow> = conditions
            .rows
            .iter()
            .map(|row| ConditionRow {
                patient_id: text(column(&conditions, row, "patient_id")),
                code: text(column(&conditions, row, "code")),
                display: text(column(&conditions, row, "display")),
                onset: column(&conditions, row, "onset_date").and_then(parse_date),
            })
            .collect();

        let period = requirements.time_period.unwrap_or_default();
        let reference = query.reference_date.unwrap_or_else(|| Utc::now().date_naive());
        let window = Some((period.start, period.end));

        let mut cohort: HashSet<String> = birth_dates.keys().cloned().collect();
        for criterion in &query.inclusion {
            let matched =
                Self::matching_patients(criterion, &condition_rows, &birth_dates, reference, window);
            cohort.retain(|id| matched.contains(id));
        }
        for criterion in &query.exclusion {
            let matched =
                Self::matching_patients(criterion, &condition_rows, &birth_dates, reference, None);
            cohort.retain(|id| !matched.contains(id));
        }

        tracing::debug!(
            "[CohortCounter] viewdef backend: {} of {} patients match",
            cohort.len(),
            birth_dates.len()
        );
        Ok(cohort.len() as u64)
    }
}
