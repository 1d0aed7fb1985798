//! delivery_agent: scrubs the extraction to the approved PHI level and
//! writes one file per data element under the delivery directory.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{context_str, require_requirements, AgentError, AgentResult, ResearchAgent, TaskContext, DELIVERY_AGENT};
use crate::models::{DeliveredFile, Delivery, DeliveryFormat, PhiLevel};

pub const DELIVER_DATA: &str = "deliver_data";

/// Direct identifiers removed from anything below `identified`.
const DIRECT_IDENTIFIERS: &[&str] = &["name", "mrn", "address", "phone", "email"];

/// Columns holding dates that de-identified output keeps only the year of.
const DATE_COLUMNS: &[&str] = &[
    "birth_date",
    "onset_date",
    "observed_at",
    "start_date",
    "end_date",
    "performed_at",
];

/// Stable pseudonym for a patient id within one request.
fn pseudonym(request_id: &str, patient_id: &str) -> String {
    let name = format!("{}:{}", request_id, patient_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Strip a row down to what the PHI level allows.
pub fn scrub_row(row: &Map<String, Value>, level: PhiLevel, request_id: &str) -> Map<String, Value> {
    if level == PhiLevel::Identified {
        return row.clone();
    }
    let mut out = Map::with_capacity(row.len());
    for (key, value) in row {
        if DIRECT_IDENTIFIERS.contains(&key.as_str()) {
            continue;
        }
        let value = match level {
            PhiLevel::DeIdentified if key == "patient_id" => match value.as_str() {
                Some(id) => Value::String(pseudonym(request_id, id)),
                None => value.clone(),
            },
            PhiLevel::DeIdentified if DATE_COLUMNS.contains(&key.as_str()) => match value.as_str() {
                Some(date) if date.len() >= 4 => Value::String(date.chars().take(4).collect()),
                _ => value.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), value);
    }
    out
}

fn render(rows: &[Value], format: DeliveryFormat) -> Result<String, AgentError> {
    let rendered = match format {
        DeliveryFormat::Json => serde_json::to_string_pretty(rows),
        DeliveryFormat::Ndjson => rows
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map(|lines| lines.join("\n")),
    };
    rendered.map_err(|e| AgentError::new("SerializationError", e.to_string()))
}

pub struct DeliveryAgent {
    dir: PathBuf,
}

impl DeliveryAgent {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    async fn deliver(&self, context: &TaskContext) -> Result<AgentResult, AgentError> {
        let requirements = require_requirements(context)?;
        let request_id = context_str(context, "request_id")
            .ok_or_else(|| AgentError::validation("No request_id in context"))?;
        let extraction = context
            .get("extraction")
            .and_then(|e| e.get("extracts"))
            .and_then(|e| e.as_object())
            .ok_or_else(|| AgentError::validation("No extraction in context"))?;

        let level = requirements.phi_level.unwrap_or(PhiLevel::DeIdentified);
        let format = requirements.delivery_format;
        let target = self.dir.join(request_id);
        tokio::fs::create_dir_all(&target).await?;

        let mut files = Vec::new();
        let mut record_count = 0u64;
        for (element, extract) in extraction {
            let rows: Vec<Value> = extract
                .get("rows")
                .and_then(|r| r.as_array())
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| r.as_object())
                        .map(|r| Value::Object(scrub_row(r, level, request_id)))
                        .collect()
                })
                .unwrap_or_default();

            let name = format!("{}.{}", element, format.extension());
            let path = target.join(&name);
            tokio::fs::write(&path, render(&rows, format)?).await?;
            record_count += rows.len() as u64;
            files.push(DeliveredFile {
                name,
                path: path.to_string_lossy().into_owned(),
                records: rows.len() as u64,
            });
        }

        let delivery = Delivery {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            location: target.to_string_lossy().into_owned(),
            format: format.as_str().to_string(),
            phi_level: level.as_str().to_string(),
            files,
            record_count,
            delivered_at: Utc::now(),
        };
        tracing::info!(
            "[DeliveryAgent] Delivered {} record(s) in {} file(s) to {}",
            record_count,
            delivery.files.len(),
            delivery.location
        );
        Ok(AgentResult::done(json!({
            "delivered": true,
            "delivery": delivery,
        })))
    }
}

#[async_trait]
impl ResearchAgent for DeliveryAgent {
    fn id(&self) -> &str {
        DELIVERY_AGENT
    }

    fn tasks(&self) -> &'static [&'static str] {
        &[DELIVER_DATA]
    }

    async fn execute_task(&self, task: &str, context: &TaskContext) -> Result<AgentResult, AgentError> {
        match task {
            DELIVER_DATA => self.deliver(context).await,
            other => Err(AgentError::unknown_task(DELIVERY_AGENT, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Map<String, Value> {
        json!({
            "patient_id": "p1",
            "name": "Ann Smith",
            "mrn": "MRN-1",
            "birth_date": "1970-06-15",
            "gender": "female"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_scrub_levels() {
        let identified = scrub_row(&row(), PhiLevel::Identified, "r1");
        assert_eq!(identified, row());

        let limited = scrub_row(&row(), PhiLevel::LimitedDataset, "r1");
        assert!(!limited.contains_key("name"));
        assert!(!limited.contains_key("mrn"));
        assert_eq!(limited["patient_id"], "p1");
        assert_eq!(limited["birth_date"], "1970-06-15");

        let deid = scrub_row(&row(), PhiLevel::DeIdentified, "r1");
        assert_ne!(deid["patient_id"], "p1");
        assert_eq!(deid["patient_id"], scrub_row(&row(), PhiLevel::DeIdentified, "r1")["patient_id"]);
        assert_eq!(deid["birth_date"], "1970");
        assert_eq!(deid["gender"], "female");
    }

    #[tokio::test]
    async fn test_writes_one_file_per_element() {
        let dir = tempfile::tempdir().unwrap();
        let agent = DeliveryAgent::new(dir.path());

        let mut ctx = TaskContext::new();
        ctx.insert("request_id".into(), json!("req-1"));
        ctx.insert(
            "requirements".into(),
            json!({ "phi_level": "limited_dataset", "delivery_format": "ndjson" }),
        );
        ctx.insert(
            "extraction".into(),
            json!({ "extracts": { "demographics": { "rows": [row(), row()] } } }),
        );

        let result = agent.execute_task(DELIVER_DATA, &ctx).await.unwrap();
        assert_eq!(result.data["delivered"], true);
        assert_eq!(result.data["delivery"]["recordCount"], 2);

        let path = dir.path().join("req-1").join("demographics.ndjson");
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(!written.contains("Ann Smith"));
    }
}
