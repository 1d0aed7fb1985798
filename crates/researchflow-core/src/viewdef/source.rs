//! Where view input resources come from.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::ViewError;
use crate::db::Database;

#[async_trait]
pub trait FhirSource: Send + Sync {
    fn name(&self) -> &str;

    /// All resources of `resource_type` matching `params`.
    async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, ViewError>;
}

// ---------------------------------------------------------------------------
// HTTP (FHIR REST search with Bundle paging)
// ---------------------------------------------------------------------------

pub struct FhirHttpClient {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    max_pages: usize,
}

impl FhirHttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: 100,
            max_pages: 50,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    async fn fetch_bundle(&self, request: reqwest::RequestBuilder) -> Result<Value, ViewError> {
        let response = request
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(|e| ViewError::Fetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ViewError::Fetch(format!("FHIR server returned {}: {}", status, body)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ViewError::Fetch(format!("Invalid Bundle JSON: {}", e)))
    }
}

#[async_trait]
impl FhirSource for FhirHttpClient {
    fn name(&self) -> &str {
        "fhir-http"
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, ViewError> {
        let url = format!("{}/{}", self.base_url, resource_type);
        let mut query: Vec<(String, String)> = params.to_vec();
        if !query.iter().any(|(k, _)| k == "_count") {
            query.push(("_count".to_string(), self.page_size.to_string()));
        }

        let mut resources = Vec::new();
        let mut bundle = self.fetch_bundle(self.client.get(&url).query(&query)).await?;
        let mut pages = 1;
        loop {
            if let Some(Value::Array(entries)) = bundle.get("entry") {
                resources.extend(
                    entries
                        .iter()
                        .filter_map(|e| e.get("resource"))
                        .filter(|r| r.get("resourceType").and_then(|t| t.as_str()) == Some(resource_type))
                        .cloned(),
                );
            }
            let next = next_link(&bundle);
            match next {
                Some(next_url) if pages < self.max_pages => {
                    bundle = self.fetch_bundle(self.client.get(&next_url)).await?;
                    pages += 1;
                }
                Some(_) => {
                    tracing::warn!(
                        "[FhirHttpClient] Stopped paging {} after {} pages",
                        resource_type,
                        pages
                    );
                    break;
                }
                None => break,
            }
        }

        tracing::debug!(
            "[FhirHttpClient] Fetched {} {} resources in {} page(s)",
            resources.len(),
            resource_type,
            pages
        );
        Ok(resources)
    }
}

fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|l| l.get("relation").and_then(|r| r.as_str()) == Some("next"))
        .and_then(|l| l.get("url"))
        .and_then(|u| u.as_str())
        .map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryFhirSource {
    resources: RwLock<Vec<Value>>,
}

impl InMemoryFhirSource {
    pub fn new(resources: Vec<Value>) -> Self {
        Self {
            resources: RwLock::new(resources),
        }
    }

    pub fn add(&self, resource: Value) {
        if let Ok(mut r) = self.resources.write() {
            r.push(resource);
        }
    }
}

#[async_trait]
impl FhirSource for InMemoryFhirSource {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, ViewError> {
        let resources = self
            .resources
            .read()
            .map_err(|_| ViewError::Fetch("resource store lock poisoned".to_string()))?;
        Ok(resources
            .iter()
            .filter(|r| r.get("resourceType").and_then(|t| t.as_str()) == Some(resource_type))
            .filter(|r| matches_params(r, params))
            .cloned()
            .collect())
    }
}

/// The search parameters the local sources understand: `_id`,
/// `patient`/`subject` (reference id), `code` (any coding) and plain
/// top-level string fields. `_count` and other `_` parameters are ignored.
fn matches_params(resource: &Value, params: &[(String, String)]) -> bool {
    params.iter().all(|(key, value)| match key.as_str() {
        "_id" => resource.get("id").and_then(|v| v.as_str()) == Some(value.as_str()),
        "patient" | "subject" => {
            let reference = resource
                .get("subject")
                .or_else(|| resource.get("patient"))
                .and_then(|s| s.get("reference"))
                .and_then(|r| r.as_str())
                .unwrap_or("");
            reference == value.as_str() || reference.rsplit('/').next() == Some(value.as_str())
        }
        "code" => resource
            .get("code")
            .and_then(|c| c.get("coding"))
            .and_then(|c| c.as_array())
            .map_or(false, |codings| {
                codings
                    .iter()
                    .any(|c| c.get("code").and_then(|v| v.as_str()) == Some(value.as_str()))
            }),
        k if k.starts_with('_') => true,
        k => resource.get(k).and_then(|v| v.as_str()) == Some(value.as_str()),
    })
}

// ---------------------------------------------------------------------------
// Warehouse tables rendered as FHIR
// ---------------------------------------------------------------------------

/// Exposes the warehouse tables as FHIR resources so views can run
/// without an external FHIR server.
pub struct WarehouseFhirSource {
    db: Database,
}

impl WarehouseFhirSource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn subject(patient_id: &str) -> Value {
    json!({ "reference": format!("Patient/{}", patient_id) })
}

fn code_system_uri(system: &str) -> &'static str {
    match system.to_ascii_lowercase().as_str() {
        "snomed" | "sct" => "http://snomed.info/sct",
        "loinc" => "http://loinc.org",
        "rxnorm" => "http://www.nlm.nih.gov/research/umls/rxnorm",
        _ => "http://hl7.org/fhir/sid/icd-10-cm",
    }
}

fn strip_nulls(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.retain(|_, v| !v.is_null());
    }
    value
}

#[async_trait]
impl FhirSource for WarehouseFhirSource {
    fn name(&self) -> &str {
        "warehouse"
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, ViewError> {
        let rt = resource_type.to_string();
        let resources = self
            .db
            .with_conn_async(move |conn| {
                let mut out = Vec::new();
                match rt.as_str() {
                    "Patient" => {
                        let mut stmt = conn.prepare(
                            "SELECT patient_id, mrn, name, birth_date, gender, address, phone, email FROM patients",
                        )?;
                        let rows = stmt.query_map([], |row| {
                            let id: String = row.get(0)?;
                            let mrn: Option<String> = row.get(1)?;
                            let name: Option<String> = row.get(2)?;
                            let address: Option<String> = row.get(5)?;
                            let phone: Option<String> = row.get(6)?;
                            let email: Option<String> = row.get(7)?;
                            let mut telecom = Vec::new();
                            if let Some(p) = phone {
                                telecom.push(json!({ "system": "phone", "value": p }));
                            }
                            if let Some(e) = email {
                                telecom.push(json!({ "system": "email", "value": e }));
                            }
                            let telecom = if telecom.is_empty() {
                                Value::Null
                            } else {
                                Value::Array(telecom)
                            };
                            let name = name.map(|n| {
                                let mut parts: Vec<&str> = n.split_whitespace().collect();
                                let family = parts.pop().unwrap_or_default().to_string();
                                json!([{ "use": "official", "text": n, "family": family, "given": parts }])
                            });
                            Ok(strip_nulls(json!({
                                "resourceType": "Patient",
                                "id": id,
                                "identifier": mrn.map(|m| json!([{ "system": "urn:mrn", "value": m }])),
                                "name": name,
                                "birthDate": row.get::<_, Option<String>>(3)?,
                                "gender": row.get::<_, Option<String>>(4)?,
                                "address": address.map(|a| json!([{ "text": a }])),
                                "telecom": telecom,
                            })))
                        })?;
                        for r in rows {
                            out.push(r?);
                        }
                    }
                    "Condition" => {
                        let mut stmt = conn.prepare(
                            "SELECT id, patient_id, code, system, description, onset_date FROM conditions",
                        )?;
                        let rows = stmt.query_map([], |row| {
                            let pid: String = row.get(1)?;
                            let system: String = row.get(3)?;
                            let description: Option<String> = row.get(4)?;
                            Ok(strip_nulls(json!({
                                "resourceType": "Condition",
                                "id": row.get::<_, String>(0)?,
                                "subject": subject(&pid),
                                "code": strip_nulls(json!({
                                    "coding": [strip_nulls(json!({
                                        "system": code_system_uri(&system),
                                        "code": row.get::<_, String>(2)?,
                                        "display": description,
                                    }))],
                                    "text": description,
                                })),
                                "onsetDateTime": row.get::<_, Option<String>>(5)?,
                            })))
                        })?;
                        for r in rows {
                            out.push(r?);
                        }
                    }
                    "Observation" => {
                        let mut stmt = conn.prepare(
                            "SELECT id, patient_id, code, description, value, unit, observed_at FROM observations",
                        )?;
                        let rows = stmt.query_map([], |row| {
                            let pid: String = row.get(1)?;
                            let description: Option<String> = row.get(3)?;
                            let value: Option<f64> = row.get(4)?;
                            Ok(strip_nulls(json!({
                                "resourceType": "Observation",
                                "id": row.get::<_, String>(0)?,
                                "status": "final",
                                "subject": subject(&pid),
                                "code": strip_nulls(json!({
                                    "coding": [strip_nulls(json!({
                                        "system": "http://loinc.org",
                                        "code": row.get::<_, String>(2)?,
                                        "display": description,
                                    }))],
                                    "text": description,
                                })),
                                "valueQuantity": value.map(|v| strip_nulls(json!({
                                    "value": v,
                                    "unit": row.get::<_, Option<String>>(5).ok().flatten(),
                                }))),
                                "effectiveDateTime": row.get::<_, Option<String>>(6)?,
                            })))
                        })?;
                        for r in rows {
                            out.push(r?);
                        }
                    }
                    "MedicationStatement" => {
                        let mut stmt = conn.prepare(
                            "SELECT id, patient_id, code, name, start_date, end_date FROM medications",
                        )?;
                        let rows = stmt.query_map([], |row| {
                            let pid: String = row.get(1)?;
                            let name: String = row.get(3)?;
                            Ok(strip_nulls(json!({
                                "resourceType": "MedicationStatement",
                                "id": row.get::<_, String>(0)?,
                                "status": "recorded",
                                "subject": subject(&pid),
                                "medicationCodeableConcept": {
                                    "coding": [strip_nulls(json!({
                                        "system": code_system_uri("rxnorm"),
                                        "code": row.get::<_, Option<String>>(2)?,
                                        "display": name,
                                    }))],
                                    "text": name,
                                },
                                "effectivePeriod": strip_nulls(json!({
                                    "start": row.get::<_, Option<String>>(4)?,
                                    "end": row.get::<_, Option<String>>(5)?,
                                })),
                            })))
                        })?;
                        for r in rows {
                            out.push(r?);
                        }
                    }
                    "Procedure" => {
                        let mut stmt = conn.prepare(
                            "SELECT id, patient_id, code, description, performed_at FROM procedures",
                        )?;
                        let rows = stmt.query_map([], |row| {
                            let pid: String = row.get(1)?;
                            let description: Option<String> = row.get(3)?;
                            Ok(strip_nulls(json!({
                                "resourceType": "Procedure",
                                "id": row.get::<_, String>(0)?,
                                "status": "completed",
                                "subject": subject(&pid),
                                "code": strip_nulls(json!({
                                    "coding": [{ "code": row.get::<_, String>(2)? }],
                                    "text": description,
                                })),
                                "performedDateTime": row.get::<_, Option<String>>(4)?,
                            })))
                        })?;
                        for r in rows {
                            out.push(r?);
                        }
                    }
                    other => {
                        tracing::warn!("[WarehouseFhirSource] No table backs resource type {}", other);
                    }
                }
                Ok(out)
            })
            .await?;

        Ok(resources
            .into_iter()
            .filter(|r| matches_params(r, params))
            .collect())
    }
}
