//! Persisted workflow artefacts: requirements snapshots, feasibility
//! reports, deliveries and materialized views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::requirements::Requirements;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementsRecord {
    pub request_id: String,
    pub data: Requirements,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeasibilityRecord {
    pub id: String,
    pub request_id: String,
    pub feasible: bool,
    pub score: f64,
    pub estimated_count: u64,
    pub report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredFile {
    pub name: String,
    pub path: String,
    pub records: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: String,
    pub request_id: String,
    pub location: String,
    pub format: String,
    pub phi_level: String,
    pub files: Vec<DeliveredFile>,
    pub record_count: u64,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedView {
    pub name: String,
    pub view_name: String,
    pub table_name: String,
    pub row_count: u64,
    pub refreshed_at: DateTime<Utc>,
}
