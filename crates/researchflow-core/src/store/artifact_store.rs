use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{
    millis_to_dt, Delivery, DeliveredFile, FeasibilityRecord, Requirements, RequirementsRecord,
};

/// Requirements snapshots, feasibility reports and delivery records.
#[derive(Clone)]
pub struct ArtifactStore {
    db: Database,
}

impl ArtifactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the requirements for a request, bumping the version.
    pub async fn save_requirements(
        &self,
        request_id: &str,
        requirements: &Requirements,
    ) -> Result<RequirementsRecord, ServerError> {
        let rid = request_id.to_string();
        let data = serde_json::to_string(requirements)?;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO requirements (request_id, data, version, created_at, updated_at)
                     VALUES (?1, ?2, 1, ?3, ?3)
                     ON CONFLICT(request_id) DO UPDATE SET
                       data = excluded.data,
                       version = requirements.version + 1,
                       updated_at = excluded.updated_at",
                    rusqlite::params![rid, data, now],
                )?;
                Ok(())
            })
            .await?;
        self.get_requirements(request_id)
            .await?
            .ok_or_else(|| ServerError::Internal("Requirements vanished after save".to_string()))
    }

    pub async fn get_requirements(
        &self,
        request_id: &str,
    ) -> Result<Option<RequirementsRecord>, ServerError> {
        let rid = request_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT request_id, data, version, created_at, updated_at
                     FROM requirements WHERE request_id = ?1",
                    rusqlite::params![rid],
                    |row| {
                        let data: String = row.get(1).unwrap_or_else(|_| "{}".to_string());
                        Ok(RequirementsRecord {
                            request_id: row.get(0).unwrap_or_default(),
                            data: serde_json::from_str(&data).unwrap_or_default(),
                            version: row.get::<_, i64>(2).unwrap_or(1) as u32,
                            created_at: millis_to_dt(row.get(3).unwrap_or(0)),
                            updated_at: millis_to_dt(row.get(4).unwrap_or(0)),
                        })
                    },
                )
                .optional()
            })
            .await
    }

    pub async fn save_feasibility(
        &self,
        request_id: &str,
        feasible: bool,
        score: f64,
        estimated_count: u64,
        report: serde_json::Value,
    ) -> Result<FeasibilityRecord, ServerError> {
        let record = FeasibilityRecord {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            feasible,
            score,
            estimated_count,
            report,
            created_at: Utc::now(),
        };
        let r = record.clone();
        let report = serde_json::to_string(&r.report)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO feasibility_reports (id, request_id, feasible, score, estimated_count, report, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        r.id,
                        r.request_id,
                        r.feasible as i64,
                        r.score,
                        r.estimated_count as i64,
                        report,
                        r.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }

    pub async fn latest_feasibility(
        &self,
        request_id: &str,
    ) -> Result<Option<FeasibilityRecord>, ServerError> {
        let rid = request_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, request_id, feasible, score, estimated_count, report, created_at
                     FROM feasibility_reports WHERE request_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    rusqlite::params![rid],
                    |row| {
                        let report: String = row.get(5).unwrap_or_else(|_| "{}".to_string());
                        Ok(FeasibilityRecord {
                            id: row.get(0).unwrap_or_default(),
                            request_id: row.get(1).unwrap_or_default(),
                            feasible: row.get::<_, i64>(2).unwrap_or(0) != 0,
                            score: row.get(3).unwrap_or(0.0),
                            estimated_count: row.get::<_, i64>(4).unwrap_or(0) as u64,
                            report: serde_json::from_str(&report).unwrap_or(serde_json::Value::Null),
                            created_at: millis_to_dt(row.get(6).unwrap_or(0)),
                        })
                    },
                )
                .optional()
            })
            .await
    }

    pub async fn save_delivery(&self, delivery: &Delivery) -> Result<(), ServerError> {
        let d = delivery.clone();
        let files = serde_json::to_string(&d.files)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO deliveries (id, request_id, location, format, phi_level, files, record_count, delivered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        d.id,
                        d.request_id,
                        d.location,
                        d.format,
                        d.phi_level,
                        files,
                        d.record_count as i64,
                        d.delivered_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_deliveries(&self, request_id: &str) -> Result<Vec<Delivery>, ServerError> {
        let rid = request_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, request_id, location, format, phi_level, files, record_count, delivered_at
                     FROM deliveries WHERE request_id = ?1 ORDER BY delivered_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![rid], |row| {
                        let files: String = row.get(5).unwrap_or_else(|_| "[]".to_string());
                        Ok(Delivery {
                            id: row.get(0).unwrap_or_default(),
                            request_id: row.get(1).unwrap_or_default(),
                            location: row.get(2).unwrap_or_default(),
                            format: row.get(3).unwrap_or_default(),
                            phi_level: row.get(4).unwrap_or_default(),
                            files: serde_json::from_str::<Vec<DeliveredFile>>(&files).unwrap_or_default(),
                            record_count: row.get::<_, i64>(6).unwrap_or(0) as u64,
                            delivered_at: millis_to_dt(row.get(7).unwrap_or(0)),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateRequestInput;
    use crate::store::RequestStore;

    #[tokio::test]
    async fn test_requirements_version_increments() {
        let db = Database::open_in_memory().unwrap();
        let request = RequestStore::new(db.clone())
            .create(CreateRequestInput {
                researcher_name: "A".into(),
                researcher_email: "a@example.org".into(),
                department: None,
                initial_request: "hypertension cohort".into(),
                requirements: None,
            })
            .await
            .unwrap();
        let store = ArtifactStore::new(db);

        let mut req = Requirements {
            inclusion_criteria: vec!["hypertension".into()],
            ..Default::default()
        };
        let first = store.save_requirements(&request.id, &req).await.unwrap();
        assert_eq!(first.version, 1);

        req.exclusion_criteria.push("pregnancy".into());
        let second = store.save_requirements(&request.id, &req).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.data.exclusion_criteria, vec!["pregnancy".to_string()]);
    }
}
