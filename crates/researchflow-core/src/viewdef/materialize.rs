//! Materialized views: a view result copied into an `mv_<name>` table in
//! the warehouse so it can be queried through the SQL sandbox.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::model::{is_identifier, ViewDefinition};
use super::runner::{ViewResult, ViewRunner};
use super::ViewError;
use crate::db::Database;
use crate::models::{millis_to_dt, MaterializedView};

pub const TABLE_PREFIX: &str = "mv_";

#[derive(Clone)]
pub struct MaterializedViewStore {
    db: Database,
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn row_to_mv(row: &rusqlite::Row) -> Result<MaterializedView, rusqlite::Error> {
    Ok(MaterializedView {
        name: row.get("name")?,
        view_name: row.get("view_name")?,
        table_name: row.get("table_name")?,
        row_count: row.get::<_, i64>("row_count")?.max(0) as u64,
        refreshed_at: millis_to_dt(row.get("refreshed_at")?),
    })
}

impl MaterializedViewStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn table_name(name: &str) -> Result<String, ViewError> {
        if !is_identifier(name) {
            return Err(ViewError::Invalid(format!(
                "materialized view name '{}' must be letters, digits and underscores",
                name
            )));
        }
        Ok(format!("{}{}", TABLE_PREFIX, name))
    }

    /// Replace the `mv_<name>` table with `result`'s rows.
    pub async fn materialize(
        &self,
        name: &str,
        result: &ViewResult,
    ) -> Result<MaterializedView, ViewError> {
        let table = Self::table_name(name)?;
        if result.columns.is_empty() {
            return Err(ViewError::Invalid("view produced no columns".to_string()));
        }
        let record = MaterializedView {
            name: name.to_string(),
            view_name: result.view_name.clone(),
            table_name: table.clone(),
            row_count: result.rows.len() as u64,
            refreshed_at: Utc::now(),
        };

        let columns = result.columns.clone();
        let rows: Vec<Vec<SqlValue>> = result
            .rows
            .iter()
            .map(|r| r.iter().map(to_sql_value).collect())
            .collect();
        let meta = record.clone();

        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let column_defs = columns
                    .iter()
                    .map(|c| format!("\"{}\"", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                tx.execute_batch(&format!(
                    "DROP TABLE IF EXISTS \"{table}\"; CREATE TABLE \"{table}\" ({column_defs});"
                ))?;
                {
                    let placeholders = vec!["?"; columns.len()].join(", ");
                    let mut stmt = tx.prepare(&format!(
                        "INSERT INTO \"{}\" VALUES ({})",
                        table, placeholders
                    ))?;
                    for row in &rows {
                        stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                    }
                }
                tx.execute(
                    "INSERT INTO materialized_views (name, view_name, table_name, row_count, refreshed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(name) DO UPDATE SET
                        view_name = excluded.view_name,
                        table_name = excluded.table_name,
                        row_count = excluded.row_count,
                        refreshed_at = excluded.refreshed_at",
                    rusqlite::params![
                        meta.name,
                        meta.view_name,
                        meta.table_name,
                        meta.row_count as i64,
                        meta.refreshed_at.timestamp_millis(),
                    ],
                )?;
                tx.commit()
            })
            .await?;

        tracing::info!(
            "[MaterializedViews] {} refreshed from view {} ({} rows)",
            record.table_name,
            record.view_name,
            record.row_count
        );
        Ok(record)
    }

    /// Re-run `view` bypassing the result cache and materialize it as `name`.
    pub async fn refresh(
        &self,
        name: &str,
        view: &ViewDefinition,
        runner: &ViewRunner,
    ) -> Result<MaterializedView, ViewError> {
        runner.cache().invalidate_view(&view.name);
        let result = runner.run(view, &[]).await?;
        self.materialize(name, &result).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<MaterializedView>, ViewError> {
        let name = name.to_string();
        Ok(self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM materialized_views WHERE name = ?1")?;
                let mut rows = stmt.query_map(rusqlite::params![name], row_to_mv)?;
                rows.next().transpose()
            })
            .await?)
    }

    pub async fn list(&self) -> Result<Vec<MaterializedView>, ViewError> {
        Ok(self
            .db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM materialized_views ORDER BY name")?;
                let rows = stmt.query_map([], row_to_mv)?;
                rows.collect()
            })
            .await?)
    }

    pub async fn drop_view(&self, name: &str) -> Result<bool, ViewError> {
        let table = Self::table_name(name)?;
        let name = name.to_string();
        let removed = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table))?;
                let n = tx.execute(
                    "DELETE FROM materialized_views WHERE name = ?1",
                    rusqlite::params![name],
                )?;
                tx.commit()?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::SqlSandbox;
    use serde_json::json;

    fn result() -> ViewResult {
        ViewResult {
            view_name: "patient_demographics".into(),
            resource_type: "Patient".into(),
            columns: vec!["patient_id".into(), "age".into(), "tags".into()],
            rows: vec![
                vec![json!("p1"), json!(54), json!(["a", "b"])],
                vec![json!("p2"), Value::Null, json!([])],
            ],
            resource_count: 2,
            from_cache: false,
            elapsed_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_materialize_query_and_drop() {
        let db = Database::open_in_memory().unwrap();
        let store = MaterializedViewStore::new(db.clone());

        let mv = store.materialize("demo", &result()).await.unwrap();
        assert_eq!(mv.table_name, "mv_demo");
        assert_eq!(mv.row_count, 2);

        let rows = SqlSandbox::new(db)
            .execute("SELECT patient_id, age, tags FROM mv_demo ORDER BY patient_id")
            .await
            .unwrap();
        assert_eq!(rows.row_count, 2);
        assert_eq!(rows.rows[0]["age"], json!(54));
        assert_eq!(rows.rows[0]["tags"], json!("[\"a\",\"b\"]"));

        // Materializing again replaces rather than appends.
        store.materialize("demo", &result()).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.get("demo").await.unwrap().unwrap().row_count, 2);

        assert!(store.drop_view("demo").await.unwrap());
        assert!(store.get("demo").await.unwrap().is_none());
        assert!(!store.drop_view("demo").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let store = MaterializedViewStore::new(Database::open_in_memory().unwrap());
        let err = store.materialize("x; DROP TABLE patients", &result()).await;
        assert!(matches!(err, Err(ViewError::Invalid(_))));
    }
}
