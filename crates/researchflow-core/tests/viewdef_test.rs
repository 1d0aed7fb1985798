//! ViewDefinitions over the warehouse: run, cache, materialize, query the
//! materialized table through the sandbox and count cohorts both ways.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use researchflow_core::cohort::{CohortCounter, SqlCohortCounter, ViewDefinitionCohortCounter};
use researchflow_core::models::Requirements;
use researchflow_core::sql::{PhenotypeQuery, SqlSandbox};
use researchflow_core::viewdef::builtin::{CONDITION_COHORT, PATIENT_DEMOGRAPHICS};
use researchflow_core::viewdef::{
    MaterializedViewStore, ViewDefinitionManager, ViewRunner, WarehouseFhirSource,
};
use researchflow_core::Database;

fn seed(db: &Database) {
    db.with_conn(|conn| {
        conn.execute_batch(
            "INSERT INTO patients (patient_id, mrn, name, birth_date, gender) VALUES
                ('p1', 'MRN-1', 'Ada Lovelace', '1961-02-03', 'female'),
                ('p2', 'MRN-2', 'Alan Turing', '1958-06-23', 'male'),
                ('p3', 'MRN-3', NULL, '1990-11-30', 'other');
             INSERT INTO conditions (id, patient_id, code, system, description, onset_date) VALUES
                ('c1', 'p1', 'E11.9', 'icd10', 'Type 2 diabetes mellitus', '2024-02-10'),
                ('c2', 'p2', 'E11.65', 'icd10', 'Type 2 diabetes with hyperglycemia', '2024-07-01'),
                ('c3', 'p2', 'I10', 'icd10', 'Essential hypertension', '2019-01-15'),
                ('c4', 'p3', 'E10.9', 'icd10', 'Type 1 diabetes mellitus', '2021-05-05');",
        )
    })
    .unwrap();
}

fn runner(db: &Database) -> Arc<ViewRunner> {
    Arc::new(ViewRunner::new(
        Arc::new(WarehouseFhirSource::new(db.clone())),
        Duration::from_secs(60),
    ))
}

fn diabetes_2024() -> Requirements {
    serde_json::from_value(json!({
        "inclusion_criteria": ["type 2 diabetes"],
        "data_elements": ["demographics"],
        "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
        "phi_level": "de_identified"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_views_run_over_warehouse_and_materialize() {
    let db = Database::open_in_memory().unwrap();
    seed(&db);
    let dir = tempfile::tempdir().unwrap();
    let manager = ViewDefinitionManager::new(dir.path()).unwrap();
    let installed = manager.install_builtins(false).unwrap();
    assert_eq!(installed.len(), 3);
    assert!(manager.install_builtins(false).unwrap().is_empty());

    let runner = runner(&db);

    // ── Patients: the nameless patient still yields a row ──
    let demographics = manager.load(PATIENT_DEMOGRAPHICS).unwrap();
    let result = runner.run(&demographics, &[]).await.unwrap();
    assert_eq!(result.resource_count, 3);
    assert_eq!(result.row_count(), 3);
    assert!(!result.from_cache);
    let records = result.records();
    let p3 = records.iter().find(|r| r["patient_id"] == "p3").unwrap();
    assert_eq!(p3["family"], Value::Null);
    let p1 = records.iter().find(|r| r["patient_id"] == "p1").unwrap();
    assert_eq!(p1["family"], "Lovelace");
    assert_eq!(p1["birth_date"], "1961-02-03");

    let again = runner.run(&demographics, &[]).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(again.rows, result.rows);

    // ── Conditions: materialize then query with SQL ──
    let conditions = manager.load(CONDITION_COHORT).unwrap();
    let store = MaterializedViewStore::new(db.clone());
    let record = store.refresh("diagnoses_flat", &conditions, &runner).await.unwrap();
    assert_eq!(record.table_name, "mv_diagnoses_flat");
    assert_eq!(record.row_count, 4);

    let sandbox = SqlSandbox::new(db.clone());
    let rows = sandbox
        .execute(
            "SELECT COUNT(DISTINCT patient_id) AS n FROM mv_diagnoses_flat \
             WHERE code LIKE 'E11%' AND onset_date >= '2024-01-01'",
        )
        .await
        .unwrap();
    assert_eq!(rows.rows[0]["n"], 2);

    assert_eq!(store.list().await.unwrap().len(), 1);
    assert!(store.drop_view("diagnoses_flat").await.unwrap());
    assert!(store.get("diagnoses_flat").await.unwrap().is_none());
    assert!(sandbox.execute("SELECT * FROM mv_diagnoses_flat").await.is_err());
}

#[tokio::test]
async fn test_cohort_backends_agree() {
    let db = Database::open_in_memory().unwrap();
    seed(&db);
    let requirements = diabetes_2024();
    let query = PhenotypeQuery::generate(&requirements);

    let sql = SqlCohortCounter::new(SqlSandbox::new(db.clone()));
    let views = ViewDefinitionCohortCounter::new(runner(&db));

    // p3's type 1 diagnosis predates the study period.
    assert_eq!(sql.count(&requirements, &query).await.unwrap(), 2);
    assert_eq!(views.count(&requirements, &query).await.unwrap(), 2);
    assert_eq!(views.backend(), "viewdef");
}
