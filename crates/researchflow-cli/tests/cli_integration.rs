//! Integration tests for the researchflow-cli commands.
//!
//! These tests verify that the CLI commands work correctly by
//! exercising the same code paths as the binary, using in-memory
//! SQLite databases for isolation.

use researchflow_cli::commands;
use researchflow_core::{AppConfig, AppState};
use serde_json::json;
use tempfile::TempDir;

/// Create an in-memory AppState with 60 type 2 diabetes patients.
async fn test_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        viewdef_dir: dir.path().join("views"),
        delivery_dir: dir.path().join("deliveries"),
        ..AppConfig::default()
    };
    let state = commands::init_state(config)
        .await
        .expect("Failed to initialize state");

    state
        .warehouse
        .with_conn(|conn| {
            for i in 0..60 {
                let gender = if i % 2 == 0 { "female" } else { "male" };
                conn.execute(
                    "INSERT INTO patients (patient_id, mrn, name, birth_date, gender)
                     VALUES (?1, ?2, ?3, '1975-09-30', ?4)",
                    rusqlite::params![
                        format!("p{}", i),
                        format!("MRN-{}", i),
                        format!("Cli Patient{}", i),
                        gender
                    ],
                )?;
                conn.execute(
                    "INSERT INTO conditions (id, patient_id, code, system, description, onset_date)
                     VALUES (?1, ?2, 'E11.9', 'icd10', 'Type 2 diabetes mellitus', '2024-02-14')",
                    rusqlite::params![format!("c{}", i), format!("p{}", i)],
                )?;
            }
            Ok(())
        })
        .expect("Failed to seed warehouse");

    (state, dir)
}

fn submit_args(requirements: Option<serde_json::Value>) -> commands::request::SubmitArgs {
    commands::request::SubmitArgs {
        researcher_name: "Dr. Lindqvist".to_string(),
        researcher_email: "lindqvist@example.org".to_string(),
        department: Some("Endocrinology".to_string()),
        text: "Type 2 diabetes patients diagnosed in 2024".to_string(),
        requirements,
        auto_start: true,
    }
}

#[tokio::test]
async fn test_request_submit_and_approve() {
    let (state, _dir) = test_state().await;

    let submitted = commands::request::submit(
        &state,
        submit_args(Some(json!({
            "inclusion_criteria": ["diabetes"],
            "data_elements": ["demographics", "diagnoses"],
            "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
            "phi_level": "de_identified",
            "minimum_cohort_size": 50
        }))),
    )
    .await
    .unwrap();
    assert_eq!(submitted["outcome"]["status"], "awaiting_approval");
    assert_eq!(submitted["outcome"]["approvalType"], "requirements");
    let request_id = submitted["request"]["id"].as_str().unwrap().to_string();
    let approval_id = submitted["outcome"]["approvalId"].as_str().unwrap().to_string();

    let listed = commands::request::list(&state, Some("requirements_review"))
        .await
        .unwrap();
    assert_eq!(listed["requests"].as_array().unwrap().len(), 1);

    let pending = commands::approval::list(&state, None, Some(&request_id))
        .await
        .unwrap();
    let approvals = pending["approvals"].as_array().unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0]["id"], approval_id.as_str());

    let responded = commands::approval::respond(
        &state,
        &approval_id,
        "approve",
        "irb@example.org",
        Some("looks complete".to_string()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(responded["approval"]["status"], "approved");
    assert_eq!(responded["outcome"]["approvalType"], "phenotype_sql");

    let again = commands::approval::respond(&state, &approval_id, "reject", "irb@example.org", None, None)
        .await
        .unwrap_err();
    assert!(again.contains("already approved"), "unexpected error: {}", again);

    let history = commands::request::show(&state, &request_id).await.unwrap();
    assert_eq!(history["request"]["currentState"], "phenotype_review");
    assert_eq!(history["approvals"].as_array().unwrap().len(), 2);

    let all = commands::approval::list(&state, Some("all"), Some(&request_id))
        .await
        .unwrap();
    assert_eq!(all["approvals"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_request_respond_after_pause() {
    let (state, _dir) = test_state().await;

    let mut args = submit_args(None);
    args.text = "Need some records please".to_string();
    let submitted = commands::request::submit(&state, args).await.unwrap();
    assert_eq!(submitted["outcome"]["status"], "paused");
    let request_id = submitted["request"]["id"].as_str().unwrap().to_string();

    let responded = commands::request::respond(
        &state,
        &request_id,
        "De-identified, demographics and diagnoses for 2024",
        Some(json!({
            "inclusion_criteria": ["diabetes"],
            "data_elements": ["demographics", "diagnoses"],
            "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
            "phi_level": "de_identified",
            "minimum_cohort_size": 50
        })),
    )
    .await
    .unwrap();
    assert_eq!(responded["outcome"]["status"], "awaiting_approval");
    assert_eq!(responded["outcome"]["approvalType"], "requirements");
}

#[tokio::test]
async fn test_invalid_arguments_are_rejected() {
    let (state, _dir) = test_state().await;

    let err = commands::request::list(&state, Some("sleeping")).await.unwrap_err();
    assert!(err.contains("Unknown workflow state"));

    let err = commands::approval::list(&state, Some("maybe"), None).await.unwrap_err();
    assert!(err.contains("Unknown approval status"));

    let err = commands::approval::respond(&state, "missing", "shrug", "irb@example.org", None, None)
        .await
        .unwrap_err();
    assert!(err.contains("Unknown decision"));

    let err = commands::escalation::resolve(&state, "missing", "ignore", None)
        .await
        .unwrap_err();
    assert!(err.contains("Unknown action"));

    let err = commands::request::process(&state, "missing").await.unwrap_err();
    assert!(err.contains("not found"));

    let err = commands::parse_json_arg("--requirements", "{not json").unwrap_err();
    assert!(err.contains("--requirements"));

    let mut submit = submit_args(None);
    submit.researcher_email = "  ".to_string();
    assert!(commands::request::submit(&state, submit).await.is_err());
}

#[tokio::test]
async fn test_escalations_and_timeouts_empty() {
    let (state, _dir) = test_state().await;

    let escalations = commands::escalation::list(&state, None, None).await.unwrap();
    assert!(escalations["escalations"].as_array().unwrap().is_empty());

    let timeouts = commands::approval::check_timeouts(&state).await.unwrap();
    assert_eq!(timeouts["timedOut"], 0);
}

#[tokio::test]
async fn test_view_commands() {
    let (state, dir) = test_state().await;

    let listed = commands::view::list(&state).unwrap();
    assert_eq!(listed["views"].as_array().unwrap().len(), 3);

    let yaml_path = dir.path().join("patient_gender.yaml");
    std::fs::write(
        &yaml_path,
        r#"name: patient_gender
resource: Patient
select:
  - column:
      - name: patient_id
        path: getResourceKey()
      - name: gender
        path: gender
"#,
    )
    .unwrap();

    let checked = commands::view::validate(&yaml_path).unwrap();
    assert_eq!(checked["valid"], true);
    assert_eq!(checked["columns"], json!(["patient_id", "gender"]));

    let bad_path = dir.path().join("bad.json");
    std::fs::write(&bad_path, r#"{"name": "bad name", "resource": "Patient", "select": []}"#).unwrap();
    let checked = commands::view::validate(&bad_path).unwrap();
    assert_eq!(checked["valid"], false);
    assert!(commands::view::save(&state, &bad_path).is_err());

    let saved = commands::view::save(&state, &yaml_path).unwrap();
    assert_eq!(saved["view"]["name"], "patient_gender");
    assert_eq!(commands::view::list(&state).unwrap()["views"].as_array().unwrap().len(), 4);

    let params = commands::view::parse_params(&["gender=female".to_string()]).unwrap();
    let run = commands::view::run(&state, "patient_gender", &params, Some(10))
        .await
        .unwrap();
    assert_eq!(run["totalRows"], 30);
    assert_eq!(run["result"]["rows"].as_array().unwrap().len(), 10);
    assert_eq!(run["result"]["columns"], json!(["patient_id", "gender"]));

    assert!(commands::view::parse_params(&["gender".to_string()]).is_err());
    assert!(commands::view::run(&state, "no_such_view", &[], None).await.is_err());
}

#[tokio::test]
async fn test_sql_command() {
    let (state, _dir) = test_state().await;

    let result = commands::sql::execute(
        &state,
        "SELECT gender, COUNT(*) AS n FROM patients GROUP BY gender ORDER BY gender",
    )
    .await
    .unwrap();
    assert_eq!(result["rowCount"], 2);
    assert_eq!(result["rows"][0]["gender"], "female");
    assert_eq!(result["rows"][0]["n"], 30);

    let err = commands::sql::execute(&state, "DROP TABLE patients").await.unwrap_err();
    assert!(!err.is_empty());
}

#[test]
fn test_load_config_db_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("researchflow.yaml");
    std::fs::write(&path, "database_url: from-file.db\nview_cache_ttl_secs: 42\n").unwrap();

    let config = commands::load_config(path.to_str(), Some("sqlite::memory:")).unwrap();
    assert_eq!(config.database_url, "sqlite::memory:");

    assert!(commands::load_config(Some("/nonexistent/researchflow.yaml"), None).is_err());
}
