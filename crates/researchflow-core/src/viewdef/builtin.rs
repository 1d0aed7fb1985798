//! ViewDefinitions shipped with the service.
//!
//! `condition_cohort` feeds the ViewDefinition cohort counter; the others
//! are starting points for ad-hoc exploration.

use super::model::{Column, SelectNode, ViewDefinition, WhereClause};

pub const PATIENT_DEMOGRAPHICS: &str = "patient_demographics";
pub const CONDITION_COHORT: &str = "condition_cohort";
pub const OBSERVATION_VALUES: &str = "observation_values";

fn view(name: &str, resource: &str, description: &str, select: Vec<SelectNode>) -> ViewDefinition {
    ViewDefinition {
        name: name.to_string(),
        resource: resource.to_string(),
        title: None,
        description: Some(description.to_string()),
        status: Some("active".to_string()),
        constant: Vec::new(),
        select,
        where_: Vec::new(),
    }
}

pub fn patient_demographics() -> ViewDefinition {
    view(
        PATIENT_DEMOGRAPHICS,
        "Patient",
        "One row per patient with birth date and gender",
        vec![
            SelectNode::Column(vec![
                Column::new("patient_id", "getResourceKey()"),
                Column::new("birth_date", "birthDate"),
                Column::new("gender", "gender"),
            ]),
            SelectNode::ForEachOrNull {
                path: "name.where(use = 'official').first()".to_string(),
                select: vec![SelectNode::Column(vec![Column::new("family", "family")])],
            },
        ],
    )
}

/// One row per condition coding with the owning patient and onset.
pub fn condition_cohort() -> ViewDefinition {
    view(
        CONDITION_COHORT,
        "Condition",
        "Condition codes per patient with onset dates",
        vec![
            SelectNode::Column(vec![
                Column::new("condition_id", "getResourceKey()"),
                Column::new("patient_id", "subject.getReferenceKey(Patient)"),
                Column::new("onset_date", "onsetDateTime"),
            ]),
            SelectNode::ForEach {
                path: "code.coding".to_string(),
                select: vec![SelectNode::Column(vec![
                    Column::new("code", "code"),
                    Column::new("system", "system"),
                    Column::new("display", "display"),
                ])],
            },
        ],
    )
}

pub fn observation_values() -> ViewDefinition {
    let mut v = view(
        OBSERVATION_VALUES,
        "Observation",
        "Numeric observation values per patient",
        vec![
            SelectNode::Column(vec![
                Column::new("observation_id", "getResourceKey()"),
                Column::new("patient_id", "subject.getReferenceKey(Patient)"),
                Column::new("code", "code.coding.code.first()"),
                Column::new("value", "value.ofType(Quantity).value"),
                Column::new("unit", "value.ofType(Quantity).unit"),
                Column::new("observed_at", "effectiveDateTime"),
            ]),
        ],
    );
    v.where_.push(WhereClause {
        path: "value.ofType(Quantity).exists()".to_string(),
        description: Some("Numeric results only".to_string()),
    });
    v
}

pub fn all() -> Vec<ViewDefinition> {
    vec![patient_demographics(), condition_cohort(), observation_values()]
}
