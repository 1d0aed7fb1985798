//! Feasibility scoring.
//!
//! `score = 0.4 * cohort + 0.4 * availability + 0.2 * time`, where
//! `cohort` is 1 when the estimate reaches the minimum cohort size,
//! `availability` is the mean availability of the requested data elements
//! and `time` is 1 for a bounded period, 0.5 for a half-open one and 0
//! otherwise. A request is feasible when the score exceeds 0.6.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::Requirements;

pub const COHORT_WEIGHT: f64 = 0.4;
pub const AVAILABILITY_WEIGHT: f64 = 0.4;
pub const TIME_WEIGHT: f64 = 0.2;
pub const FEASIBILITY_THRESHOLD: f64 = 0.6;
const LOW_AVAILABILITY: f64 = 0.7;

/// Share of warehouse patients that carry a given data element.
pub fn element_availability(element: &str) -> f64 {
    match element.trim().to_lowercase().replace(|c: char| c == ' ' || c == '-', "_").as_str() {
        "demographics" => 1.0,
        "diagnoses" | "conditions" => 0.95,
        "medications" => 0.9,
        "lab_results" | "labs" => 0.85,
        "procedures" => 0.85,
        "vitals" | "vital_signs" => 0.8,
        "notes" | "clinical_notes" => 0.6,
        "imaging" => 0.5,
        _ => 0.5,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub cohort: f64,
    pub availability: f64,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityWarning {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityReport {
    pub feasible: bool,
    pub score: f64,
    pub estimated_count: u64,
    pub minimum_cohort_size: u64,
    pub components: ScoreComponents,
    pub data_availability: BTreeMap<String, f64>,
    pub warnings: Vec<FeasibilityWarning>,
}

impl FeasibilityReport {
    pub fn has_warning(&self, kind: &str) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}

pub fn assess(estimated_count: u64, requirements: &Requirements) -> FeasibilityReport {
    let availability: BTreeMap<String, f64> = requirements
        .data_elements
        .iter()
        .map(|e| (e.clone(), element_availability(e)))
        .collect();
    assess_with_availability(estimated_count, availability, requirements)
}

pub fn assess_with_availability(
    estimated_count: u64,
    data_availability: BTreeMap<String, f64>,
    requirements: &Requirements,
) -> FeasibilityReport {
    let minimum = requirements.minimum_cohort_size();
    let cohort = if estimated_count >= minimum { 1.0 } else { 0.0 };
    let availability = if data_availability.is_empty() {
        1.0
    } else {
        data_availability.values().map(|v| v.clamp(0.0, 1.0)).sum::<f64>()
            / data_availability.len() as f64
    };
    let period = requirements.time_period.unwrap_or_default();
    let time = match (period.start.is_some(), period.end.is_some()) {
        (true, true) => 1.0,
        (false, false) => 0.0,
        _ => 0.5,
    };

    let raw = COHORT_WEIGHT * cohort + AVAILABILITY_WEIGHT * availability + TIME_WEIGHT * time;
    // Three decimal places.
    let score = ((raw * 1000.0).round() / 1000.0).clamp(0.0, 1.0);

    let mut warnings = Vec::new();
    if estimated_count < minimum {
        warnings.push(FeasibilityWarning {
            kind: "small_cohort".to_string(),
            message: format!(
                "Estimated cohort of {} is below the minimum of {}",
                estimated_count, minimum
            ),
            suggestion: Some(
                "Broaden the inclusion criteria, relax exclusions, extend the time period \
                 or lower the minimum cohort size"
                    .to_string(),
            ),
        });
    }
    let sparse: Vec<&str> = data_availability
        .iter()
        .filter(|(_, v)| **v < LOW_AVAILABILITY)
        .map(|(k, _)| k.as_str())
        .collect();
    if !sparse.is_empty() {
        warnings.push(FeasibilityWarning {
            kind: "limited_data_availability".to_string(),
            message: format!("Limited availability for: {}", sparse.join(", ")),
            suggestion: Some("Expect gaps in these elements or drop them from the request".to_string()),
        });
    }
    if time < 1.0 {
        warnings.push(FeasibilityWarning {
            kind: "unbounded_time_period".to_string(),
            message: "The study period is not bounded on both ends".to_string(),
            suggestion: Some("Give both a start and an end date".to_string()),
        });
    }

    FeasibilityReport {
        feasible: score > FEASIBILITY_THRESHOLD,
        score,
        estimated_count,
        minimum_cohort_size: minimum,
        components: ScoreComponents {
            cohort,
            availability,
            time,
        },
        data_availability,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requirements(value: serde_json::Value) -> Requirements {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_small_diabetes_cohort_is_not_feasible() {
        let req = requirements(json!({
            "inclusion_criteria": ["diabetes"],
            "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
            "minimum_cohort_size": 50
        }));
        let report = assess(40, &req);
        assert!(!report.feasible);
        let warning = report.warnings.iter().find(|w| w.kind == "small_cohort").unwrap();
        assert!(warning.suggestion.as_deref().unwrap_or_default().contains("Broaden"));
    }

    #[test]
    fn test_score_bounds_and_threshold() {
        let elements = [vec![], vec!["demographics"], vec!["imaging", "notes"]];
        let periods = [
            json!(null),
            json!({ "start": "2020-01-01" }),
            json!({ "start": "2020-01-01", "end": "2020-12-31" }),
        ];
        for els in &elements {
            for period in &periods {
                for count in [0u64, 99, 100, 5000] {
                    let req = requirements(json!({
                        "data_elements": els,
                        "time_period": period,
                    }));
                    let a = assess(count, &req);
                    let b = assess(count, &req);
                    assert_eq!(a, b);
                    assert!((0.0..=1.0).contains(&a.score));
                    assert_eq!(a.feasible, a.score > FEASIBILITY_THRESHOLD);
                }
            }
        }
    }

    #[test]
    fn test_adequate_request_scores_high() {
        let req = requirements(json!({
            "data_elements": ["demographics", "diagnoses"],
            "time_period": { "start": "2020-01-01", "end": "2020-12-31" },
            "minimum_cohort_size": 10
        }));
        let report = assess(250, &req);
        assert!(report.feasible);
        assert!((report.score - 0.99).abs() < 1e-9);
        assert!(report.warnings.is_empty());

        let sparse = assess(250, &requirements(json!({ "data_elements": ["imaging"] })));
        assert!(sparse.has_warning("limited_data_availability"));
        assert!(sparse.has_warning("unbounded_time_period"));
    }
}
