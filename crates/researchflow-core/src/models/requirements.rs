//! Structured study requirements gathered from the researcher.
//!
//! These travel through agent contexts as JSON, so they use the
//! snake_case shape the agents read and write.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Cohort size assumed when the researcher does not state one.
pub const DEFAULT_MINIMUM_COHORT_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhiLevel {
    #[serde(alias = "de-identified", alias = "deidentified")]
    DeIdentified,
    #[serde(alias = "limited-dataset", alias = "limited")]
    LimitedDataset,
    Identified,
}

impl PhiLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeIdentified => "de_identified",
            Self::LimitedDataset => "limited_dataset",
            Self::Identified => "identified",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "de_identified" | "deidentified" => Some(Self::DeIdentified),
            "limited_dataset" | "limited" => Some(Self::LimitedDataset),
            "identified" => Some(Self::Identified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFormat {
    #[default]
    Json,
    Ndjson,
}

impl DeliveryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Ndjson => "ndjson",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimePeriod {
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl TimePeriod {
    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_title: Option<String>,
    #[serde(default)]
    pub inclusion_criteria: Vec<String>,
    #[serde(default)]
    pub exclusion_criteria: Vec<String>,
    #[serde(default)]
    pub data_elements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_period: Option<TimePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phi_level: Option<PhiLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_cohort_size: Option<u64>,
    #[serde(default)]
    pub delivery_format: DeliveryFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irb_number: Option<String>,
}

impl Requirements {
    /// Fields that must be filled in before requirements go to review.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.inclusion_criteria.iter().all(|c| c.trim().is_empty()) {
            missing.push("inclusion_criteria");
        }
        if self.data_elements.is_empty() {
            missing.push("data_elements");
        }
        if self.time_period.map_or(true, |tp| tp.start.is_none() && tp.end.is_none()) {
            missing.push("time_period");
        }
        if self.phi_level.is_none() {
            missing.push("phi_level");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    pub fn minimum_cohort_size(&self) -> u64 {
        self.minimum_cohort_size.unwrap_or(DEFAULT_MINIMUM_COHORT_SIZE)
    }

    /// Fill empty fields of `self` from `other`; values already present win.
    pub fn fill_from(&mut self, other: Requirements) {
        if self.study_title.is_none() {
            self.study_title = other.study_title;
        }
        if self.inclusion_criteria.is_empty() {
            self.inclusion_criteria = other.inclusion_criteria;
        }
        if self.exclusion_criteria.is_empty() {
            self.exclusion_criteria = other.exclusion_criteria;
        }
        if self.data_elements.is_empty() {
            self.data_elements = other.data_elements;
        }
        if self.time_period.is_none() {
            self.time_period = other.time_period;
        }
        if self.phi_level.is_none() {
            self.phi_level = other.phi_level;
        }
        if self.minimum_cohort_size.is_none() {
            self.minimum_cohort_size = other.minimum_cohort_size;
        }
        if self.irb_number.is_none() {
            self.irb_number = other.irb_number;
        }
    }

    /// Apply a JSON patch object (top-level keys replace).
    pub fn patched(&self, patch: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        super::merge_json(&mut value, patch);
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields() {
        let req = Requirements::default();
        assert_eq!(
            req.missing_fields(),
            vec!["inclusion_criteria", "data_elements", "time_period", "phi_level"]
        );

        let req: Requirements = serde_json::from_value(serde_json::json!({
            "inclusion_criteria": ["diabetes"],
            "data_elements": ["demographics"],
            "time_period": { "start": "2024-01-01", "end": "2024-12-31" },
            "phi_level": "de-identified"
        }))
        .unwrap();
        assert!(req.is_complete());
        assert_eq!(req.phi_level, Some(PhiLevel::DeIdentified));
        assert_eq!(req.minimum_cohort_size(), DEFAULT_MINIMUM_COHORT_SIZE);
    }

    #[test]
    fn test_patch_replaces_top_level_keys() {
        let req = Requirements {
            inclusion_criteria: vec!["diabetes".into()],
            minimum_cohort_size: Some(50),
            ..Default::default()
        };
        let patched = req
            .patched(&serde_json::json!({ "minimum_cohort_size": 20, "exclusion_criteria": ["pregnancy"] }))
            .unwrap();
        assert_eq!(patched.minimum_cohort_size, Some(20));
        assert_eq!(patched.exclusion_criteria, vec!["pregnancy".to_string()]);
        assert_eq!(patched.inclusion_criteria, vec!["diabetes".to_string()]);
    }

    #[test]
    fn test_time_period_contains() {
        let tp = TimePeriod {
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 12, 31),
        };
        assert!(tp.contains(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
        assert!(!tp.contains(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
        assert!(tp.is_bounded());
    }
}
