//! Template-based phenotype SQL generation over the warehouse schema.
//!
//! Free-text criteria are mapped to condition concepts (ICD-10 prefixes and
//! SNOMED codes) or age bounds; anything else falls back to a description
//! match on `conditions`.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

use super::quote_literal;
use crate::models::{Requirements, TimePeriod};

/// Known condition concepts with their code lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionConcept {
    Diabetes,
    Hypertension,
}

impl ConditionConcept {
    pub fn detect(text: &str) -> Option<Self> {
        let t = text.to_lowercase();
        if t.contains("diabet") || t.contains("t2dm") || t.contains("t1dm") {
            Some(Self::Diabetes)
        } else if t.contains("hypertens") || t.contains("high blood pressure") {
            Some(Self::Hypertension)
        } else {
            None
        }
    }

    pub fn icd10_prefixes(&self) -> &'static [&'static str] {
        match self {
            Self::Diabetes => &["E08", "E09", "E10", "E11", "E13"],
            Self::Hypertension => &["I10", "I11", "I12", "I13", "I15"],
        }
    }

    pub fn snomed_codes(&self) -> &'static [&'static str] {
        match self {
            Self::Diabetes => &["44054006", "46635009", "73211009"],
            Self::Hypertension => &["38341003", "59621000"],
        }
    }

    /// Whether a coded condition belongs to this concept.
    pub fn matches_code(&self, code: &str) -> bool {
        let upper = code.trim().to_ascii_uppercase();
        self.icd10_prefixes().iter().any(|p| upper.starts_with(p))
            || self.snomed_codes().iter().any(|c| *c == upper)
    }

    fn sql_predicate(&self, column: &str) -> String {
        let mut parts: Vec<String> = self
            .icd10_prefixes()
            .iter()
            .map(|p| format!("{} LIKE '{}%'", column, p))
            .collect();
        let snomed = self
            .snomed_codes()
            .iter()
            .map(|c| format!("'{}'", c))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("{} IN ({})", column, snomed));
        format!("({})", parts.join(" OR "))
    }
}

/// Inclusive age bounds in whole years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgeRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

impl AgeRange {
    pub fn contains(&self, age: u32) -> bool {
        self.min.map_or(true, |m| age >= m) && self.max.map_or(true, |m| age <= m)
    }
}

static AGE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:age[sd]?|between)\s*(\d{1,3})\s*(?:-|–|to|and)\s*(\d{1,3})")
        .expect("Invalid regex pattern for age ranges")
});
static BARE_AGE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3})\s*(?:-|–|to)\s*(\d{1,3})\s*(?:years|yrs|y/o|year-olds)")
        .expect("Invalid regex pattern for bare age ranges")
});
static AGE_LOWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:over|older than|above|at least|>=|≥|>)\s*(?:age\s*)?(\d{1,3})|(\d{1,3})\s*\+")
        .expect("Invalid regex pattern for lower age bounds")
});
static AGE_UPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:under|younger than|below|at most|<=|≤|<)\s*(?:age\s*)?(\d{1,3})")
        .expect("Invalid regex pattern for upper age bounds")
});

/// Parse an age constraint out of free text.
///
/// Recognises "age 18-65", "aged 40 to 60", "between 30 and 50 years",
/// "over 65", "under 18", "18+", ">= 18", "<= 80".
pub fn parse_age_range(text: &str) -> Option<AgeRange> {
    let t = text.to_lowercase();

    if let Some(c) = AGE_RANGE.captures(&t) {
        let a: u32 = c[1].parse().ok()?;
        let b: u32 = c[2].parse().ok()?;
        return Some(AgeRange {
            min: Some(a.min(b)),
            max: Some(a.max(b)),
        });
    }
    if let Some(c) = BARE_AGE_RANGE.captures(&t) {
        let a: u32 = c[1].parse().ok()?;
        let b: u32 = c[2].parse().ok()?;
        return Some(AgeRange {
            min: Some(a.min(b)),
            max: Some(a.max(b)),
        });
    }

    if let Some(c) = AGE_LOWER.captures(&t) {
        let strict = c.get(0).map_or(false, |m| {
            let s = m.as_str();
            (s.starts_with("over") || s.starts_with("older") || s.starts_with("above") || s.starts_with('>'))
                && !s.starts_with(">=")
        });
        let n: u32 = c.get(1).or_else(|| c.get(2))?.as_str().parse().ok()?;
        return Some(AgeRange {
            min: Some(if strict { n + 1 } else { n }),
            max: None,
        });
    }

    if let Some(c) = AGE_UPPER.captures(&t) {
        let s = c.get(0).map_or("", |m| m.as_str());
        let n: u32 = c[1].parse().ok()?;
        let inclusive = s.starts_with("<=") || s.starts_with('≤') || s.starts_with("at most");
        return Some(AgeRange {
            min: None,
            max: Some(if inclusive { n } else { n.saturating_sub(1) }),
        });
    }
    None
}

/// Whole years between `birth` and `on`.
pub fn age_on(birth: NaiveDate, on: NaiveDate) -> u32 {
    use chrono::Datelike;
    let mut years = on.year() - birth.year();
    if (on.month(), on.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

/// How one criterion was interpreted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionMatch {
    /// A condition concept, optionally limited to an age band
    /// ("diabetes patients over 65").
    Concept {
        text: String,
        concept: ConditionConcept,
        #[serde(skip_serializing_if = "Option::is_none")]
        age: Option<AgeRange>,
    },
    Age { text: String, range: AgeRange },
    Description { text: String },
}

impl CriterionMatch {
    pub fn interpret(text: &str) -> Self {
        let text_owned = text.trim().to_string();
        if let Some(concept) = ConditionConcept::detect(text) {
            return Self::Concept {
                text: text_owned,
                concept,
                age: parse_age_range(text),
            };
        }
        if let Some(range) = parse_age_range(text) {
            return Self::Age {
                text: text_owned,
                range,
            };
        }
        Self::Description { text: text_owned }
    }
}

/// Generated cohort SQL plus how it was derived.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhenotypeQuery {
    pub cohort_sql: String,
    pub count_sql: String,
    pub inclusion: Vec<CriterionMatch>,
    pub exclusion: Vec<CriterionMatch>,
    /// Date ages are computed against.
    pub reference_date: Option<NaiveDate>,
}

impl PhenotypeQuery {
    pub fn generate(requirements: &Requirements) -> Self {
        let inclusion: Vec<CriterionMatch> = requirements
            .inclusion_criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| CriterionMatch::interpret(c))
            .collect();
        let exclusion: Vec<CriterionMatch> = requirements
            .exclusion_criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| CriterionMatch::interpret(c))
            .collect();
        let period = requirements.time_period.unwrap_or_default();
        let reference_date = period.end;
        let age_ref = reference_date
            .map(|d| quote_literal(&d.to_string()))
            .unwrap_or_else(|| "'now'".to_string());

        let mut clauses = Vec::new();
        for m in &inclusion {
            clauses.push(criterion_clause(m, &period, &age_ref, false));
        }
        for m in &exclusion {
            clauses.push(criterion_clause(m, &TimePeriod::default(), &age_ref, true));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("\nWHERE {}", clauses.join("\n  AND "))
        };
        let cohort_sql = format!("SELECT DISTINCT p.patient_id\nFROM patients p{}", where_sql);
        let count_sql = format!("SELECT COUNT(*) AS cohort_count FROM ({})", cohort_sql);

        Self {
            cohort_sql,
            count_sql,
            inclusion,
            exclusion,
            reference_date,
        }
    }
}

fn criterion_clause(m: &CriterionMatch, period: &TimePeriod, age_ref: &str, negate: bool) -> String {
    let clause = match m {
        CriterionMatch::Age { range, .. } => age_clause(range, age_ref),
        CriterionMatch::Concept { concept, age, .. } => {
            let exists = condition_exists(&concept.sql_predicate("c.code"), period);
            match age {
                Some(range) => format!("({} AND {})", age_clause(range, age_ref), exists),
                None => exists,
            }
        }
        CriterionMatch::Description { text } => {
            let pattern = quote_literal(&like_contains(text));
            condition_exists(
                &format!("lower(c.description) LIKE {} ESCAPE '\\'", pattern),
                period,
            )
        }
    };
    if negate {
        format!("NOT {}", clause)
    } else {
        clause
    }
}

/// Whole years on `age_ref`, computed the same way as [`age_on`].
fn age_clause(range: &AgeRange, age_ref: &str) -> String {
    let age = format!(
        "(CAST(strftime('%Y', {r}) AS INTEGER) - CAST(strftime('%Y', p.birth_date) AS INTEGER) \
         - (strftime('%m-%d', {r}) < strftime('%m-%d', p.birth_date)))",
        r = age_ref
    );
    let mut parts = vec!["p.birth_date IS NOT NULL".to_string()];
    if let Some(min) = range.min {
        parts.push(format!("{} >= {}", age, min));
    }
    if let Some(max) = range.max {
        parts.push(format!("{} <= {}", age, max));
    }
    format!("({})", parts.join(" AND "))
}

/// `%text%` with LIKE wildcards in `text` escaped by `\`.
fn like_contains(text: &str) -> String {
    let mut pattern = String::from("%");
    for ch in text.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn condition_exists(predicate: &str, period: &TimePeriod) -> String {
    let mut parts = vec!["c.patient_id = p.patient_id".to_string(), predicate.to_string()];
    if let Some(start) = period.start {
        parts.push(format!("c.onset_date >= {}", quote_literal(&start.to_string())));
    }
    if let Some(end) = period.end {
        parts.push(format!("c.onset_date <= {}", quote_literal(&end.to_string())));
    }
    format!("EXISTS (SELECT 1 FROM conditions c WHERE {})", parts.join(" AND "))
}
