pub mod approval;
pub mod artifacts;
pub mod audit;
pub mod escalation;
pub mod request;
pub mod requirements;

pub use approval::*;
pub use artifacts::*;
pub use audit::*;
pub use escalation::*;
pub use request::*;
pub use requirements::*;

use chrono::{DateTime, TimeZone, Utc};

/// Shallow-merge `patch` into `target` when both are objects; otherwise
/// `patch` replaces `target`.
pub fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                t.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

pub(crate) fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub(crate) fn opt_millis_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}
