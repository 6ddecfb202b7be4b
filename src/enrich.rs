use chrono::{Datelike, Duration, Timelike, Weekday};

use crate::category::CategoryPath;
use crate::error::DataAnomaly;
use crate::expand::Occurrence;
use crate::rules::ParsingRules;

/// An occurrence with everything the dataset needs derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedRecord {
    pub occurrence: Occurrence,
    pub path: CategoryPath,
    /// Rounded to the nearest minute, never negative.
    pub duration_minutes: i64,
    /// Of the local start.
    pub weekday: Weekday,
    pub is_weekend: bool,
    /// Local start hour, 0 to 23.
    pub hour_bucket: u32,
    pub is_focus_session: bool,
}

/// Derive the per-record fields. An occurrence that ends before it starts is
/// clamped to zero length and the anomaly handed back to the caller.
pub fn enrich(
    occurrence: Occurrence,
    path: CategoryPath,
    rules: &ParsingRules,
) -> (EnrichedRecord, Option<DataAnomaly>) {
    let raw = occurrence.end - occurrence.start;

    let (duration, anomaly) = if raw < Duration::zero() {
        let anomaly = DataAnomaly::NegativeDuration {
            uid: occurrence.uid.clone(),
            start: occurrence.start,
            minutes: (-raw).num_minutes(),
        };
        (Duration::zero(), Some(anomaly))
    } else {
        (raw, None)
    };

    let weekday = occurrence.start.weekday();
    let is_focus_session = rules.focus.matches(duration, path.category());

    let record = EnrichedRecord {
        duration_minutes: (duration.num_seconds() + 30) / 60,
        weekday,
        is_weekend: rules.is_weekend(weekday),
        hour_bucket: occurrence.start.hour(),
        is_focus_session,
        occurrence,
        path,
    };

    (record, anomaly)
}
