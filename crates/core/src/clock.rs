//! Wall-clock helper.

use chrono::{DateTime, SubsecRound, Utc};

/// Current time truncated to microseconds.
///
/// Stores persist timestamps as fixed-width RFC 3339 text with microsecond
/// precision; truncating here keeps in-memory and persisted values identical.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Latest instant a retry may be scheduled for: `9999-12-31T23:59:59Z`.
///
/// Beyond year 9999 the RFC 3339 text gains a sign prefix and no longer sorts
/// chronologically.
pub fn horizon() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
