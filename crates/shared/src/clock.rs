//! Central time normalization
//!
//! The payment processor reports instants as unix timestamps and legacy rows
//! may hold timezone-naive datetimes. Everything is converted to UTC-offset
//! `OffsetDateTime` here, once, so no comparison elsewhere ever mixes naive
//! and aware values.

use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Convert an external unix timestamp to a UTC instant.
///
/// Returns `None` for absent or out-of-range values rather than erroring;
/// processor payloads routinely omit period fields.
pub fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Like [`from_unix`] but for optional payload fields.
pub fn from_unix_opt(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(from_unix)
}

/// Interpret a timezone-naive persisted datetime as UTC.
pub fn assume_utc(dt: PrimitiveDateTime) -> OffsetDateTime {
    dt.assume_utc()
}

/// Canonicalize an aware instant to UTC offset.
///
/// Comparisons between `OffsetDateTime`s are offset-correct either way, but
/// normalizing keeps persisted and logged values uniform.
pub fn to_utc(dt: OffsetDateTime) -> OffsetDateTime {
    dt.to_offset(UtcOffset::UTC)
}
