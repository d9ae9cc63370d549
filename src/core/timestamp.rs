//! Nanosecond-precision capture timestamp.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in time, stored as nanoseconds since the Unix epoch.
///
/// This is the unit the writer and query executor order events by. It is
/// monotonic-non-decreasing *within* a partition (the writer enforces this,
/// see `writer::Writer`), but carries no ordering guarantee across
/// partitions beyond the timestamp value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    nanos: i64,
}

impl Timestamp {
    pub const MIN: Timestamp = Timestamp { nanos: i64::MIN };
    pub const MAX: Timestamp = Timestamp { nanos: i64::MAX };

    pub fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    pub fn from_secs(secs: i64) -> Self {
        Self {
            nanos: secs * 1_000_000_000,
        }
    }

    /// Current wall-clock time. Used by demo/test code paths; the writer
    /// itself always uses the timestamp the source supplied.
    pub fn now() -> Self {
        Self {
            nanos: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    pub fn as_secs(&self) -> i64 {
        self.nanos.div_euclid(1_000_000_000)
    }

    /// Whether this timestamp is strictly positive, as the ingestion
    /// invariant requires.
    pub fn is_positive(&self) -> bool {
        self.nanos > 0
    }

    /// The next representable nanosecond. Used by the writer to adjust a
    /// non-monotonic timestamp forward without losing the event.
    pub fn next(&self) -> Self {
        Self {
            nanos: self.nanos.saturating_add(1),
        }
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(
            self.as_secs(),
            self.nanos.rem_euclid(1_000_000_000) as u32,
        )
        .unwrap_or_else(Utc::now)
    }

    /// UTC hour bucket this timestamp belongs to: `(year, month, day, hour)`.
    ///
    /// An event timestamped exactly at `HH:00:00.000000000` belongs to the
    /// hour starting there, not the previous one.
    pub fn hour_bucket(&self) -> (i32, u32, u32, u32) {
        let dt = self.to_datetime();
        (dt.format("%Y").to_string().parse().unwrap_or(1970), dt.month(), dt.day(), dt.hour())
    }

    /// Start of this timestamp's UTC hour, as nanoseconds since epoch.
    pub fn hour_start_nanos(&self) -> i64 {
        let dt = self.to_datetime();
        let truncated = dt
            .date_naive()
            .and_hms_opt(dt.hour(), 0, 0)
            .expect("hour is always in range 0..24");
        DateTime::<Utc>::from_naive_utc_and_offset(truncated, Utc)
            .timestamp_nanos_opt()
            .unwrap_or(0)
    }

    /// End of this timestamp's UTC hour (exclusive), as nanoseconds since
    /// epoch.
    pub fn hour_end_nanos(&self) -> i64 {
        self.hour_start_nanos() + 3_600_000_000_000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_round_trip() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_456_789);
        assert_eq!(ts.as_nanos(), 1_700_000_000_123_456_789);
    }

    #[test]
    fn next_advances_by_one_nanosecond() {
        let ts = Timestamp::from_nanos(100);
        assert_eq!(ts.next().as_nanos(), 101);
    }

    #[test]
    fn ordering_is_nanosecond_precise() {
        let a = Timestamp::from_nanos(1);
        let b = Timestamp::from_nanos(2);
        assert!(a < b);
    }

    #[test]
    fn hour_boundary_lands_in_later_partition() {
        // 2023-11-14T22:13:20Z, an arbitrary instant.
        let ts = Timestamp::from_secs(1_700_000_000);
        let start = ts.hour_start_nanos();
        let end = ts.hour_end_nanos();
        assert!(ts.as_nanos() >= start && ts.as_nanos() < end);

        // A timestamp exactly at an hour boundary belongs to the hour
        // that starts there, not the one before it.
        let boundary = Timestamp::from_nanos(start);
        assert_eq!(boundary.hour_start_nanos(), start);
    }

    #[test]
    fn is_positive_rejects_zero_and_negative() {
        assert!(!Timestamp::from_nanos(0).is_positive());
        assert!(!Timestamp::from_nanos(-1).is_positive());
        assert!(Timestamp::from_nanos(1).is_positive());
    }
}
