//! Time helpers for interval-aligned trend buckets.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn days(&self) -> f64 {
        let secs = self.end.signed_duration_since(self.start).num_seconds().max(0);
        (secs as f64 / 86_400.0).ceil().max(1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    #[default]
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Interval {
    /// Unit name understood by `date_trunc`.
    pub fn unit(self) -> &'static str {
        match self {
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Quarter => "quarter",
            Interval::Year => "year",
        }
    }

    /// Exclusive end of the bucket that starts at `start`.
    pub fn bucket_end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            Interval::Day => start.checked_add_signed(Duration::days(1)),
            Interval::Week => start.checked_add_signed(Duration::days(7)),
            Interval::Month => start.checked_add_months(Months::new(1)),
            Interval::Quarter => start.checked_add_months(Months::new(3)),
            Interval::Year => start.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn label(self, start: DateTime<Utc>) -> String {
        match self {
            Interval::Day => format!("{}-{}-{}", start.day(), start.month(), start.year()),
            Interval::Week => {
                let iso = start.iso_week();
                format!("{}-{}", iso.week(), iso.year())
            }
            Interval::Month => format!("{}-{}", start.month(), start.year()),
            Interval::Quarter => format!("Q{}-{}", (start.month() - 1) / 3 + 1, start.year()),
            Interval::Year => start.year().to_string(),
        }
    }
}

/// A derived trend bucket: never stored, rebuilt from the bucket epoch the database returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBucket {
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

impl TimeBucket {
    pub fn from_epoch(interval: Interval, epoch_secs: i64) -> Result<Self> {
        let start = from_epoch(epoch_secs)?;
        Ok(Self {
            interval,
            start,
            end: interval.bucket_end(start),
            label: interval.label(start),
        })
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

pub fn from_epoch(epoch_secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(epoch_secs, 0).single().ok_or_else(|| {
        ServiceError::validation(format!("timestamp {epoch_secs} is out of range"))
    })
}

/// Window applied to trend aggregations that carry no explicit range on their time column.
/// The window never opens before the Unix epoch, however large the count.
pub fn default_trend_window(now: DateTime<Utc>, across_count: i64) -> TimeRange {
    let start = Duration::try_days(across_count.max(1))
        .and_then(|span| now.checked_sub_signed(span))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |start| start.max(DateTime::<Utc>::UNIX_EPOCH));
    TimeRange { start, end: now }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn labels_follow_interval_conventions() {
        let start = at(2024, 3, 5);
        assert_eq!(Interval::Day.label(start), "5-3-2024");
        assert_eq!(Interval::Month.label(start), "3-2024");
        assert_eq!(Interval::Quarter.label(at(2024, 7, 1)), "Q3-2024");
        assert_eq!(Interval::Year.label(start), "2024");
        // 2024-12-30 is ISO week 1 of 2025.
        assert_eq!(Interval::Week.label(at(2024, 12, 30)), "1-2025");
    }

    #[test]
    fn bucket_end_advances_by_interval() {
        let start = at(2024, 1, 31);
        assert_eq!(Interval::Day.bucket_end(start), at(2024, 2, 1));
        assert_eq!(Interval::Week.bucket_end(start), at(2024, 2, 7));
        assert_eq!(Interval::Month.bucket_end(at(2024, 1, 1)), at(2024, 2, 1));
        assert_eq!(Interval::Quarter.bucket_end(at(2024, 10, 1)), at(2025, 1, 1));
        assert_eq!(Interval::Year.bucket_end(at(2024, 1, 1)), at(2025, 1, 1));
    }

    #[test]
    fn bucket_from_epoch_builds_range_and_label() {
        let bucket = TimeBucket::from_epoch(Interval::Month, at(2024, 2, 1).timestamp())
            .expect("valid epoch");
        assert_eq!(bucket.label, "2-2024");
        assert_eq!(bucket.range().end, at(2024, 3, 1));
    }

    #[test]
    fn default_trend_window_spans_across_count_days() {
        let now = at(2024, 6, 1);
        let window = default_trend_window(now, 90);
        assert_eq!(window.end, now);
        assert_eq!(window.start, now - Duration::days(90));
    }

    #[test]
    fn default_trend_window_saturates_for_huge_counts() {
        let now = at(2024, 6, 1);
        for count in [200_000_000_000, i64::MAX] {
            let window = default_trend_window(now, count);
            assert_eq!(window.start, DateTime::<Utc>::UNIX_EPOCH);
            assert_eq!(window.end, now);
        }
    }

    #[test]
    fn range_days_rounds_up_and_never_returns_zero() {
        let now = at(2024, 6, 1);
        let range = TimeRange {
            start: now - Duration::days(30),
            end: now,
        };
        assert_eq!(range.days(), 30.0);

        let partial = TimeRange {
            start: now - Duration::hours(36),
            end: now,
        };
        assert_eq!(partial.days(), 2.0);

        let empty = TimeRange { start: now, end: now };
        assert_eq!(empty.days(), 1.0);
    }

    #[test]
    fn out_of_range_epoch_is_rejected() {
        assert!(from_epoch(i64::MAX).is_err());
    }
}
