//! Aggregation periods and their time buckets.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown aggregation period {0:?}")]
pub struct ParsePeriodError(pub String);

/// Length of an aggregate's time bucket. The suffix is appended to the
/// aggregate's metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "yearly")]
    Yearly,
}

impl Period {
    pub const ALL: [Period; 5] = [
        Period::FiveMinutes,
        Period::Hourly,
        Period::Daily,
        Period::Monthly,
        Period::Yearly,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Period::FiveMinutes => "5min",
            Period::Hourly => "hourly",
            Period::Daily => "daily",
            Period::Monthly => "monthly",
            Period::Yearly => "yearly",
        }
    }

    /// Start of the bucket containing `dt`.
    pub fn truncate(self, dt: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Period::FiveMinutes => truncate_to_window(dt, 300),
            Period::Hourly => truncate_to_window(dt, 3600),
            Period::Daily => truncate_to_window(dt, 86400),
            Period::Monthly => month_start(dt.year(), dt.month()).unwrap_or(dt),
            Period::Yearly => month_start(dt.year(), 1).unwrap_or(dt),
        }
    }

    /// Start of the bucket following the one that starts at `start`.
    pub fn next_bucket_start(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.truncate(start);
        match self {
            Period::FiveMinutes => start + ChronoDuration::minutes(5),
            Period::Hourly => start + ChronoDuration::hours(1),
            Period::Daily => start + ChronoDuration::days(1),
            Period::Monthly => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                month_start(year, month).unwrap_or(start)
            }
            Period::Yearly => month_start(start.year() + 1, 1).unwrap_or(start),
        }
    }

    /// `[start, end)` of the bucket containing `dt`.
    pub fn bucket_bounds(self, dt: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.truncate(dt);
        (start, self.next_bucket_start(start))
    }

    /// Label of the bucket containing `dt`; stable for any instant in the bucket.
    pub fn bucket_label(self, dt: DateTime<Utc>) -> String {
        let start = self.truncate(dt);
        let fmt = match self {
            Period::FiveMinutes => "%Y-%m-%d %H:%M",
            Period::Hourly => "%Y-%m-%d %H:00",
            Period::Daily => "%Y-%m-%d",
            Period::Monthly => "%Y-%m",
            Period::Yearly => "%Y",
        };
        start.format(fmt).to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for Period {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5min" | "5m" | "five_minutes" => Ok(Period::FiveMinutes),
            "hourly" | "hour" | "1h" => Ok(Period::Hourly),
            "daily" | "day" | "1d" => Ok(Period::Daily),
            "monthly" | "month" => Ok(Period::Monthly),
            "yearly" | "year" => Ok(Period::Yearly),
            other => Err(ParsePeriodError(other.to_string())),
        }
    }
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_truncate_to_window() {
        // 2024-01-01 12:34:56 truncated to 60s window = 12:34:00
        let dt = at(2024, 1, 1, 12, 34, 56);
        assert_eq!(truncate_to_window(dt, 60), at(2024, 1, 1, 12, 34, 0));

        // 12:34:56 truncated to 300s (5m) window = 12:30:00
        assert_eq!(truncate_to_window(dt, 300), at(2024, 1, 1, 12, 30, 0));

        // 12:34:56 truncated to 3600s (1h) window = 12:00:00
        assert_eq!(truncate_to_window(dt, 3600), at(2024, 1, 1, 12, 0, 0));
    }

    #[test]
    fn test_bucket_labels() {
        let dt = at(2024, 3, 15, 12, 34, 56);
        assert_eq!(Period::FiveMinutes.bucket_label(dt), "2024-03-15 12:30");
        assert_eq!(Period::Hourly.bucket_label(dt), "2024-03-15 12:00");
        assert_eq!(Period::Daily.bucket_label(dt), "2024-03-15");
        assert_eq!(Period::Monthly.bucket_label(dt), "2024-03");
        assert_eq!(Period::Yearly.bucket_label(dt), "2024");
    }

    #[test]
    fn test_labels_are_stable_within_bucket() {
        let first = at(2024, 3, 15, 0, 0, 0);
        let last = at(2024, 3, 15, 23, 59, 59);
        assert_eq!(Period::Daily.bucket_label(first), Period::Daily.bucket_label(last));
        assert_ne!(
            Period::FiveMinutes.bucket_label(at(2024, 3, 15, 12, 4, 59)),
            Period::FiveMinutes.bucket_label(at(2024, 3, 15, 12, 5, 0))
        );
    }

    #[test]
    fn test_bucket_bounds_cross_calendar_edges() {
        let (start, end) = Period::Monthly.bucket_bounds(at(2024, 12, 31, 23, 0, 0));
        assert_eq!(start, at(2024, 12, 1, 0, 0, 0));
        assert_eq!(end, at(2025, 1, 1, 0, 0, 0));

        let (start, end) = Period::Monthly.bucket_bounds(at(2024, 2, 10, 0, 0, 0));
        assert_eq!(start, at(2024, 2, 1, 0, 0, 0));
        assert_eq!(end, at(2024, 3, 1, 0, 0, 0));

        let (start, end) = Period::Yearly.bucket_bounds(at(2024, 6, 1, 0, 0, 0));
        assert_eq!(start, at(2024, 1, 1, 0, 0, 0));
        assert_eq!(end, at(2025, 1, 1, 0, 0, 0));

        let (start, end) = Period::FiveMinutes.bucket_bounds(at(2024, 1, 1, 23, 58, 0));
        assert_eq!(start, at(2024, 1, 1, 23, 55, 0));
        assert_eq!(end, at(2024, 1, 2, 0, 0, 0));
    }

    #[test]
    fn test_parse_and_suffix() {
        for period in Period::ALL {
            assert_eq!(period.suffix().parse::<Period>(), Ok(period));
        }
        assert_eq!("Daily".parse::<Period>(), Ok(Period::Daily));
        assert!("weekly".parse::<Period>().is_err());
    }
}
