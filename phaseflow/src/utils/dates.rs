//! Date partition helpers.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{PhaseflowError, Result};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// An inclusive range of partition dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    /// First date (inclusive).
    pub start: NaiveDate,
    /// Last date (inclusive).
    pub end: NaiveDate,
}

impl DateRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(PhaseflowError::configuration(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// A range covering one date.
    #[must_use]
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Number of dates in the range.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }

    /// Always false; a valid range holds at least one date.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `date` falls inside the range.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Iterates the dates in ascending order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// The range `lookback` days ending on `date`.
    #[must_use]
    pub fn trailing(date: NaiveDate, lookback: u32) -> Self {
        let start = date
            .checked_sub_days(Days::new(u64::from(lookback)))
            .unwrap_or(date);
        Self { start, end: date }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Parses a `YYYY-MM-DD` partition date.
pub fn parse_date(input: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| PhaseflowError::configuration(format!("invalid date '{input}': {e}")))
}

/// Midnight UTC at the start of `date`.
#[must_use]
pub fn start_of_day(date: NaiveDate) -> Timestamp {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Midnight UTC at the end of `date` (the start of the following day).
#[must_use]
pub fn end_of_day(date: NaiveDate) -> Timestamp {
    start_of_day(date.succ_opt().unwrap_or(date))
}

/// Returns the current UTC time as an ISO 8601 formatted string.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_range_iteration() {
        let range = DateRange::new(d("2024-02-27"), d("2024-03-01")).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days, vec![d("2024-02-27"), d("2024-02-28"), d("2024-02-29"), d("2024-03-01")]);
        assert_eq!(range.len(), 4);
        assert!(range.contains(d("2024-02-29")));
        assert!(!range.contains(d("2024-03-02")));
    }

    #[test]
    fn test_range_rejects_inverted() {
        assert!(DateRange::new(d("2024-03-02"), d("2024-03-01")).is_err());
    }

    #[test]
    fn test_trailing_and_display() {
        let range = DateRange::trailing(d("2024-01-03"), 2);
        assert_eq!(range.start, d("2024-01-01"));
        assert_eq!(range.to_string(), "2024-01-01..2024-01-03");
        assert_eq!(DateRange::single(d("2024-01-03")).to_string(), "2024-01-03");
    }

    #[test]
    fn test_day_bounds() {
        let date = d("2024-01-31");
        assert_eq!(start_of_day(date).to_rfc3339(), "2024-01-31T00:00:00+00:00");
        assert_eq!(end_of_day(date).to_rfc3339(), "2024-02-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_date_errors() {
        assert!(parse_date("2024-13-01").is_err());
        assert!(parse_date("yesterday").is_err());
    }
}
