//! Calendar-month periods.
//!
//! Revenue history and forecasts are keyed by calendar month. `Period` is a
//! total order (year, then month) and serializes as `"YYYY-MM"`.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DomainError, DomainResult};

/// A calendar month.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> DomainResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(DomainError::validation(format!(
                "month must be in 1..=12, got {month}"
            )));
        }
        Ok(Self { year, month })
    }

    /// The month containing `date`.
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The month containing the instant `at` (UTC).
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self::from_date(at.date_naive())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Months since year 0, used for calendar arithmetic.
    fn index(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month - 1)
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// The following calendar month.
    pub fn succ(&self) -> Self {
        self.add_months(1)
    }

    pub fn add_months(&self, months: i64) -> Self {
        Self::from_index(self.index() + months)
    }

    /// Signed number of months from `self` to `other`.
    pub fn months_until(&self, other: Period) -> i64 {
        other.index() - self.index()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .rsplit_once('-')
            .ok_or_else(|| DomainError::validation(format!("period must be YYYY-MM, got {s:?}")))?;
        let year = year
            .parse::<i32>()
            .map_err(|e| DomainError::validation(format!("period year {year:?}: {e}")))?;
        let month = month
            .parse::<u32>()
            .map_err(|e| DomainError::validation(format!("period month {month:?}: {e}")))?;
        Self::new(year, month)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of periods.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRange {
    pub start: Period,
    pub end: Period,
}

impl PeriodRange {
    pub fn new(start: Period, end: Period) -> DomainResult<Self> {
        if end < start {
            return Err(DomainError::validation(format!(
                "period range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// `months` consecutive periods starting at `start`.
    pub fn starting_at(start: Period, months: u32) -> Self {
        Self {
            start,
            end: start.add_months(i64::from(months.max(1)) - 1),
        }
    }

    pub fn contains(&self, period: Period) -> bool {
        self.start <= period && period <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Period {
        s.parse().unwrap()
    }

    #[test]
    fn month_arithmetic_rolls_over_years() {
        assert_eq!(p("2024-12").succ(), p("2025-01"));
        assert_eq!(p("2025-01").add_months(-1), p("2024-12"));
        assert_eq!(p("2025-03").add_months(14), p("2026-05"));
        assert_eq!(p("2024-11").months_until(p("2025-02")), 3);
    }

    #[test]
    fn ordering_is_chronological() {
        assert!(p("2024-12") < p("2025-01"));
        assert!(p("2025-02") > p("2025-01"));
    }

    #[test]
    fn rejects_invalid_months() {
        assert!(Period::new(2025, 0).is_err());
        assert!(Period::new(2025, 13).is_err());
        assert!("2025".parse::<Period>().is_err());
        assert!("2025-xx".parse::<Period>().is_err());
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&p("2025-08")).unwrap();
        assert_eq!(json, "\"2025-08\"");
        let back: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("2025-08"));
    }

    #[test]
    fn range_membership() {
        let range = PeriodRange::starting_at(p("2025-11"), 3);
        assert_eq!(range.end, p("2026-01"));
        assert!(range.contains(p("2025-12")));
        assert!(!range.contains(p("2026-02")));
        assert!(PeriodRange::new(p("2025-02"), p("2025-01")).is_err());
    }
}
