//! Job definitions: cadences, retry policies, trigger outcomes.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use fitpulse_core::{JobName, JobRunId, Period};

use super::error::ScheduleError;

/// Longest accepted `every:<secs>` interval (ten years).
const MAX_EVERY_SECS: u64 = 10 * 365 * 24 * 3600;

/// When a job fires. All wall-clock forms are UTC, on the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval, measured from the previous check.
    Every { secs: u64 },
    Daily { hour: u32 },
    Weekly { weekday: Weekday, hour: u32 },
    /// `day` is limited to 1..=28 so every month has a fire time.
    Monthly { day: u32, hour: u32 },
}

fn at_hour(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
        .and_utc()
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl Cadence {
    pub const HOURLY: Cadence = Cadence::Every { secs: 3600 };

    /// First fire time strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let today = t.date_naive();
        match *self {
            Cadence::Every { secs } => {
                t + chrono::Duration::seconds(secs.clamp(1, MAX_EVERY_SECS) as i64)
            }
            Cadence::Daily { hour } => {
                let candidate = at_hour(today, hour);
                if candidate > t {
                    candidate
                } else {
                    at_hour(today + Days::new(1), hour)
                }
            }
            Cadence::Weekly { weekday, hour } => (0..=7)
                .map(|offset| today + Days::new(offset))
                .filter(|date| date.weekday() == weekday)
                .map(|date| at_hour(date, hour))
                .find(|candidate| *candidate > t)
                .unwrap_or_else(|| at_hour(today + Days::new(7), hour)),
            Cadence::Monthly { day, hour } => {
                let this_month = Period::containing(t);
                [this_month, this_month.succ()]
                    .into_iter()
                    .filter_map(|p| NaiveDate::from_ymd_opt(p.year(), p.month(), day))
                    .map(|date| at_hour(date, hour))
                    .find(|candidate| *candidate > t)
                    .unwrap_or_else(|| t + chrono::Duration::days(28))
            }
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Every { secs } => write!(f, "every:{secs}"),
            Cadence::Daily { hour } => write!(f, "daily:{hour:02}"),
            Cadence::Weekly { weekday, hour } => {
                write!(f, "weekly:{}:{hour:02}", weekday_name(*weekday))
            }
            Cadence::Monthly { day, hour } => write!(f, "monthly:{day}:{hour:02}"),
        }
    }
}

impl FromStr for Cadence {
    type Err = ScheduleError;

    /// `every:<secs>`, `daily:<HH>`, `weekly:<mon..sun>:<HH>`, `monthly:<day>:<HH>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ScheduleError::InvalidCadence(s.to_string(), reason.to_string());
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();

        let hour = |raw: &str| -> Result<u32, ScheduleError> {
            raw.parse::<u32>()
                .ok()
                .filter(|h| *h < 24)
                .ok_or_else(|| invalid("hour must be 0..=23"))
        };

        match parts.as_slice() {
            ["every", secs] => {
                let secs = secs
                    .parse::<u64>()
                    .ok()
                    .filter(|s| (1..=MAX_EVERY_SECS).contains(s))
                    .ok_or_else(|| invalid("interval must be a positive number of seconds"))?;
                Ok(Cadence::Every { secs })
            }
            ["hourly"] => Ok(Cadence::HOURLY),
            ["daily", h] => Ok(Cadence::Daily { hour: hour(h)? }),
            ["weekly", day, h] => {
                let weekday = day
                    .parse::<Weekday>()
                    .map_err(|_| invalid("unknown weekday"))?;
                Ok(Cadence::Weekly {
                    weekday,
                    hour: hour(h)?,
                })
            }
            ["monthly", day, h] => {
                let day = day
                    .parse::<u32>()
                    .ok()
                    .filter(|d| (1..=28).contains(d))
                    .ok_or_else(|| invalid("day of month must be 1..=28"))?;
                Ok(Cadence::Monthly {
                    day,
                    hour: hour(h)?,
                })
            }
            _ => Err(invalid("expected every:<secs>, daily:<HH>, weekly:<day>:<HH> or monthly:<day>:<HH>")),
        }
    }
}

impl Serialize for Cadence {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cadence {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// base * 2^(retry - 1)
    #[default]
    Exponential,
    /// base * retry
    Linear,
}

impl FromStr for BackoffStrategy {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            _ => Err(ScheduleError::InvalidBackoff(s.to_string())),
        }
    }
}

/// Bounded retry of persistence failures inside one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
        };
        delay.min(self.max_delay)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

/// Definition of a scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: JobName,
    pub cadence: Cadence,
    pub retry: RetryPolicy,
}

impl JobSpec {
    pub fn new(name: JobName, cadence: Cadence) -> Self {
        Self {
            name,
            cadence,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Default cadence per job kind.
    pub fn default_cadence(name: JobName) -> Cadence {
        match name {
            JobName::SentimentSweep => Cadence::HOURLY,
            JobName::ForecastRefresh => Cadence::Weekly {
                weekday: Weekday::Mon,
                hour: 8,
            },
            JobName::ForecastGenerate => Cadence::Monthly { day: 1, hour: 6 },
            JobName::LogCleanup => Cadence::Daily { hour: 2 },
        }
    }
}

/// Why a trigger did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyRunning { running_run_id: JobRunId },
}

/// Result of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted { run_id: JobRunId },
    Rejected { reason: RejectReason },
}

impl TriggerOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerOutcome::Accepted { .. })
    }

    pub fn run_id(&self) -> Option<JobRunId> {
        match self {
            TriggerOutcome::Accepted { run_id } => Some(*run_id),
            TriggerOutcome::Rejected { .. } => None,
        }
    }

    /// Turn a rejection into `ScheduleError::OverlapSkipped`.
    pub fn into_result(self, job: JobName) -> Result<JobRunId, ScheduleError> {
        match self {
            TriggerOutcome::Accepted { run_id } => Ok(run_id),
            TriggerOutcome::Rejected {
                reason: RejectReason::AlreadyRunning { running_run_id },
            } => Err(ScheduleError::OverlapSkipped {
                job,
                running_run_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
        };
        assert_eq!(linear.delay_for_retry(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(2, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_retry(1), fixed.delay_for_retry(2));
        assert!(fixed.should_retry(1));
        assert!(!fixed.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn parses_backoff_strategies() {
        assert_eq!("fixed".parse::<BackoffStrategy>().unwrap(), BackoffStrategy::Fixed);
        assert_eq!(" Linear ".parse::<BackoffStrategy>().unwrap(), BackoffStrategy::Linear);
        assert_eq!(
            "exponential".parse::<BackoffStrategy>().unwrap(),
            BackoffStrategy::Exponential
        );
        assert!(matches!(
            "random".parse::<BackoffStrategy>(),
            Err(ScheduleError::InvalidBackoff(_))
        ));
    }

    #[test]
    fn parses_and_displays_cadences() {
        for raw in ["every:90", "daily:02", "weekly:mon:08", "monthly:1:06"] {
            let cadence: Cadence = raw.parse().unwrap();
            assert_eq!(cadence.to_string(), raw);
        }
        assert_eq!("hourly".parse::<Cadence>().unwrap(), Cadence::HOURLY);
        for bad in ["", "daily:24", "weekly:funday:08", "monthly:31:06", "every:0", "cron:* * *"] {
            assert!(bad.parse::<Cadence>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn daily_next_is_strictly_after() {
        let c = Cadence::Daily { hour: 2 };
        assert_eq!(c.next_after(utc(2025, 3, 10, 1, 59)), utc(2025, 3, 10, 2, 0));
        assert_eq!(c.next_after(utc(2025, 3, 10, 2, 0)), utc(2025, 3, 11, 2, 0));
    }

    #[test]
    fn weekly_next_lands_on_the_weekday() {
        let c = Cadence::Weekly {
            weekday: Weekday::Mon,
            hour: 8,
        };
        // 2025-03-10 is a Monday.
        assert_eq!(c.next_after(utc(2025, 3, 10, 7, 0)), utc(2025, 3, 10, 8, 0));
        assert_eq!(c.next_after(utc(2025, 3, 10, 8, 0)), utc(2025, 3, 17, 8, 0));
        assert_eq!(c.next_after(utc(2025, 3, 12, 12, 0)), utc(2025, 3, 17, 8, 0));
    }

    #[test]
    fn monthly_next_rolls_over_years() {
        let c = Cadence::Monthly { day: 1, hour: 6 };
        assert_eq!(c.next_after(utc(2025, 12, 1, 6, 0)), utc(2026, 1, 1, 6, 0));
        assert_eq!(c.next_after(utc(2025, 11, 30, 23, 0)), utc(2025, 12, 1, 6, 0));
        assert_eq!(c.next_after(utc(2025, 12, 1, 5, 0)), utc(2025, 12, 1, 6, 0));
    }

    #[test]
    fn every_adds_the_interval() {
        let t = utc(2025, 1, 1, 0, 0);
        assert_eq!(Cadence::Every { secs: 90 }.next_after(t), t + chrono::Duration::seconds(90));
    }

    fn any_cadence() -> impl Strategy<Value = Cadence> {
        prop_oneof![
            (1u64..200_000).prop_map(|secs| Cadence::Every { secs }),
            (0u32..24).prop_map(|hour| Cadence::Daily { hour }),
            (0usize..7, 0u32..24).prop_map(|(d, hour)| Cadence::Weekly {
                weekday: [
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                    Weekday::Sat,
                    Weekday::Sun,
                ][d],
                hour
            }),
            (1u32..=28, 0u32..24).prop_map(|(day, hour)| Cadence::Monthly { day, hour }),
        ]
    }

    proptest! {
        #[test]
        fn next_after_is_strictly_later_and_bounded(
            cadence in any_cadence(),
            secs in 946_684_800i64..4_102_444_800i64,
        ) {
            let t = DateTime::from_timestamp(secs, 0).unwrap();
            let next = cadence.next_after(t);
            prop_assert!(next > t);
            prop_assert!(next - t <= chrono::Duration::days(32));
            if !matches!(cadence, Cadence::Every { .. }) {
                prop_assert_eq!(next.timestamp() % 3600, 0);
            }
        }
    }

    #[test]
    fn rejection_maps_to_overlap_error() {
        let running = JobRunId::new();
        let outcome = TriggerOutcome::Rejected {
            reason: RejectReason::AlreadyRunning {
                running_run_id: running,
            },
        };
        assert!(!outcome.is_accepted());
        assert!(matches!(
            outcome.into_result(JobName::ForecastGenerate),
            Err(ScheduleError::OverlapSkipped { running_run_id, .. }) if running_run_id == running
        ));
    }
}
