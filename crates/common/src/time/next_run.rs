//! Next/previous run calculation for cron expressions
//!
//! The forward search works in the target time zone's local time and skips
//! whole months, days and hours when the corresponding field cannot match,
//! then advances minute by minute. The backward search only steps one minute
//! at a time: with day-of-month/day-of-week OR semantics, skipping backwards
//! by whole days can jump over a valid instant.
//!
//! Both searches are bounded by an iteration budget (default: one year of
//! minutes) so an expression that can never fire (e.g. `0 0 31 2 *`)
//! terminates with [`ScheduleError::NoNextRun`].

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime,
    NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

use super::cron::CronExpression;

/// One year of minutes
pub const DEFAULT_MAX_ITERATIONS: usize = 366 * 24 * 60;

/// Errors produced while computing run times
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("No next run for '{expression}' within {iterations} iterations")]
    NoNextRun { expression: String, iterations: usize },

    #[error("No previous run for '{expression}' within {iterations} iterations")]
    NoPreviousRun { expression: String, iterations: usize },

    #[error("Invalid time zone: {0}")]
    InvalidTimezone(String),
}

/// Parse an IANA time zone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>().map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Computes matching instants for cron expressions in a given time zone
#[derive(Debug, Clone, Copy)]
pub struct NextRunCalculator {
    max_iterations: usize,
}

impl Default for NextRunCalculator {
    fn default() -> Self {
        Self { max_iterations: DEFAULT_MAX_ITERATIONS }
    }
}

impl NextRunCalculator {
    /// Calculator with the default iteration budget
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculator with a custom iteration budget
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self { max_iterations: max_iterations.max(1) }
    }

    /// Next matching instant strictly after `after`, evaluated in `timezone`
    pub fn next(
        &self,
        expr: &CronExpression,
        after: DateTime<Utc>,
        timezone: &str,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let tz = parse_timezone(timezone)?;
        self.next_in(expr, after, &tz)
    }

    /// Next matching instant strictly after `after` for an already-parsed zone
    pub fn next_in<Z: TimeZone>(
        &self,
        expr: &CronExpression,
        after: DateTime<Utc>,
        tz: &Z,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(tz).naive_local();
        let mut candidate = truncate_to_minute(local) + ChronoDuration::minutes(1);

        for _ in 0..self.max_iterations {
            if !expr.month().contains(candidate.month()) {
                candidate = first_of_next_month(candidate.date());
                continue;
            }
            if !expr.day_matches(&candidate) {
                candidate = midnight(candidate.date() + ChronoDuration::days(1));
                continue;
            }
            if !expr.hour().contains(candidate.hour()) {
                candidate = truncate_to_hour(candidate) + ChronoDuration::hours(1);
                continue;
            }
            if !expr.minute().contains(candidate.minute()) {
                candidate += ChronoDuration::minutes(1);
                continue;
            }

            match resolve_local(tz, candidate) {
                Some(instant) if instant > after => return Ok(instant),
                // Nonexistent local time (DST gap) or an earlier fold
                _ => candidate += ChronoDuration::minutes(1),
            }
        }

        Err(ScheduleError::NoNextRun {
            expression: expr.to_string(),
            iterations: self.max_iterations,
        })
    }

    /// Most recent matching instant strictly before `before`
    pub fn previous(
        &self,
        expr: &CronExpression,
        before: DateTime<Utc>,
        timezone: &str,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let tz = parse_timezone(timezone)?;
        let local = before.with_timezone(&tz).naive_local();
        let truncated = truncate_to_minute(local);
        let mut candidate =
            if truncated == local { truncated - ChronoDuration::minutes(1) } else { truncated };

        for _ in 0..self.max_iterations {
            if expr.matches(&candidate) {
                if let Some(instant) = resolve_local(&tz, candidate) {
                    if instant < before {
                        return Ok(instant);
                    }
                }
            }
            candidate -= ChronoDuration::minutes(1);
        }

        Err(ScheduleError::NoPreviousRun {
            expression: expr.to_string(),
            iterations: self.max_iterations,
        })
    }

    /// The next `count` matching instants after `after`, in order
    pub fn next_n(
        &self,
        expr: &CronExpression,
        after: DateTime<Utc>,
        timezone: &str,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let tz = parse_timezone(timezone)?;
        let mut runs = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            cursor = self.next_in(expr, cursor, &tz)?;
            runs.push(cursor);
        }
        Ok(runs)
    }
}

fn resolve_local<Z: TimeZone>(tz: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

fn truncate_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_time(NaiveTime::from_hms_opt(dt.hour(), dt.minute(), 0).unwrap_or(NaiveTime::MIN))
}

fn truncate_to_hour(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_time(NaiveTime::from_hms_opt(dt.hour(), 0, 0).unwrap_or(NaiveTime::MIN))
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDateTime {
    let (year, month) =
        if date.month() == 12 { (date.year() + 1, 1) } else { (date.year(), date.month() + 1) };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date);
    midnight(first)
}

#[cfg(test)]
mod tests {
    //! Unit tests for time::next_run.
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_next_is_strictly_after() {
        let cron = CronExpression::parse("*/15 * * * *").unwrap();
        let calc = NextRunCalculator::new();

        let t = utc(2024, 1, 1, 10, 15);
        let next = calc.next(&cron, t, "UTC").unwrap();
        assert_eq!(next, utc(2024, 1, 1, 10, 30));

        let again = calc.next(&cron, next, "UTC").unwrap();
        assert!(again > next);
    }

    #[test]
    fn test_next_skips_to_following_month() {
        let cron = CronExpression::parse("0 0 1 * *").unwrap();
        let next = NextRunCalculator::new().next(&cron, utc(2024, 12, 15, 8, 0), "UTC").unwrap();
        assert_eq!(next, utc(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_next_honours_timezone() {
        // 09:00 in New York during EST is 14:00 UTC
        let cron = CronExpression::parse("0 9 * * *").unwrap();
        let next = NextRunCalculator::new()
            .next(&cron, utc(2024, 1, 10, 15, 0), "America/New_York")
            .unwrap();
        assert_eq!(next, utc(2024, 1, 11, 14, 0));
    }

    #[test]
    fn test_leap_day_is_found() {
        let cron = CronExpression::parse("0 12 29 2 *").unwrap();
        let next = NextRunCalculator::new().next(&cron, utc(2025, 3, 1, 0, 0), "UTC").unwrap();
        assert_eq!(next, utc(2028, 2, 29, 12, 0));
    }

    #[test]
    fn test_impossible_date_exhausts() {
        let cron = CronExpression::parse("0 0 31 2 *").unwrap();
        let err = NextRunCalculator::with_max_iterations(10_000)
            .next(&cron, utc(2024, 1, 1, 0, 0), "UTC")
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NoNextRun { iterations: 10_000, .. }));
    }

    #[test]
    fn test_invalid_timezone() {
        let cron = CronExpression::parse("* * * * *").unwrap();
        let err = NextRunCalculator::new().next(&cron, utc(2024, 1, 1, 0, 0), "Mars/Olympus");
        assert_eq!(err, Err(ScheduleError::InvalidTimezone("Mars/Olympus".to_string())));
    }

    #[test]
    fn test_previous_is_strictly_before() {
        let cron = CronExpression::parse("0 * * * *").unwrap();
        let calc = NextRunCalculator::new();
        let previous = calc.previous(&cron, utc(2024, 1, 1, 10, 0), "UTC").unwrap();
        assert_eq!(previous, utc(2024, 1, 1, 9, 0));
        assert_eq!(
            calc.previous(&cron, utc(2024, 1, 1, 10, 0) + ChronoDuration::seconds(5), "UTC")
                .unwrap(),
            utc(2024, 1, 1, 10, 0)
        );
    }

    #[test]
    fn test_previous_respects_day_or_semantics() {
        // The 1st of any month, or any Monday
        let cron = CronExpression::parse("0 0 1 * MON").unwrap();
        // 2024-05-08 is a Wednesday; the latest Monday is 2024-05-06
        let prev = NextRunCalculator::new().previous(&cron, utc(2024, 5, 8, 12, 0), "UTC").unwrap();
        assert_eq!(prev, utc(2024, 5, 6, 0, 0));
    }

    #[test]
    fn test_next_n_is_increasing() {
        let cron = CronExpression::parse("30 8 * * MON-FRI").unwrap();
        // 2024-05-03 is a Friday
        let runs = NextRunCalculator::new().next_n(&cron, utc(2024, 5, 3, 9, 0), "UTC", 3).unwrap();
        assert_eq!(
            runs,
            vec![utc(2024, 5, 6, 8, 30), utc(2024, 5, 7, 8, 30), utc(2024, 5, 8, 8, 30)]
        );
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // 02:30 does not exist in Berlin on 2024-03-31
        let cron = CronExpression::parse("30 2 * * *").unwrap();
        let next = NextRunCalculator::new()
            .next(&cron, utc(2024, 3, 30, 12, 0), "Europe/Berlin")
            .unwrap();
        // Next 02:30 local is 2024-04-01 (CEST, UTC+2)
        assert_eq!(next, utc(2024, 4, 1, 0, 30));
    }
}
