//! Next-run computation for job schedules

use std::time::Duration;

use cadence_common::time::{parse_timezone, CronExpression, NextRunCalculator};
use cadence_domain::Schedule;
use chrono::{DateTime, Utc};

use super::error::{SchedulerError, SchedulerResult};

/// Turns a [`Schedule`] into concrete `next_run_at` instants
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleCalculator {
    cron: NextRunCalculator,
}

impl ScheduleCalculator {
    pub fn new(cron: NextRunCalculator) -> Self {
        Self { cron }
    }

    /// Reject schedules that can never be evaluated
    pub fn validate(&self, job: &str, schedule: &Schedule) -> SchedulerResult<()> {
        match schedule {
            Schedule::Cron { expression, timezone } => {
                CronExpression::parse(expression)?;
                parse_timezone(timezone)?;
            }
            Schedule::Interval { every_ms: 0 } => {
                return Err(SchedulerError::invalid(job, "interval must be positive"));
            }
            Schedule::Interval { .. } | Schedule::Reboot => {}
        }
        Ok(())
    }

    /// First `next_run_at` for a newly registered job
    ///
    /// Reboot jobs get none; they become due when the scheduler boots.
    pub fn first_run(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match schedule {
            Schedule::Cron { expression, timezone } => {
                let cron = CronExpression::parse(expression)?;
                Ok(Some(self.cron.next(&cron, now, timezone)?))
            }
            Schedule::Interval { every_ms } => Ok(Some(now + interval(*every_ms))),
            Schedule::Reboot => Ok(None),
        }
    }

    /// Regular run following the instance scheduled at `scheduled`
    ///
    /// Instances missed while the job was not claimed are skipped, so the
    /// result is always after `now`. Interval schedules stay anchored on the
    /// previous scheduled instant.
    pub fn next_run(
        &self,
        schedule: &Schedule,
        scheduled: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match schedule {
            Schedule::Cron { .. } => self.first_run(schedule, now),
            Schedule::Interval { every_ms } => {
                let every = interval(*every_ms);
                let anchor = scheduled.unwrap_or(now);
                if anchor > now {
                    return Ok(Some(anchor + every));
                }
                let every_ms = (*every_ms).max(1) as i64;
                let periods = (now - anchor).num_milliseconds() / every_ms + 1;
                Ok(Some(anchor + chrono::Duration::milliseconds(periods * every_ms)))
            }
            Schedule::Reboot => Ok(None),
        }
    }
}

fn interval(every_ms: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_millis(every_ms.max(1)))
        .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX / 2))
}

/// `next_after` directly on a schedule, with the default search budget
pub trait ScheduleExt {
    fn next_after(&self, now: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>>;
}

impl ScheduleExt for Schedule {
    fn next_after(&self, now: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
        ScheduleCalculator::default().first_run(self, now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_cron_first_run_is_next_boundary() {
        let calc = ScheduleCalculator::default();
        let next = calc.first_run(&Schedule::cron("*/15 * * * *"), at(10, 7)).unwrap();
        assert_eq!(next, Some(at(10, 15)));
    }

    #[test]
    fn test_cron_next_run_skips_missed_instances() {
        let calc = ScheduleCalculator::default();
        let schedule = Schedule::cron("*/15 * * * *");
        let next = calc.next_run(&schedule, Some(at(10, 15)), at(11, 2)).unwrap();
        assert_eq!(next, Some(at(11, 15)));
    }

    #[test]
    fn test_interval_is_anchored_on_previous_instant() {
        let calc = ScheduleCalculator::default();
        let schedule = Schedule::every(Duration::from_secs(600));
        assert_eq!(calc.next_run(&schedule, Some(at(10, 0)), at(10, 3)).unwrap(), Some(at(10, 10)));
        // two instances missed
        let next = calc.next_run(&schedule, Some(at(10, 0)), at(10, 25)).unwrap();
        assert_eq!(next, Some(at(10, 30)));
    }

    #[test]
    fn test_reboot_has_no_regular_runs() {
        let calc = ScheduleCalculator::default();
        assert_eq!(calc.first_run(&Schedule::Reboot, at(0, 0)).unwrap(), None);
        assert_eq!(calc.next_run(&Schedule::Reboot, Some(at(0, 0)), at(0, 1)).unwrap(), None);
    }

    #[test]
    fn test_validation() {
        let calc = ScheduleCalculator::default();
        assert!(calc.validate("a", &Schedule::cron("0 6 * * *")).is_ok());
        let short = calc.validate("a", &Schedule::cron("0 6 * *"));
        assert!(matches!(short, Err(SchedulerError::Cron(_))));
        assert!(matches!(
            calc.validate("a", &Schedule::cron_in("0 6 * * *", "Mars/Olympus")),
            Err(SchedulerError::Schedule(_))
        ));
        assert!(matches!(
            calc.validate("a", &Schedule::Interval { every_ms: 0 }),
            Err(SchedulerError::InvalidJob { .. })
        ));
    }

    #[test]
    fn test_next_after_on_schedule() {
        let next = Schedule::cron_in("0 6 * * *", "UTC").next_after(at(7, 0)).unwrap();
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 3, 5, 6, 0, 0).unwrap()));
    }
}
