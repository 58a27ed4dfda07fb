//! Time utilities and abstractions
//!
//! - **[`clock`]**: Real and mock clocks; every time-dependent component takes
//!   one so tests can drive time explicitly
//! - **[`cron`]**: Five-field cron expression parsing and matching
//! - **[`next_run`]**: Time-zone aware next/previous run calculation
//!
//! ## Usage
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use cadence_common::time::{CronExpression, NextRunCalculator};
//!
//! let cron = CronExpression::parse("*/15 * * * *").unwrap();
//! let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
//! let next = NextRunCalculator::new().next(&cron, after, "UTC").unwrap();
//! assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap());
//! ```

pub mod clock;
pub mod cron;
pub mod next_run;

pub use clock::{Clock, MockClock, SystemClock};
pub use cron::{
    expand_macro, is_reboot_macro, CronExpression, CronFieldKind, CronParseError, FieldValues,
    REBOOT_MACRO,
};
pub use next_run::{parse_timezone, NextRunCalculator, ScheduleError, DEFAULT_MAX_ITERATIONS};
