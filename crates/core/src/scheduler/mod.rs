//! Job scheduling
//!
//! Pull-based: every node polls the store for due jobs and races for each
//! scheduled instance through an expiring claim lock. Unique jobs also hold a
//! lock for the length of their execution.

pub mod error;
pub mod schedule;
pub mod service;

pub use error::{SchedulerError, SchedulerResult};
pub use schedule::{ScheduleCalculator, ScheduleExt};
pub use service::{ClaimOutcome, ClaimedJob, JobScheduler, TickReport};
