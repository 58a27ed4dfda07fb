//! Background services for job execution
//!
//! - [`SchedulerService`]: poll loop claiming and executing due jobs
//! - [`HeartbeatSweeper`]: rescues executions whose heartbeat went silent
//!
//! Both follow the same runtime rules:
//! - Explicit lifecycle management (start/stop)
//! - Join handles for spawned tasks
//! - Cancellation token support
//! - Timeouts on shutdown

pub mod heartbeat_sweeper;
pub mod scheduler_service;
mod task;

pub use heartbeat_sweeper::{HeartbeatSweeper, SweepReport};
pub use scheduler_service::{SchedulerService, DEFAULT_SHUTDOWN_GRACE};
