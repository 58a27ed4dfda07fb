//! # Cadence Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - The key-value store backing every `cadence-core` store trait
//! - Background loops for polling and heartbeat sweeping
//! - Configuration loading and logging setup
//! - The runtime context that wires a node together
//!
//! ## Architecture
//! - Implements traits defined in `cadence-core`
//! - Depends on `cadence-common`, `cadence-domain` and `cadence-core`
//! - Contains all "impure" code (I/O, background tasks, global state)

pub mod config;
pub mod kv;
pub mod logging;
pub mod runtime;
pub mod scheduling;

// Re-export commonly used items
pub use kv::{KvBackend, KvError, KvStore, MemoryBackend};
pub use runtime::CadenceRuntime;
pub use scheduling::{HeartbeatSweeper, SchedulerService, SweepReport};
