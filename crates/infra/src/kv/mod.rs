//! Key-value persistence
//!
//! [`KvBackend`] is the narrow port a Redis-style server would implement;
//! [`MemoryBackend`] is the in-process reference backend and [`KvStore`]
//! maps the scheduler and workflow store contract onto either.

pub mod backend;
pub mod error;
pub mod keys;
pub mod memory;
pub mod store;

pub use backend::KvBackend;
pub use error::{KvError, KvResult};
pub use keys::KeyLayout;
pub use memory::MemoryBackend;
pub use store::KvStore;
