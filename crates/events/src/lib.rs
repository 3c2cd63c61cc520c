//! Submission status-change notifications.
//!
//! The job store is the source of truth; messages published here only tell
//! interested parties (the web tier's live stream, tests) that something
//! changed and should be re-read.

pub mod bus;
pub mod in_memory_bus;
pub mod status;

pub use bus::{BusError, EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
pub use status::StatusChanged;
