//! # Contracts
//!
//! Frozen interface contracts shared by every reglog crate: the record model,
//! the sink and scheduler traits, outcome/stat snapshots and the configuration
//! model. Business crates depend on this crate only; reverse dependencies are
//! prohibited.
//!
//! ## Time Model
//! - Record timestamps are wall-clock UTC, captured when the producer calls
//!   `Logger::log`, rendered with millisecond precision
//! - Queue and flush deadlines use the monotonic clock

mod config;
mod error;
mod level;
mod outcome;
mod record;
mod scheduler;
mod sink;
mod stats;

pub use config::*;
pub use error::*;
pub use level::*;
pub use outcome::*;
pub use record::{LogRecord, RecordFields, DEFAULT_SOURCE};
pub use scheduler::{RecurringId, RecurringTask, TaskScheduler};
pub use sink::*;
pub use stats::*;
