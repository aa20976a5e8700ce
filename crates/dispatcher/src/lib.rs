//! # Dispatcher
//!
//! Asynchronous log pipeline.
//!
//! Responsibilities:
//! - Admit records from any producer thread into a bounded queue
//! - Fan batches out to every registered sink from one dispatch thread
//! - Isolate failing or slow sinks so producers never block on I/O

pub mod builder;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod sinks;
pub mod worker;

pub use builder::{Pipeline, PipelineBuilder, PipelineReport};
pub use contracts::{LogRecord, LogSink, RecordFields};
pub use dispatcher::Logger;
pub use error::DispatcherError;
pub use metrics::SinkMetrics;
pub use registry::{SinkId, SinkRegistry};
pub use scheduler::TokioScheduler;
pub use sinks::{
    EventFacility, EventSeverity, EventSink, FacilityError, FileFacility, FileSink,
    SyslogFacility, TraceSink,
};
pub use worker::{JoinOutcome, Worker};
