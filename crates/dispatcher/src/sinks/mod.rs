//! Sink implementations
//!
//! Contains FileSink, EventSink, and TraceSink.

mod event;
mod file;
mod trace;

pub use self::event::{
    open_facility, prepare_payload, EventFacility, EventSeverity, EventSink, FacilityError,
    FileFacility, SyslogFacility, TRUNCATION_MARKER,
};
pub use self::file::FileSink;
pub use self::trace::TraceSink;
