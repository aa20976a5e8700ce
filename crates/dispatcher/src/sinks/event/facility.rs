//! OS structured-event facilities
//!
//! An [`EventFacility`] is the handle an [`super::EventSink`] reports to. The
//! sink owns retry policy; facilities only classify their failures.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use contracts::{FacilityConfig, LogLevel};
use thiserror::Error;

/// Event type recorded by the facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Information,
    Warning,
    Error,
}

impl From<LogLevel> for EventSeverity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace | LogLevel::Debug | LogLevel::Info => EventSeverity::Information,
            LogLevel::Warn => EventSeverity::Warning,
            LogLevel::Error | LogLevel::Critical => EventSeverity::Error,
        }
    }
}

impl EventSeverity {
    /// RFC 5424 severity code
    pub fn syslog_code(self) -> u8 {
        match self {
            EventSeverity::Information => 6,
            EventSeverity::Warning => 4,
            EventSeverity::Error => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Information => "INFO",
            EventSeverity::Warning => "WARNING",
            EventSeverity::Error => "ERROR",
        }
    }
}

/// Facility failure, classified for the retry policy
#[derive(Debug, Error)]
pub enum FacilityError {
    /// No handle yet; registration may succeed on a later attempt
    #[error("event source not registered")]
    NotRegistered,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The facility does not exist or refuses connections
    #[error("facility unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FacilityError {
    /// Classify an I/O error raised while talking to the facility
    pub fn from_io(error: io::Error) -> Self {
        match error.kind() {
            ErrorKind::PermissionDenied => FacilityError::PermissionDenied(error.to_string()),
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                FacilityError::Unavailable(error.to_string())
            }
            _ => FacilityError::Io(error),
        }
    }

    /// Fatal errors abandon the record instead of retrying it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FacilityError::PermissionDenied(_) | FacilityError::Unavailable(_)
        )
    }
}

/// Destination for event records
pub trait EventFacility: Send {
    /// Short description for diagnostics
    fn describe(&self) -> String;

    /// Acquire a handle for `source`; may be called again after a failure
    fn register(&mut self, source: &str) -> Result<(), FacilityError>;

    /// Deliver one payload
    fn report(&mut self, severity: EventSeverity, payload: &str) -> Result<(), FacilityError>;

    /// Release the handle; reporting fails with `NotRegistered` afterwards
    fn deregister(&mut self);

    fn is_registered(&self) -> bool;
}

/// Build the facility described by `config`
pub fn open_facility(config: &FacilityConfig) -> Box<dyn EventFacility> {
    match config {
        FacilityConfig::Syslog { socket } => Box::new(SyslogFacility::new(socket.clone())),
        FacilityConfig::File { path } => Box::new(FileFacility::new(path.clone())),
    }
}

/// Local syslog daemon reached over a unix datagram socket
///
/// Messages use RFC 3164 framing: `<PRI>TAG[PID]: MSG` with the `user`
/// facility.
pub struct SyslogFacility {
    socket_path: PathBuf,
    tag: String,
    #[cfg(unix)]
    socket: Option<std::os::unix::net::UnixDatagram>,
}

/// syslog `user` facility
const SYSLOG_FACILITY_USER: u8 = 1;

impl SyslogFacility {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            tag: String::new(),
            #[cfg(unix)]
            socket: None,
        }
    }

    /// Frame one message
    pub fn frame(&self, severity: EventSeverity, payload: &str) -> String {
        let priority = SYSLOG_FACILITY_USER * 8 + severity.syslog_code();
        format!(
            "<{priority}>{}[{}]: {payload}",
            self.tag,
            std::process::id()
        )
    }
}

#[cfg(unix)]
impl EventFacility for SyslogFacility {
    fn describe(&self) -> String {
        format!("syslog:{}", self.socket_path.display())
    }

    fn register(&mut self, source: &str) -> Result<(), FacilityError> {
        use std::os::unix::net::UnixDatagram;

        self.tag = source.to_string();
        let socket = UnixDatagram::unbound().map_err(FacilityError::from_io)?;
        socket
            .connect(&self.socket_path)
            .map_err(FacilityError::from_io)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn report(&mut self, severity: EventSeverity, payload: &str) -> Result<(), FacilityError> {
        let message = self.frame(severity, payload);
        let socket = self.socket.as_ref().ok_or(FacilityError::NotRegistered)?;
        socket
            .send(message.as_bytes())
            .map(|_| ())
            .map_err(FacilityError::from_io)
    }

    fn deregister(&mut self) {
        self.socket = None;
    }

    fn is_registered(&self) -> bool {
        self.socket.is_some()
    }
}

#[cfg(not(unix))]
impl EventFacility for SyslogFacility {
    fn describe(&self) -> String {
        format!("syslog:{}", self.socket_path.display())
    }

    fn register(&mut self, source: &str) -> Result<(), FacilityError> {
        self.tag = source.to_string();
        Err(FacilityError::Unavailable(
            "syslog sockets are not supported on this platform".to_string(),
        ))
    }

    fn report(&mut self, _severity: EventSeverity, _payload: &str) -> Result<(), FacilityError> {
        Err(FacilityError::NotRegistered)
    }

    fn deregister(&mut self) {}

    fn is_registered(&self) -> bool {
        false
    }
}

/// Append-only event file, for hosts without a structured-log facility
///
/// Each event is one line: `<UTC timestamp> <SEVERITY> <source>: <payload>`.
pub struct FileFacility {
    path: PathBuf,
    source: String,
    file: Option<File>,
}

impl FileFacility {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: String::new(),
            file: None,
        }
    }
}

impl EventFacility for FileFacility {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn register(&mut self, source: &str) -> Result<(), FacilityError> {
        self.source = source.to_string();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(FacilityError::from_io)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(FacilityError::from_io)?;
        self.file = Some(file);
        Ok(())
    }

    fn report(&mut self, severity: EventSeverity, payload: &str) -> Result<(), FacilityError> {
        let file = self.file.as_mut().ok_or(FacilityError::NotRegistered)?;
        let line = format!(
            "{} {} {}: {payload}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            severity.as_str(),
            self.source
        );
        file.write_all(line.as_bytes())
            .map_err(FacilityError::from_io)
    }

    fn deregister(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.sync_data();
        }
    }

    fn is_registered(&self) -> bool {
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(EventSeverity::from(LogLevel::Debug), EventSeverity::Information);
        assert_eq!(EventSeverity::from(LogLevel::Warn), EventSeverity::Warning);
        assert_eq!(EventSeverity::from(LogLevel::Critical), EventSeverity::Error);
    }

    #[test]
    fn test_error_classification() {
        assert!(FacilityError::from_io(io::Error::from(ErrorKind::PermissionDenied)).is_fatal());
        assert!(FacilityError::from_io(io::Error::from(ErrorKind::NotFound)).is_fatal());
        assert!(!FacilityError::from_io(io::Error::from(ErrorKind::WouldBlock)).is_fatal());
        assert!(!FacilityError::NotRegistered.is_fatal());
    }

    #[test]
    fn test_syslog_framing() {
        let mut facility = SyslogFacility::new("/nonexistent/reglog.sock");
        let _ = facility.register("reglog");
        let framed = facility.frame(EventSeverity::Warning, "hello");
        assert_eq!(framed, format!("<12>reglog[{}]: hello", std::process::id()));
    }

    #[test]
    fn test_syslog_missing_socket_is_fatal() {
        let mut facility = SyslogFacility::new("/nonexistent/reglog.sock");
        let err = facility.register("reglog").unwrap_err();
        assert!(err.is_fatal());
        assert!(!facility.is_registered());
        assert!(matches!(
            facility.report(EventSeverity::Information, "x"),
            Err(FacilityError::NotRegistered)
        ));
    }

    #[test]
    fn test_file_facility_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events").join("events.log");
        let mut facility = FileFacility::new(&path);

        assert!(matches!(
            facility.report(EventSeverity::Information, "early"),
            Err(FacilityError::NotRegistered)
        ));
        facility.register("reglog").unwrap();
        facility.report(EventSeverity::Error, "boom").unwrap();
        facility.deregister();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with(" ERROR reglog: boom\n"));
    }
}
