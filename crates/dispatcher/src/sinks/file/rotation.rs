//! Active log file, size-based rotation and retention

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use contracts::FileSinkConfig;
use tracing::{debug, error, warn};

/// Largest single `write` issued to the file
const MAX_WRITE_CHUNK: usize = 1 << 30;

/// Archive timestamp, as rendered into `<base>.<stamp>.log`
const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Open handle the active file is written through
pub(crate) trait LogFile: Write + Send {
    fn sync_data(&self) -> io::Result<()>;

    /// Current length of the underlying file
    fn size(&self) -> io::Result<u64>;
}

impl LogFile for File {
    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Opens the active path for append
pub(crate) type Opener = Box<dyn Fn(&Path) -> io::Result<Box<dyn LogFile>> + Send>;

pub(crate) fn open_append(path: &Path) -> io::Result<Box<dyn LogFile>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

/// Error kinds after which retrying the same buffer is pointless
pub(crate) fn is_fatal(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::PermissionDenied
            | ErrorKind::StorageFull
            | ErrorKind::ReadOnlyFilesystem
            | ErrorKind::FileTooLarge
    )
}

/// Result of writing one buffer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteReport {
    pub bytes: usize,
    pub rotations: u64,
}

/// A write that failed after `report.bytes` of the buffer had landed
#[derive(Debug)]
pub(crate) struct WriteError {
    pub error: io::Error,
    pub report: WriteReport,
}

/// The file currently appended to, plus the state needed to rotate it
pub(crate) struct ActiveFile {
    directory: PathBuf,
    base_name: String,
    path: PathBuf,
    opener: Opener,
    file: Option<Box<dyn LogFile>>,
    bytes: u64,
    max_file_bytes: u64,
    rotate_count: usize,
    sync_before_rotate: bool,
    /// Suffix used when a timestamped archive name is unusable
    serial: u64,
}

impl ActiveFile {
    /// Create the directory if needed and open `<base_name>.log` for append
    pub fn open(config: &FileSinkConfig) -> io::Result<Self> {
        Self::with_opener(config, Box::new(open_append))
    }

    pub fn with_opener(config: &FileSinkConfig, opener: Opener) -> io::Result<Self> {
        fs::create_dir_all(&config.directory)?;
        let mut active = Self {
            directory: config.directory.clone(),
            base_name: config.base_name.clone(),
            path: config.active_path(),
            opener,
            file: None,
            bytes: 0,
            max_file_bytes: config.max_file_bytes,
            rotate_count: config.rotate_count,
            sync_before_rotate: config.fsync_on_flush,
            serial: 0,
        };
        active.reopen()?;
        Ok(active)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the active file as tracked by the writer
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// (Re)open the active path; the byte count resumes from the file's size
    pub fn reopen(&mut self) -> io::Result<()> {
        self.file = None;
        let file = (self.opener)(&self.path)?;
        self.bytes = file.size()?;
        self.file = Some(file);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_data() {
                debug!(path = %self.path.display(), error = %e, "sync on close failed");
            }
        }
    }

    /// Force written data to stable storage
    pub fn sync(&mut self) -> io::Result<()> {
        match self.file.as_ref() {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }

    /// Append `data` in bounded chunks, rotating whenever the active file
    /// reaches `max_file_bytes`
    ///
    /// On failure the error carries how much of `data` already landed, so a
    /// retry can resume from that offset instead of duplicating lines.
    pub fn write(&mut self, data: &[u8]) -> Result<WriteReport, WriteError> {
        let mut report = WriteReport::default();
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            if let Err(error) = self.write_chunk(chunk, &mut report) {
                return Err(WriteError { error, report });
            }
            if self.bytes >= self.max_file_bytes && self.rotate() {
                report.rotations += 1;
            }
        }
        Ok(report)
    }

    fn write_chunk(&mut self, mut chunk: &[u8], report: &mut WriteReport) -> io::Result<()> {
        if self.file.is_none() {
            self.reopen()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "active file not open"))?;

        while !chunk.is_empty() {
            match file.write(chunk) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    self.bytes += n as u64;
                    report.bytes += n;
                    chunk = &chunk[n..];
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Archive the active file and start a fresh one at the same path
    ///
    /// Failures are logged; writing continues into whatever file the active
    /// path refers to afterwards.
    pub fn rotate(&mut self) -> bool {
        if self.sync_before_rotate {
            if let Err(e) = self.sync() {
                warn!(path = %self.path.display(), error = %e, "sync before rotation failed");
            }
        }
        self.file = None;

        let archive = self.archive_path(Utc::now());
        let moved = match fs::rename(&self.path, &archive) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    from = %self.path.display(),
                    to = %archive.display(),
                    error = %e,
                    "rename failed, falling back to copy"
                );
                self.copy_and_truncate(&archive)
            }
        };

        if let Err(e) = self.reopen() {
            error!(path = %self.path.display(), error = %e, "failed to reopen active file after rotation");
        }

        if moved {
            debug!(archive = %archive.display(), "Log file rotated");
            self.enforce_retention();
        }
        moved
    }

    fn copy_and_truncate(&self, archive: &Path) -> bool {
        if let Err(e) = fs::copy(&self.path, archive) {
            error!(to = %archive.display(), error = %e, "rotation copy failed");
            return false;
        }
        if fs::remove_file(&self.path).is_err() {
            // Still in use elsewhere; empty it so the archive is not duplicated
            if let Err(e) = File::create(&self.path) {
                error!(path = %self.path.display(), error = %e, "could not truncate rotated file");
            }
        }
        true
    }

    /// `<base>.<UTC timestamp>.log`, or a serial-suffixed name when the
    /// timestamp cannot be rendered or the name is taken
    pub fn archive_path(&mut self, now: DateTime<Utc>) -> PathBuf {
        let mut stamp = String::new();
        let stamped = write!(stamp, "{}", now.format(ARCHIVE_STAMP_FORMAT)).is_ok();

        if stamped {
            let candidate = self
                .directory
                .join(format!("{}.{}.log", self.base_name, stamp));
            if !candidate.exists() {
                return candidate;
            }
        }

        loop {
            self.serial += 1;
            let name = if stamped {
                format!("{}.{}.{}.log", self.base_name, stamp, self.serial)
            } else {
                format!("{}.{}.log", self.base_name, self.serial)
            };
            let candidate = self.directory.join(name);
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    /// Archives in the directory, oldest first by (modification time, name)
    ///
    /// Only names `archive_path` can produce count; other files sharing the
    /// base name are left alone.
    pub fn archives(&self) -> io::Result<Vec<PathBuf>> {
        let mut found: Vec<(SystemTime, String, PathBuf)> = Vec::new();

        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if path == self.path {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_archive_name(&self.base_name, &name) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, name, path));
        }

        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(found.into_iter().map(|(_, _, path)| path).collect())
    }

    /// Delete all but the newest `rotate_count` archives
    pub fn enforce_retention(&self) -> usize {
        let archives = match self.archives() {
            Ok(archives) => archives,
            Err(e) => {
                warn!(directory = %self.directory.display(), error = %e, "retention scan failed");
                return 0;
            }
        };

        let excess = archives.len().saturating_sub(self.rotate_count);
        let mut removed = 0;
        for path in archives.iter().take(excess) {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Archive removed by retention");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "retention delete failed"),
            }
        }
        removed
    }
}

/// `<base>.<stamp>.log`, `<base>.<stamp>.<serial>.log` or `<base>.<serial>.log`
pub(crate) fn is_archive_name(base_name: &str, name: &str) -> bool {
    let Some(middle) = name
        .strip_prefix(base_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".log"))
    else {
        return false;
    };

    if is_serial(middle) || is_stamp(middle) {
        return true;
    }
    match middle.rsplit_once('.') {
        Some((stamp, serial)) => is_stamp(stamp) && is_serial(serial),
        None => false,
    }
}

fn is_serial(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_stamp(s: &str) -> bool {
    // e.g. 20240301T120000.000Z
    s.len() == 20 && NaiveDateTime::parse_from_str(s, ARCHIVE_STAMP_FORMAT).is_ok()
}

impl Drop for ActiveFile {
    fn drop(&mut self) {
        self.close();
    }
}
