//! Container log files.
//!
//! Lines written to `<log_dir>/<id>/stdout.log` and `stderr.log` carry an
//! RFC3339 timestamp with nanoseconds, and each complete line is flushed as
//! soon as it is seen. [`read_logs`] reads both files back merged in time
//! order.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};
use chrono::{DateTime, SecondsFormat, Utc};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// `(stdout.log, stderr.log)` under `log_dir`.
pub fn log_paths(log_dir: &Path) -> (PathBuf, PathBuf) {
    (log_dir.join(STDOUT_LOG), log_dir.join(STDERR_LOG))
}

/// Open a log file for appending, creating its directory.
pub fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(CtrError::io(format!("failed to create {}", parent.display())))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(CtrError::io(format!("failed to open log {}", path.display())))
}

/// Line-buffered writer that prefixes each line with a timestamp.
///
/// A trailing partial line is held until its newline arrives or the
/// writer is flushed.
pub struct TimestampedWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> TimestampedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        let Self { inner, .. } = self;
        Ok(inner)
    }

    fn emit(&mut self, line: &[u8]) -> io::Result<()> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mut out = Vec::with_capacity(stamp.len() + line.len() + 2);
        out.extend_from_slice(stamp.as_bytes());
        out.push(b' ');
        out.extend_from_slice(line);
        out.push(b'\n');
        self.inner.write_all(&out)?;
        self.inner.flush()
    }
}

impl<W: Write> Write for TimestampedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            if self.pending.is_empty() {
                self.emit(line)?;
            } else {
                let mut joined = std::mem::take(&mut self.pending);
                joined.extend_from_slice(line);
                self.emit(&joined)?;
            }
            rest = &tail[1..];
        }
        self.pending.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line)?;
        }
        self.inner.flush()
    }
}

/// Copy `reader` into `writer` until EOF, then flush any partial line.
pub fn pump<R: Read, W: Write>(mut reader: R, writer: W) -> io::Result<u64> {
    let mut writer = TimestampedWriter::new(writer);
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Which file a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One stored log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// `None` for lines written without a prefix (detached direct runs).
    pub timestamp: Option<DateTime<Utc>>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    /// Split a stored line into its timestamp prefix and content.
    pub fn parse(line: &str, stream: LogStream) -> Self {
        let stamped = line.split_once(' ').and_then(|(stamp, rest)| {
            DateTime::parse_from_rfc3339(stamp)
                .ok()
                .map(|ts| (ts.with_timezone(&Utc), rest))
        });
        match stamped {
            Some((timestamp, content)) => Self {
                timestamp: Some(timestamp),
                stream,
                content: content.to_string(),
            },
            None => Self {
                timestamp: None,
                stream,
                content: line.to_string(),
            },
        }
    }
}

/// Both log files under `log_dir`, ordered by timestamp, limited to the
/// last `tail` lines when given. Missing files read as empty.
pub fn read_logs(log_dir: &Path, tail: Option<usize>) -> Result<Vec<LogLine>> {
    let (stdout, stderr) = log_paths(log_dir);
    let mut lines = read_log_file(&stdout, LogStream::Stdout)?;
    lines.extend(read_log_file(&stderr, LogStream::Stderr)?);
    // Stable, so lines of one stream keep their order and unstamped lines
    // stay in file order.
    lines.sort_by_key(|line| line.timestamp);

    if let Some(n) = tail {
        let skip = lines.len().saturating_sub(n);
        lines.drain(..skip);
    }
    Ok(lines)
}

fn read_log_file(path: &Path, stream: LogStream) -> Result<Vec<LogLine>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CtrError::Io {
                context: format!("failed to read log {}", path.display()),
                source: e,
            })
        }
    };
    Ok(String::from_utf8_lossy(&data)
        .lines()
        .map(|line| LogLine::parse(line, stream))
        .collect())
}
