//! Container output in CRI log format.
//!
//! Each record is `<RFC3339Nano> <stream> <tag> <content>\n` where the tag is
//! `F` for a complete line and `P` for a fragment of a longer one.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;

/// Longest content carried by one record before the line is split.
const MAX_RECORD: u64 = 16 * 1024;

pub struct CriLog {
    file: File,
    size: u64,
    /// Size limit in bytes; the file is truncated when a record would exceed
    /// it. Non-positive means unlimited.
    max_size: i64,
}

impl CriLog {
    pub fn open(path: &Path, max_size: i64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            max_size,
        })
    }

    pub fn write_record(&mut self, stream: &str, partial: bool, content: &[u8]) -> std::io::Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let tag = if partial { "P" } else { "F" };
        let mut record = format!("{} {} {} ", timestamp, stream, tag).into_bytes();
        record.extend_from_slice(content);
        record.push(b'\n');

        let len = record.len() as u64;
        if self.max_size > 0 && self.size + len > self.max_size as u64 {
            self.file.set_len(0)?;
            self.size = 0;
        }
        self.file.write_all(&record)?;
        self.size += len;
        Ok(())
    }
}

/// Copy one output stream into the log until EOF.
pub fn copy_stream<R: Read>(reader: R, stream: &'static str, log: Arc<Mutex<CriLog>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.by_ref().take(MAX_RECORD).read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if complete {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                if let Err(e) = log.lock().write_record(stream, !complete, &buf) {
                    tracing::warn!(stream, error = %e, "Failed to write container log");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO is how a pty master reports that the slave side closed
            Err(e) => {
                tracing::debug!(stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}
