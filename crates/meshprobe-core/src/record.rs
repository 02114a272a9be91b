//! Message log
//!
//! Appends routed messages to a CSV file, one row per message.

use chrono::Local;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::router::RoutedMessage;

/// Column header, written once when the file is created
pub const CSV_HEADER: &str = "tiempo,origin,timestamp,class,details";

/// Receipt time format (local time, microseconds)
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// CSV message recorder
pub struct MessageRecorder {
    /// Log file path
    path: PathBuf,
    writer: BufWriter<File>,
    /// Whether incoming messages are written
    is_recording: bool,
    /// Rows written since open
    rows: u64,
}

impl MessageRecorder {
    /// Open `path` for appending. The header is written if the file is new or
    /// empty. Recording starts stopped.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{}", CSV_HEADER)?;
            writer.flush()?;
        }

        Ok(Self {
            path,
            writer,
            is_recording: false,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start recording
    pub fn start(&mut self) {
        self.is_recording = true;
    }

    /// Stop recording
    pub fn stop(&mut self) {
        self.is_recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one row for `routed`. Does nothing while stopped.
    pub fn record(&mut self, routed: &RoutedMessage) -> io::Result<()> {
        if !self.is_recording {
            return Ok(());
        }

        let message = &routed.message;
        let tiempo = message
            .received_at
            .unwrap_or_else(Local::now)
            .format(TIME_FORMAT)
            .to_string();
        let timestamp = message.timestamp_text();
        let details = routed.route.details();

        let fields = [
            tiempo.as_str(),
            message.origin.as_str(),
            timestamp.as_str(),
            message.class.as_deref().unwrap_or_default(),
            details.as_str(),
        ];
        let row: Vec<Cow<'_, str>> = fields.iter().map(|f| quote(f)).collect();
        writeln!(self.writer, "{}", row.join(","))?;

        // Flushed per row so the file is usable while a test runs
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}

/// Quote a CSV field if it contains a separator, quote or line break
fn quote(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}
