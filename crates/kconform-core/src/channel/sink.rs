// crates/kconform-core/src/channel/sink.rs
// ============================================================================
// Module: Result Sinks
// Description: Sink trait plus text and JSON-lines implementations.
// Purpose: Render result records for humans and for log collectors.
// Dependencies: serde, serde_json, time, kconform-config
// ============================================================================

//! ## Overview
//! Sinks receive every [`ResultRecord`] reported through the result channel.
//! [`TextSink`] prints `file:line: TAG: message` lines, [`JsonLogSink`]
//! appends one JSON object per line to a file opened with `O_APPEND`.
//! Invariants:
//! - One record is written with a single `write` call.
//! - Sink failures never change the tally.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use kconform_config::ColorMode;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::channel::ChannelError;
use crate::severity::Severity;

// ============================================================================
// SECTION: Record
// ============================================================================

/// One reported result as seen by sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultRecord<'a> {
    /// Severity after cleanup downgrading.
    pub severity: Severity,
    /// Source file of the report.
    pub file: &'a str,
    /// Source line of the report.
    pub line: u32,
    /// Human-readable message.
    pub message: &'a str,
    /// Reporting process.
    pub pid: i32,
    /// Variant index at the time of the report.
    pub variant: u32,
}

// ============================================================================
// SECTION: Sink Trait
// ============================================================================

/// Receives result records.
pub trait ResultSink {
    /// Writes one record.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the record cannot be written.
    fn write_record(&self, record: &ResultRecord<'_>) -> Result<(), ChannelError>;
}

// ============================================================================
// SECTION: Text Sink
// ============================================================================

/// ANSI reset sequence.
const ANSI_RESET: &str = "\x1b[0m";

/// Returns the ANSI colour for a severity tag.
const fn ansi_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Pass => "\x1b[1;32m",
        Severity::Fail | Severity::Broken => "\x1b[1;31m",
        Severity::Unsupported => "\x1b[1;33m",
        Severity::Warn => "\x1b[1;35m",
        Severity::Info => "\x1b[1;34m",
    }
}

/// Human-readable sink writing `file:line: TAG: message` lines.
pub struct TextSink<W> {
    /// Destination writer.
    writer: Mutex<W>,
    /// Whether tags are colourised.
    color: bool,
}

impl<W: Write> TextSink<W> {
    /// Creates a text sink over `writer`.
    #[must_use]
    pub const fn new(writer: W, color: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            color,
        }
    }

    /// Formats a record as one line including the trailing newline.
    fn render(&self, record: &ResultRecord<'_>) -> String {
        let tag = record.severity.tag();
        if self.color {
            format!(
                "{}:{}: {}{tag}{ANSI_RESET}: {}\n",
                record.file,
                record.line,
                ansi_color(record.severity),
                record.message
            )
        } else {
            format!("{}:{}: {tag}: {}\n", record.file, record.line, record.message)
        }
    }
}

impl TextSink<std::io::Stderr> {
    /// Creates a stderr sink honouring the colour policy.
    #[must_use]
    pub fn stderr(mode: ColorMode) -> Self {
        let stderr = std::io::stderr();
        let color = match mode {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => stderr.is_terminal(),
        };
        Self::new(stderr, color)
    }
}

impl<W: Write> ResultSink for TextSink<W> {
    fn write_record(&self, record: &ResultRecord<'_>) -> Result<(), ChannelError> {
        let line = self.render(record);
        let mut writer =
            self.writer.lock().map_err(|_| ChannelError::Sink("text sink lock poisoned".to_string()))?;
        writer.write_all(line.as_bytes()).map_err(|err| ChannelError::Sink(err.to_string()))?;
        writer.flush().map_err(|err| ChannelError::Sink(err.to_string()))
    }
}

// ============================================================================
// SECTION: JSON Log Sink
// ============================================================================

/// Serialized shape of a JSON log line.
#[derive(Serialize)]
struct JsonRecord<'a> {
    /// RFC 3339 timestamp.
    ts: String,
    /// Reporting process.
    pid: i32,
    /// Variant index.
    variant: u32,
    /// Severity label.
    severity: Severity,
    /// Source file.
    file: &'a str,
    /// Source line.
    line: u32,
    /// Message text.
    message: &'a str,
}

/// JSON-lines sink appending to a shared file.
///
/// # Invariants
/// - The file is opened with `O_APPEND`; each record is one `write`.
#[derive(Debug)]
pub struct JsonLogSink {
    /// Append-mode log file.
    file: File,
}

impl JsonLogSink {
    /// Opens (or creates) the log file at `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Sink`] when the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, ChannelError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| ChannelError::Sink(format!("{}: {err}", path.display())))?;
        Ok(Self {
            file,
        })
    }
}

impl ResultSink for JsonLogSink {
    fn write_record(&self, record: &ResultRecord<'_>) -> Result<(), ChannelError> {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| ChannelError::Sink(err.to_string()))?;
        let json = JsonRecord {
            ts,
            pid: record.pid,
            variant: record.variant,
            severity: record.severity,
            file: record.file,
            line: record.line,
            message: record.message,
        };
        let mut line = serde_json::to_vec(&json).map_err(|err| ChannelError::Sink(err.to_string()))?;
        line.push(b'\n');
        (&self.file).write_all(&line).map_err(|err| ChannelError::Sink(err.to_string()))
    }
}
