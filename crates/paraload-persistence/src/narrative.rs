//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Human-readable narrative log with keyword severity classification."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use csv::{ReaderBuilder, Writer};
use paraload_common::format_timestamp;
use serde::{Deserialize, Serialize};

use crate::Result;

const NARRATIVE_HEADER: [&str; 4] = ["timestamp_iso8601", "relative_seconds", "level", "message"];

/// Severity assigned to a narrative line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// `[ERROR]` or `[EXCEPTION]`.
    Error,
    /// `[ALERT]`, `[WARNING]`, `[WARN]` or a warning sign.
    Warning,
    /// `[CUTOFF]`.
    Cutoff,
    /// Section banners drawn with `===` or `═══`.
    Milestone,
    /// `[DEBUG]`.
    Debug,
    /// Everything else.
    Info,
}

impl LogLevel {
    /// Column value written to the narrative file.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Cutoff => "CUTOFF",
            LogLevel::Milestone => "MILESTONE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a message by its keywords; the first matching rule wins.
pub fn classify(message: &str) -> LogLevel {
    if message.contains("[ERROR]") || message.contains("[EXCEPTION]") {
        LogLevel::Error
    } else if ["[ALERT]", "[WARNING]", "[WARN]", "⚠"]
        .iter()
        .any(|keyword| message.contains(keyword))
    {
        LogLevel::Warning
    } else if message.contains("[CUTOFF]") {
        LogLevel::Cutoff
    } else if message.contains("===") || message.contains("═══") {
        LogLevel::Milestone
    } else if message.contains("[DEBUG]") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Writer for one narrative file. Lines are flushed as they are written.
pub struct NarrativeWriter {
    path: PathBuf,
    writer: Writer<File>,
}

impl NarrativeWriter {
    /// Create the file at `path` and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options().write(true).create_new(true).open(path)?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(NARRATIVE_HEADER)?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Classify and append one line.
    pub fn write(
        &mut self,
        timestamp: &DateTime<Local>,
        relative_s: f64,
        message: &str,
    ) -> Result<LogLevel> {
        let level = classify(message);
        self.writer.write_record([
            format_timestamp(timestamp).as_str(),
            format!("{:.3}", relative_s).as_str(),
            level.as_str(),
            message,
        ])?;
        self.writer.flush()?;
        Ok(level)
    }

    /// Flush and release the file.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Location of the file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One narrative line read back from disk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NarrativeEntry {
    /// Wall-clock timestamp as written.
    #[serde(rename = "timestamp_iso8601")]
    pub timestamp: String,
    /// Seconds since the run started.
    #[serde(rename = "relative_seconds")]
    pub relative_s: f64,
    /// Classified severity.
    pub level: LogLevel,
    /// Free text.
    pub message: String,
}

/// Read a narrative file back.
pub fn read_narrative(path: &Path) -> Result<Vec<NarrativeEntry>> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut entries = Vec::new();
    for entry in reader.deserialize::<NarrativeEntry>() {
        entries.push(entry?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keywords_map_to_levels() {
        assert_eq!(classify("[ERROR] write failed"), LogLevel::Error);
        assert_eq!(classify("[EXCEPTION] tick loop panicked"), LogLevel::Error);
        assert_eq!(classify("[ALERT] Power imbalance"), LogLevel::Warning);
        assert_eq!(classify("[WARN] slow response"), LogLevel::Warning);
        assert_eq!(classify("⚠ Initiating safe shutdown sequence"), LogLevel::Warning);
        assert_eq!(classify("[CUTOFF] Voltage cutoff"), LogLevel::Cutoff);
        assert_eq!(classify("=== Step 1/2 ==="), LogLevel::Milestone);
        assert_eq!(classify("═══ Test started ═══"), LogLevel::Milestone);
        assert_eq!(classify("[DEBUG] raw"), LogLevel::Debug);
        assert_eq!(classify("M: V=200V"), LogLevel::Info);
    }

    #[test]
    fn first_matching_rule_wins() {
        assert_eq!(classify("[ERROR] === [CUTOFF]"), LogLevel::Error);
        assert_eq!(classify("[CUTOFF] === reached"), LogLevel::Cutoff);
    }

    #[test]
    fn messages_with_commas_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("narrative.csv");
        let mut writer = NarrativeWriter::create(&path).unwrap();
        let level = writer
            .write(&Local::now(), 2.0, "[ALERT] M=150W, S=120W")
            .unwrap();
        assert_eq!(level, LogLevel::Warning);
        let entries = read_narrative(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "[ALERT] M=150W, S=120W");
        assert_eq!(entries[0].level, LogLevel::Warning);
    }
}
