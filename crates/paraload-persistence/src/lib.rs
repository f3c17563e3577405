//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Durable row and narrative logs for test runs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Recorder for paraload runs: one CSV row per tick plus a classified narrative log,
//! both rotated together on a fixed interval.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while creating or writing log files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for CSV encoding and decoding failures.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Reported when writing through a session that was already closed.
    #[error("recording session is closed")]
    Closed,
}

pub mod narrative;
pub mod rows;
pub mod session;

pub use narrative::{classify, read_narrative, LogLevel, NarrativeEntry, NarrativeWriter};
pub use rows::{read_rows, row_files, RowRecord, RowWriter, ROW_HEADER};
pub use session::{RecordingSession, RotationEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_error_display() {
        let err = PersistenceError::Closed;
        assert_eq!(format!("{err}"), "recording session is closed");
    }
}
