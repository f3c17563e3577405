//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Narrative and row recording for the executor, mirrored to tracing and the status feed."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use chrono::Local;
use paraload_common::TelemetrySample;
use paraload_metrics::RunMetrics;
use paraload_persistence::{classify, LogLevel, PersistenceError, RecordingSession};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::feed::{Feed, StatusLine};

/// Every narrative line of a run goes through here: it is classified, written to the
/// narrative file when one is open, emitted as a tracing event, and offered on the
/// status feed.
pub(crate) struct Journal {
    session: Option<RecordingSession>,
    status: Feed<StatusLine>,
    metrics: Option<RunMetrics>,
    started: Instant,
    row_paths: Vec<PathBuf>,
    narrative_paths: Vec<PathBuf>,
}

impl Journal {
    pub(crate) fn new(status: Feed<StatusLine>) -> Self {
        Self {
            session: None,
            status,
            metrics: None,
            started: Instant::now(),
            row_paths: Vec::new(),
            narrative_paths: Vec::new(),
        }
    }

    pub(crate) fn attach_metrics(&mut self, metrics: RunMetrics) {
        self.status.attach_metrics(metrics.clone());
        self.metrics = Some(metrics);
    }

    /// Start the run clock and take ownership of the recording files.
    pub(crate) fn begin(&mut self, session: RecordingSession) {
        self.started = Instant::now();
        self.session = Some(session);
    }

    pub(crate) fn relative_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub(crate) fn note(&mut self, message: impl AsRef<str>) -> LogLevel {
        let message = message.as_ref();
        let level = classify(message);
        match level {
            LogLevel::Error => error!(target: "paraload::narrative", "{}", message),
            LogLevel::Warning | LogLevel::Cutoff => {
                warn!(target: "paraload::narrative", "{}", message)
            }
            LogLevel::Debug => debug!(target: "paraload::narrative", "{}", message),
            LogLevel::Milestone | LogLevel::Info => {
                info!(target: "paraload::narrative", "{}", message)
            }
        }
        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.note(message) {
                warn!(error = %err, "narrative line not persisted");
            }
        }
        let relative_s = self.relative_s();
        self.status.publish(StatusLine {
            timestamp: Local::now(),
            relative_s,
            level,
            message: message.to_owned(),
        });
        level
    }

    /// Rotate if due, then persist one row.
    pub(crate) fn record(&mut self, sample: &TelemetrySample) -> Result<(), PersistenceError> {
        let session = self.session.as_mut().ok_or(PersistenceError::Closed)?;
        if let Some(event) = session.maybe_rotate()? {
            if let Some(metrics) = &self.metrics {
                metrics.record_rotation();
            }
            self.note(format!(
                "=== Log files rotated (sequence {}) ===",
                event.sequence
            ));
        }
        let session = self.session.as_mut().ok_or(PersistenceError::Closed)?;
        session.append_row(sample)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_row();
        }
        Ok(())
    }

    /// Close the files; later notes still reach tracing and the status feed.
    pub(crate) fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.close() {
                error!(error = %err, "failed to close recording files");
            }
            self.row_paths = session.row_paths().to_vec();
            self.narrative_paths = session.narrative_paths().to_vec();
        }
    }

    pub(crate) fn row_paths(&self) -> &[PathBuf] {
        &self.row_paths
    }

    pub(crate) fn narrative_paths(&self) -> &[PathBuf] {
        &self.narrative_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn notes_reach_status_feed_and_file() {
        let dir = tempdir().unwrap();
        let (feed, mut rx) = Feed::channel("status", 8);
        let mut journal = Journal::new(feed);
        assert_eq!(journal.note("[WARNING] before files"), LogLevel::Warning);

        journal.begin(RecordingSession::open(dir.path(), Duration::from_secs(3600)).unwrap());
        assert_eq!(journal.note("═══ Test started ═══"), LogLevel::Milestone);
        journal.close();

        assert_eq!(rx.try_recv().unwrap().level, LogLevel::Warning);
        assert_eq!(rx.try_recv().unwrap().message, "═══ Test started ═══");
        assert_eq!(journal.narrative_paths().len(), 1);
        let entries = paraload_persistence::read_narrative(&journal.narrative_paths()[0]).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
