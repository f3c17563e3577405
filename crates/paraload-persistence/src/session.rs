//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Recording session that rotates row and narrative files in lockstep."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use paraload_common::TelemetrySample;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::narrative::{LogLevel, NarrativeWriter};
use crate::rows::{RowWriter, FILE_STEM, NARRATIVE_SUFFIX};
use crate::{PersistenceError, Result};

const MAX_NAME_ATTEMPTS: u32 = 16;

/// Files opened by a rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationEvent {
    /// Sequence number of the new pair.
    pub sequence: u32,
    /// New row file.
    pub row_path: PathBuf,
    /// New narrative file.
    pub narrative_path: PathBuf,
}

/// Owns the current row file and narrative file of a run.
///
/// Rotation is checked by the caller once per tick, before the row is written; the
/// replacement pair is opened before the old pair is closed.
pub struct RecordingSession {
    dir: PathBuf,
    rotate_interval: Duration,
    started: Instant,
    opened_at: Instant,
    sequence: u32,
    rows: Option<RowWriter>,
    narrative: Option<NarrativeWriter>,
    row_paths: Vec<PathBuf>,
    narrative_paths: Vec<PathBuf>,
}

impl RecordingSession {
    /// Create `dir` if needed and open the first file pair.
    pub fn open(dir: &Path, rotate_interval: Duration) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let (sequence, rows, narrative) = open_pair(dir, 1)?;
        info!(
            row_file = %rows.path().display(),
            narrative_file = %narrative.path().display(),
            "recording started"
        );
        let now = Instant::now();
        Ok(Self {
            dir: dir.to_path_buf(),
            rotate_interval,
            started: now,
            opened_at: now,
            sequence,
            row_paths: vec![rows.path().to_path_buf()],
            narrative_paths: vec![narrative.path().to_path_buf()],
            rows: Some(rows),
            narrative: Some(narrative),
        })
    }

    /// Rotate both files when the current pair has been open for the rotation interval.
    pub fn maybe_rotate(&mut self) -> Result<Option<RotationEvent>> {
        if self.rows.is_none() {
            return Err(PersistenceError::Closed);
        }
        let elapsed = self.opened_at.elapsed();
        if elapsed < self.rotate_interval {
            return Ok(None);
        }
        let (sequence, rows, narrative) = open_pair(&self.dir, self.sequence + 1)?;
        let event = RotationEvent {
            sequence,
            row_path: rows.path().to_path_buf(),
            narrative_path: narrative.path().to_path_buf(),
        };
        self.note(&format!(
            "Rotating log files after {:.2} hours",
            elapsed.as_secs_f64() / 3600.0
        ))?;

        let old_rows = self.rows.replace(rows);
        let old_narrative = self.narrative.replace(narrative);
        if let Some(old) = old_rows {
            old.close()?;
        }
        if let Some(old) = old_narrative {
            old.close()?;
        }

        self.sequence = sequence;
        self.opened_at = Instant::now();
        self.row_paths.push(event.row_path.clone());
        self.narrative_paths.push(event.narrative_path.clone());
        info!(sequence, row_file = %event.row_path.display(), "log files rotated");
        Ok(Some(event))
    }

    /// Append one tick to the current row file.
    pub fn append_row(&mut self, sample: &TelemetrySample) -> Result<()> {
        self.rows
            .as_mut()
            .ok_or(PersistenceError::Closed)?
            .append(sample)
    }

    /// Append a narrative line stamped with the current time.
    pub fn note(&mut self, message: &str) -> Result<LogLevel> {
        let relative_s = self.relative_s();
        let narrative = self.narrative.as_mut().ok_or(PersistenceError::Closed)?;
        narrative.write(&Local::now(), relative_s, message)
    }

    /// Flush and close both files. Further writes fail with [`PersistenceError::Closed`].
    pub fn close(&mut self) -> Result<()> {
        let rows = self.rows.take();
        let narrative = self.narrative.take();
        if let Some(rows) = rows {
            debug!(rows = rows.rows(), "closing row file");
            rows.close()?;
        }
        if let Some(narrative) = narrative {
            narrative.close()?;
        }
        Ok(())
    }

    /// Whether the files are still open.
    pub fn is_open(&self) -> bool {
        self.rows.is_some()
    }

    /// Seconds since the session was opened.
    pub fn relative_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Every row file opened by this session, oldest first.
    pub fn row_paths(&self) -> &[PathBuf] {
        &self.row_paths
    }

    /// Every narrative file opened by this session, oldest first.
    pub fn narrative_paths(&self) -> &[PathBuf] {
        &self.narrative_paths
    }
}

/// File name without extension. The stamp is UTC so names keep sorting in open order
/// across a daylight-saving fall-back.
fn pair_base(opened: &DateTime<Utc>, sequence: u32) -> String {
    format!(
        "{}_{}Z_{:04}",
        FILE_STEM,
        opened.format("%Y%m%d_%H%M%S"),
        sequence
    )
}

fn open_pair(dir: &Path, first_sequence: u32) -> Result<(u32, RowWriter, NarrativeWriter)> {
    let opened = Utc::now();
    let mut sequence = first_sequence;
    loop {
        let base = pair_base(&opened, sequence);
        let row_path = dir.join(format!("{}.csv", base));
        let narrative_path = dir.join(format!("{}{}", base, NARRATIVE_SUFFIX));
        match RowWriter::create(&row_path) {
            Ok(rows) => {
                let narrative = NarrativeWriter::create(&narrative_path)?;
                return Ok((sequence, rows, narrative));
            }
            Err(PersistenceError::Io(err))
                if err.kind() == ErrorKind::AlreadyExists
                    && sequence < first_sequence + MAX_NAME_ATTEMPTS =>
            {
                sequence += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narrative::read_narrative;
    use crate::rows::{read_rows, row_files};
    use paraload_common::UnitReading;
    use tempfile::tempdir;

    fn tick(relative_s: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: Local::now(),
            relative_s,
            step_index: 1,
            requested_total_power_w: 100.0,
            master: UnitReading::default(),
            slave: UnitReading::default(),
            total_power_w: 0.0,
            total_current_a: 0.0,
            avg_voltage_v: 0.0,
            power_imbalance_pct: 0.0,
            current_imbalance_pct: 0.0,
            voltage_imbalance_pct: 0.0,
            cumulative_energy_wh: 0.0,
            cumulative_capacity_ah: 0.0,
            dqdv_ah_per_v: 0.0,
            dqdv_at_voltage_v: 0.0,
            dqdv_valid: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_keeps_every_row_in_order() {
        let dir = tempdir().unwrap();
        let mut session = RecordingSession::open(dir.path(), Duration::from_secs(10)).unwrap();
        for second in 0..25u32 {
            session.maybe_rotate().unwrap();
            session.append_row(&tick(second as f64)).unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        session.close().unwrap();

        assert_eq!(session.row_paths().len(), 3);
        let files = row_files(dir.path()).unwrap();
        assert_eq!(files, session.row_paths());

        let relative: Vec<f64> = files
            .iter()
            .flat_map(|path| read_rows(path).unwrap())
            .map(|row| row.relative_s)
            .collect();
        assert_eq!(relative.len(), 25);
        assert!(relative.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_note_lands_in_previous_narrative() {
        let dir = tempdir().unwrap();
        let mut session = RecordingSession::open(dir.path(), Duration::from_secs(5)).unwrap();
        session.note("═══ Test started ═══").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let event = session.maybe_rotate().unwrap().expect("rotation due");
        assert_eq!(event.sequence, 2);
        session.note("after rotation").unwrap();
        session.close().unwrap();

        let first = read_narrative(&session.narrative_paths()[0]).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].level, LogLevel::Milestone);
        assert!(first[1].message.starts_with("Rotating log files"));
        let second = read_narrative(&event.narrative_path).unwrap();
        assert_eq!(second.len(), 1);
        assert!((second[0].relative_s - 5.0).abs() < 1e-6);
    }

    #[test]
    fn names_sort_in_open_order_across_clock_changes() {
        // 2026-10-25 01:00 UTC is the EU fall-back: 02:30 CEST then 02:10 CET locally
        let before = "2026-10-25T00:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let after = "2026-10-25T01:10:00Z".parse::<DateTime<Utc>>().unwrap();
        let first = pair_base(&before, 1);
        let second = pair_base(&after, 2);
        assert_eq!(first, "master_slave_load_20261025_003000Z_0001");
        assert!(first < second);
        assert!(pair_base(&before, 2) > first);
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let dir = tempdir().unwrap();
        let mut session = RecordingSession::open(dir.path(), Duration::from_secs(60)).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(matches!(
            session.append_row(&tick(0.0)),
            Err(PersistenceError::Closed)
        ));
        assert!(matches!(session.note("late"), Err(PersistenceError::Closed)));
    }
}
