//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-tick CSV row file writer and reader."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Writer};
use paraload_common::TelemetrySample;
use serde::Deserialize;

use crate::Result;

/// Column names of every row file, in order.
pub const ROW_HEADER: [&str; 20] = [
    "timestamp_iso8601",
    "relative_seconds",
    "step_index",
    "requested_total_power_w",
    "master_voltage_v",
    "master_current_a",
    "master_power_w",
    "slave_voltage_v",
    "slave_current_a",
    "slave_power_w",
    "total_power_w",
    "total_current_a",
    "avg_voltage_v",
    "power_imbalance_pct",
    "current_imbalance_pct",
    "voltage_imbalance_pct",
    "cumulative_energy_wh",
    "cumulative_capacity_ah",
    "dqdv_ah_per_v",
    "dqdv_at_voltage_v",
];

/// Prefix shared by row and narrative files.
pub(crate) const FILE_STEM: &str = "master_slave_load";
/// Suffix distinguishing narrative files from row files.
pub(crate) const NARRATIVE_SUFFIX: &str = "_test_logs.csv";

fn reading(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writer for one row file. Every row is flushed before `append` returns.
pub struct RowWriter {
    path: PathBuf,
    writer: Writer<File>,
    rows: u64,
}

impl RowWriter {
    /// Create the file at `path` and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options().write(true).create_new(true).open(path)?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(ROW_HEADER)?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    /// Append one tick. Missing readings become empty fields.
    pub fn append(&mut self, sample: &TelemetrySample) -> Result<()> {
        let record = [
            sample.timestamp_rfc3339(),
            format!("{:.3}", sample.relative_s),
            sample.step_index.to_string(),
            sample.requested_total_power_w.to_string(),
            reading(sample.master.voltage_v),
            reading(sample.master.current_a),
            reading(sample.master.power_w),
            reading(sample.slave.voltage_v),
            reading(sample.slave.current_a),
            reading(sample.slave.power_w),
            format!("{:.6}", sample.total_power_w),
            format!("{:.6}", sample.total_current_a),
            format!("{:.6}", sample.avg_voltage_v),
            format!("{:.3}", sample.power_imbalance_pct),
            format!("{:.3}", sample.current_imbalance_pct),
            format!("{:.3}", sample.voltage_imbalance_pct),
            format!("{:.6}", sample.cumulative_energy_wh),
            format!("{:.6}", sample.cumulative_capacity_ah),
            format!("{:.6}", sample.dqdv_ah_per_v),
            format!("{:.6}", sample.dqdv_at_voltage_v),
        ];
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
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

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

/// One row read back from a row file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RowRecord {
    /// Wall-clock timestamp as written.
    #[serde(rename = "timestamp_iso8601")]
    pub timestamp: String,
    /// Seconds since the run started.
    #[serde(rename = "relative_seconds")]
    pub relative_s: f64,
    /// 1-based profile step.
    pub step_index: usize,
    /// Total power commanded for the step.
    pub requested_total_power_w: f64,
    /// Master terminal voltage.
    pub master_voltage_v: Option<f64>,
    /// Master current.
    pub master_current_a: Option<f64>,
    /// Master power.
    pub master_power_w: Option<f64>,
    /// Slave terminal voltage.
    pub slave_voltage_v: Option<f64>,
    /// Slave current.
    pub slave_current_a: Option<f64>,
    /// Slave power.
    pub slave_power_w: Option<f64>,
    /// Sum of present power readings.
    pub total_power_w: f64,
    /// Sum of present current readings.
    pub total_current_a: f64,
    /// Mean of present voltage readings.
    pub avg_voltage_v: f64,
    /// Power imbalance in percent.
    pub power_imbalance_pct: f64,
    /// Current imbalance in percent.
    pub current_imbalance_pct: f64,
    /// Voltage imbalance in percent.
    pub voltage_imbalance_pct: f64,
    /// Integrated energy.
    pub cumulative_energy_wh: f64,
    /// Integrated capacity.
    pub cumulative_capacity_ah: f64,
    /// Latest differential capacity.
    pub dqdv_ah_per_v: f64,
    /// Voltage the differential capacity refers to.
    pub dqdv_at_voltage_v: f64,
}

/// Read every row of a row file.
pub fn read_rows(path: &Path) -> Result<Vec<RowRecord>> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut rows = Vec::new();
    for row in reader.deserialize::<RowRecord>() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Row files in `dir`, oldest first. Names embed the UTC open time and a zero-padded
/// sequence number, so lexical order is tick order.
pub fn row_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.starts_with(FILE_STEM) && name.ends_with(".csv") && !name.ends_with(NARRATIVE_SUFFIX)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use paraload_common::UnitReading;
    use tempfile::tempdir;

    fn sample(step_index: usize, slave_voltage: Option<f64>) -> TelemetrySample {
        TelemetrySample {
            timestamp: Local::now(),
            relative_s: 1.5,
            step_index,
            requested_total_power_w: 300.0,
            master: UnitReading {
                voltage_v: Some(200.0),
                current_a: Some(0.75),
                power_w: Some(150.0),
            },
            slave: UnitReading {
                voltage_v: slave_voltage,
                current_a: Some(0.75),
                power_w: Some(150.0),
            },
            total_power_w: 300.0,
            total_current_a: 1.5,
            avg_voltage_v: 200.0,
            power_imbalance_pct: 0.0,
            current_imbalance_pct: 0.0,
            voltage_imbalance_pct: 0.0,
            cumulative_energy_wh: 0.125,
            cumulative_capacity_ah: 0.000625,
            dqdv_ah_per_v: 0.0,
            dqdv_at_voltage_v: 200.0,
            dqdv_valid: false,
        }
    }

    #[test]
    fn rows_are_flushed_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master_slave_load_20240101_000000_0001.csv");
        let mut writer = RowWriter::create(&path).unwrap();
        writer.append(&sample(1, Some(201.0))).unwrap();
        writer.append(&sample(2, None)).unwrap();

        // readable before close because each row is flushed
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].slave_voltage_v, Some(201.0));
        assert_eq!(rows[1].slave_voltage_v, None);
        assert_eq!(rows[1].step_index, 2);
        assert_eq!(rows[0].cumulative_energy_wh, 0.125);

        let raw = fs::read_to_string(&path).unwrap();
        let header = raw.lines().next().unwrap();
        assert_eq!(header, ROW_HEADER.join(","));
        assert!(raw.lines().nth(2).unwrap().contains(",,"));
        writer.close().unwrap();
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master_slave_load_x.csv");
        RowWriter::create(&path).unwrap();
        assert!(RowWriter::create(&path).is_err());
    }

    #[test]
    fn row_files_skip_narratives() {
        let dir = tempdir().unwrap();
        for name in [
            "master_slave_load_20240101_000000_0002.csv",
            "master_slave_load_20240101_000000_0001.csv",
            "master_slave_load_20240101_000000_0001_test_logs.csv",
            "notes.txt",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }
        let files = row_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "master_slave_load_20240101_000000_0001.csv",
                "master_slave_load_20240101_000000_0002.csv"
            ]
        );
    }
}
