//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Recorder integration tests across rotations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Local;
use paraload_common::{TelemetrySample, UnitReading};
use paraload_persistence::{read_narrative, read_rows, row_files, LogLevel, RecordingSession};
use tempfile::tempdir;

fn sample(step_index: usize, relative_s: f64, master_v: Option<f64>) -> TelemetrySample {
    TelemetrySample {
        timestamp: Local::now(),
        relative_s,
        step_index,
        requested_total_power_w: 300.0,
        master: UnitReading {
            voltage_v: master_v,
            current_a: Some(0.75),
            power_w: Some(150.0),
        },
        slave: UnitReading {
            voltage_v: Some(200.0),
            current_a: Some(0.75),
            power_w: Some(150.0),
        },
        total_power_w: 300.0,
        total_current_a: 1.5,
        avg_voltage_v: 200.0,
        power_imbalance_pct: 0.0,
        current_imbalance_pct: 0.0,
        voltage_imbalance_pct: 0.0,
        cumulative_energy_wh: relative_s * 300.0 / 3600.0,
        cumulative_capacity_ah: relative_s * 1.5 / 3600.0,
        dqdv_ah_per_v: 0.0,
        dqdv_at_voltage_v: 200.0,
        dqdv_valid: false,
    }
}

#[tokio::test(start_paused = true)]
async fn rotated_files_concatenate_to_full_run() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut session = RecordingSession::open(dir.path(), Duration::from_secs(30))?;
    session.note("═══ Test started ═══")?;
    for tick in 0..95u32 {
        session.maybe_rotate()?;
        let voltage = if tick % 7 == 0 { None } else { Some(200.0) };
        session.append_row(&sample(1 + (tick / 50) as usize, tick as f64, voltage))?;
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    session.note("[CUTOFF] Voltage cutoff")?;
    session.close()?;

    let files = row_files(dir.path())?;
    assert_eq!(files.len(), 4);
    let mut rows = Vec::new();
    for file in &files {
        rows.extend(read_rows(file)?);
    }
    assert_eq!(rows.len(), 95);
    assert!(rows.windows(2).all(|w| w[0].relative_s < w[1].relative_s));
    assert_eq!(rows.iter().filter(|r| r.master_voltage_v.is_none()).count(), 14);
    assert_eq!(rows.last().map(|r| r.step_index), Some(2));

    let last_log = session.narrative_paths().last().cloned().unwrap();
    let entries = read_narrative(&last_log)?;
    assert_eq!(entries.last().map(|e| e.level), Some(LogLevel::Cutoff));
    Ok(())
}
