//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Configuration-to-recording integration tests for the paraload stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use paraload_common::{Mode, SettingsError, ShutdownReason, TestConfig, UnitRole};
use paraload_instrument::SimulatedLoad;
use paraload_metrics::{new_registry, prometheus::Registry, RunMetrics};
use paraload_orchestrator::Orchestrator;
use paraload_persistence::{read_rows, row_files};
use tempfile::tempdir;

fn counter(registry: &Registry, name: &str) -> f64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric().iter())
        .map(|metric| metric.get_counter().get_value())
        .sum()
}

#[test]
fn example_config_validates() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/example.toml");
    let config = TestConfig::from_path(&path).expect("example config parses");
    assert_eq!(config.mode, Mode::Simulation);
    let settings = config.settings().expect("example config is valid");
    assert_eq!(settings.profile.len(), 2);
    assert!(!settings.profile[0].is_cutoff());
    assert!(settings.profile[1].is_cutoff());
    assert_eq!(settings.profile[1].per_unit_power_w(), 100.0);
    assert!(settings.alert.is_some());
}

#[test]
fn empty_profile_is_rejected() {
    let config = TestConfig::default();
    assert_eq!(config.settings().unwrap_err(), SettingsError::EmptyProfile);
    assert!("mode = \"simulation\"".parse::<TestConfig>().is_err());
}

#[tokio::test(start_paused = true)]
async fn toml_document_drives_a_rotating_simulated_run() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let document = format!(
        r#"
mode = "simulation"

[recording]
directory = {dir:?}
record_interval_s = 1.0
rotate_interval_hours = 0.002

[[profile]]
total_power_w = 300.0
duration_value = 20
duration_unit = "seconds"
"#,
        dir = dir.path().display().to_string()
    );
    let config: TestConfig = document.parse()?;
    let settings = Arc::new(config.settings()?);

    let master = SimulatedLoad::new(UnitRole::Master);
    let slave = SimulatedLoad::new(UnitRole::Slave);
    let registry = new_registry();
    let metrics = RunMetrics::new(registry.clone())?;
    let (orchestrator, _handle) =
        Orchestrator::new(settings, master.connector(), slave.connector());
    let summary = orchestrator.with_metrics(metrics).run().await?;

    assert_eq!(summary.reason, ShutdownReason::ProfileCompleted);
    assert!(summary.row_files.len() >= 2, "expected a rotation");
    assert_eq!(row_files(dir.path())?, summary.row_files);

    let mut rows = Vec::new();
    for file in &summary.row_files {
        rows.extend(read_rows(file)?);
    }
    assert_eq!(rows.len() as u64, summary.ticks);
    assert!(rows.windows(2).all(|w| w[0].relative_s < w[1].relative_s));
    assert!(rows.iter().all(|row| row.total_power_w > 299.0));

    assert_eq!(counter(&registry, "paraload_ticks_total"), summary.ticks as f64);
    assert_eq!(counter(&registry, "paraload_rows_written_total"), summary.ticks as f64);
    assert!(counter(&registry, "paraload_log_rotations_total") >= 1.0);
    assert_eq!(counter(&registry, "paraload_shutdowns_total"), 1.0);
    Ok(())
}
