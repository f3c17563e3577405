//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the paraload test daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use paraload_common::{init_tracing, Mode, Settings, ShutdownReason, TestConfig, UnitRole};
use paraload_instrument::{Connector, SerialConnector, SimulatedLoad};
use paraload_metrics::{new_registry, serve_metrics, DaemonMetrics, RunMetrics};
use paraload_orchestrator::{Orchestrator, OrchestratorHandle, RunSummary};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Master-slave electronic load test daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true, help = "Override the configured mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    Simulation,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::Simulation => Mode::Simulation,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Execute the configured test profile")]
    Run {
        #[arg(long, value_name = "ADDR", help = "Serve Prometheus metrics on this address")]
        metrics_listen: Option<SocketAddr>,
    },
    #[command(about = "Validate the configuration and print the resolved profile")]
    Validate {
        #[arg(long, value_name = "FILE", help = "Write the normalised document as TOML")]
        emit: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/paraload.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let load_started = Instant::now();
    let loaded = TestConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }

    match cli.command.unwrap_or(Commands::Run {
        metrics_listen: None,
    }) {
        Commands::Validate { emit } => {
            let settings = config
                .settings()
                .with_context(|| format!("invalid configuration in {}", loaded.source.display()))?;
            render_settings(&loaded.source, config.mode, &settings);
            if let Some(path) = emit {
                config.save(&path)?;
                println!("Normalised configuration written to {}", path.display());
            }
        }
        Commands::Run { metrics_listen } => {
            init_tracing("paraloadd", &config.logging)?;
            info!(source = %loaded.source.display(), mode = ?config.mode, "configuration loaded");

            let registry = new_registry();
            let daemon_metrics = DaemonMetrics::new(registry.clone())?;
            daemon_metrics.observe_config_load(load_duration.as_secs_f64());
            daemon_metrics.inc_start();
            daemon_metrics.set_build_info(
                env!("CARGO_PKG_VERSION"),
                if cfg!(debug_assertions) { "debug" } else { "release" },
                mode_label(config.mode),
            );
            let run_metrics = RunMetrics::new(registry.clone())?;

            let metrics_server = match metrics_listen {
                Some(addr) => Some(serve_metrics(registry, addr).await?),
                None => None,
            };

            let settings = Arc::new(config.settings().context("invalid test configuration")?);
            let outcome = match config.mode {
                Mode::Production => {
                    let connect = |role: UnitRole| {
                        SerialConnector::new(
                            settings.channel(role).port.clone(),
                            settings.baud_rate,
                            settings.io_timeout,
                        )
                    };
                    let parts = Orchestrator::new(
                        settings.clone(),
                        connect(UnitRole::Master),
                        connect(UnitRole::Slave),
                    );
                    execute(parts, run_metrics).await
                }
                Mode::Simulation => {
                    info!("simulation mode: driving in-process simulated loads");
                    let (master, slave) = simulated_pair();
                    let parts =
                        Orchestrator::new(settings.clone(), master.connector(), slave.connector());
                    execute(parts, run_metrics).await
                }
            };

            if let Some(server) = metrics_server {
                server.shutdown().await?;
            }
            let summary = outcome?;
            render_summary(&summary);
            if let ShutdownReason::Exception(message) = &summary.reason {
                bail!("test ended with an exception: {}", message);
            }
        }
    }

    Ok(())
}

/// Run to completion while draining the feeds and honouring Ctrl-C as a stop request.
async fn execute<C: Connector>(
    (orchestrator, handle): (Orchestrator<C>, OrchestratorHandle),
    metrics: RunMetrics,
) -> Result<RunSummary> {
    let OrchestratorHandle {
        stop,
        mut telemetry,
        mut status,
        ..
    } = handle;

    let telemetry_task = tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(sample) = telemetry.recv().await {
            received += 1;
            debug!(
                step = sample.step_index,
                total_power_w = sample.total_power_w,
                avg_voltage_v = sample.avg_voltage_v,
                energy_wh = sample.cumulative_energy_wh,
                "telemetry"
            );
        }
        received
    });
    let status_task = tokio::spawn(async move {
        let mut levels = BTreeMap::new();
        while let Some(line) = status.recv().await {
            *levels.entry(line.level.as_str()).or_insert(0u64) += 1;
        }
        levels
    });
    let signal_task = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; stopping after the current tick");
            stop.request_stop();
        }
    });

    let result = orchestrator.with_metrics(metrics).run().await;
    signal_task.abort();
    let received = telemetry_task.await.context("telemetry drain panicked")?;
    let levels = status_task.await.context("status drain panicked")?;
    info!(samples = received, levels = ?levels, "feeds drained");
    Ok(result?)
}

fn simulated_pair() -> (SimulatedLoad, SimulatedLoad) {
    let master = SimulatedLoad::new(UnitRole::Master);
    let slave = SimulatedLoad::new(UnitRole::Slave);
    for load in [&master, &slave] {
        load.set_discharge(0.5);
    }
    slave.set_power_scale(0.98);
    (master, slave)
}

fn mode_label(mode: Mode) -> &'static str {
    match mode {
        Mode::Production => "production",
        Mode::Simulation => "simulation",
    }
}

fn render_settings(source: &std::path::Path, mode: Mode, settings: &Settings) {
    println!("Configuration: {}", source.display());
    println!("Mode: {}", mode_label(mode));
    println!(
        "Master: {}  Slave: {}  @ {} baud",
        settings.master.port, settings.slave.port, settings.baud_rate
    );
    println!(
        "Cutoff: {} V (safety {})  Imbalance: {}% -> {}% after {:?} (check {})",
        settings.cutoff_voltage,
        if settings.cutoff_safety_enabled { "on" } else { "off" },
        settings.imbalance_transition_pct,
        settings.imbalance_limit_pct,
        settings.transition_duration,
        if settings.imbalance_check_enabled { "on" } else { "off" },
    );
    for (index, step) in settings.profile.iter().enumerate() {
        let termination = match step.duration() {
            Some(duration) => format!("{:?}", duration),
            None => "until cutoff".to_owned(),
        };
        println!(
            "  Step {}: {} W total ({} W per unit), {}",
            index + 1,
            step.total_power_w,
            step.per_unit_power_w(),
            termination
        );
    }
}

fn render_summary(summary: &RunSummary) {
    println!(
        "Result: {}\nStarted: {}\nElapsed: {:.1} s\nTicks: {}\nEnergy: {:.3} Wh\nCapacity: {:.4} Ah",
        summary.reason,
        summary.started_at.to_rfc3339(),
        summary.elapsed.as_secs_f64(),
        summary.ticks,
        summary.cumulative_energy_wh,
        summary.cumulative_capacity_ah
    );
    if !summary.skipped_steps.is_empty() {
        println!(
            "WARNING: step(s) {:?} could not be started and were skipped",
            summary.skipped_steps
        );
    }
    if summary.shutdown_failures > 0 {
        println!(
            "WARNING: {} shutdown command(s) failed; verify equipment state",
            summary.shutdown_failures
        );
    }
    for path in &summary.row_files {
        println!("Data: {}", path.display());
    }
    for path in &summary.narrative_files {
        println!("Log: {}", path.display());
    }
}
