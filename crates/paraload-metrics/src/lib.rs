//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Run and daemon metrics with a Prometheus exporter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

pub mod exporter;

pub use exporter::{serve_metrics, MetricsServer};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics updated by the orchestrator while a test runs.
#[derive(Clone, Debug)]
pub struct RunMetrics {
    registry: SharedRegistry,
    ticks: IntCounter,
    trips: IntCounterVec,
    missing_readings: IntCounterVec,
    feed_dropped: IntCounterVec,
    rows_written: IntCounter,
    rotations: IntCounter,
    steps_skipped: IntCounter,
    shutdowns: IntCounterVec,
    current_step: IntGauge,
    energy_wh: Gauge,
    capacity_ah: Gauge,
}

impl RunMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let ticks = IntCounter::with_opts(Opts::new(
            "paraload_ticks_total",
            "Monitoring ticks completed",
        ))?;
        registry.register(Box::new(ticks.clone()))?;

        let trips = IntCounterVec::new(
            Opts::new("paraload_trips_total", "Safety trips by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(trips.clone()))?;

        let missing_readings = IntCounterVec::new(
            Opts::new(
                "paraload_missing_readings_total",
                "Measurement queries that produced no value",
            ),
            &["unit", "quantity"],
        )?;
        registry.register(Box::new(missing_readings.clone()))?;

        let feed_dropped = IntCounterVec::new(
            Opts::new(
                "paraload_feed_dropped_total",
                "Feed messages dropped because the consumer lagged or went away",
            ),
            &["feed"],
        )?;
        registry.register(Box::new(feed_dropped.clone()))?;

        let rows_written = IntCounter::with_opts(Opts::new(
            "paraload_rows_written_total",
            "Rows persisted to the row file",
        ))?;
        registry.register(Box::new(rows_written.clone()))?;

        let rotations = IntCounter::with_opts(Opts::new(
            "paraload_log_rotations_total",
            "Row and narrative file rotations",
        ))?;
        registry.register(Box::new(rotations.clone()))?;

        let steps_skipped = IntCounter::with_opts(Opts::new(
            "paraload_steps_skipped_total",
            "Profile steps that could not be started",
        ))?;
        registry.register(Box::new(steps_skipped.clone()))?;

        let shutdowns = IntCounterVec::new(
            Opts::new(
                "paraload_shutdowns_total",
                "Completed safe-shutdown sequences by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(shutdowns.clone()))?;

        let current_step = IntGauge::with_opts(Opts::new(
            "paraload_current_step",
            "1-based profile step being executed, 0 when idle",
        ))?;
        registry.register(Box::new(current_step.clone()))?;

        let energy_wh = Gauge::with_opts(Opts::new(
            "paraload_cumulative_energy_wh",
            "Energy integrated since the run started",
        ))?;
        registry.register(Box::new(energy_wh.clone()))?;

        let capacity_ah = Gauge::with_opts(Opts::new(
            "paraload_cumulative_capacity_ah",
            "Capacity integrated since the run started",
        ))?;
        registry.register(Box::new(capacity_ah.clone()))?;

        Ok(Self {
            registry,
            ticks,
            trips,
            missing_readings,
            feed_dropped,
            rows_written,
            rotations,
            steps_skipped,
            shutdowns,
            current_step,
            energy_wh,
            capacity_ah,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_tick(&self) {
        self.ticks.inc();
    }

    pub fn record_trip(&self, reason: &str) {
        self.trips.with_label_values(&[reason]).inc();
    }

    pub fn record_missing_reading(&self, unit: &str, quantity: &str) {
        self.missing_readings
            .with_label_values(&[unit, quantity])
            .inc();
    }

    pub fn record_feed_drop(&self, feed: &str) {
        self.feed_dropped.with_label_values(&[feed]).inc();
    }

    pub fn record_row(&self) {
        self.rows_written.inc();
    }

    pub fn record_rotation(&self) {
        self.rotations.inc();
    }

    pub fn record_step_skipped(&self) {
        self.steps_skipped.inc();
    }

    pub fn record_shutdown(&self, reason: &str) {
        self.shutdowns.with_label_values(&[reason]).inc();
    }

    pub fn set_step(&self, step: usize) {
        self.current_step.set(step as i64);
    }

    pub fn set_totals(&self, energy_wh: f64, capacity_ah: f64) {
        self.energy_wh.set(energy_wh);
        self.capacity_ah.set(capacity_ah);
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "paraloadd_starts_total",
            "Times the daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "paraloadd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("paraloadd_build_info", "Build metadata for the running binary"),
            &["version", "profile", "mode"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str, mode: &str) {
        self.build_info
            .with_label_values(&[version, profile, mode])
            .set(1.0);
    }
}

pub use prometheus;
