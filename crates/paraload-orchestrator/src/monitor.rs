//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-tick telemetry derivation, integration, and safety assessment."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use paraload_common::{Settings, ShutdownReason, TelemetrySample, UnitReading};
use tokio::time::Instant;

/// Minimum voltage movement before dQ/dV is recomputed.
pub const DQDV_VOLTAGE_THRESHOLD: f64 = 0.01;
/// Power and current imbalance above which a warning is logged while checks are disabled.
pub const UNCHECKED_IMBALANCE_WARN_PCT: f64 = 50.0;
/// Voltage imbalance above which a warning is logged while checks are disabled.
pub const UNCHECKED_VOLTAGE_WARN_PCT: f64 = 20.0;

/// `|a - b| / mean(a, b) * 100`, or 0 unless both readings are present and positive.
///
/// A missing reading therefore never trips an imbalance check.
pub fn imbalance_pct(a: Option<f64>, b: Option<f64>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) if a > 0.0 && b > 0.0 => (a - b).abs() / ((a + b) / 2.0) * 100.0,
        _ => 0.0,
    }
}

/// Sums and mean over whichever readings are present.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Totals {
    pub total_power_w: f64,
    pub total_current_a: f64,
    pub avg_voltage_v: f64,
    pub has_voltage: bool,
}

impl Totals {
    pub fn from_readings(master: &UnitReading, slave: &UnitReading) -> Self {
        let total_power_w = [master.power_w, slave.power_w].into_iter().flatten().sum();
        let total_current_a = [master.current_a, slave.current_a]
            .into_iter()
            .flatten()
            .sum();
        let voltages: Vec<f64> = [master.voltage_v, slave.voltage_v]
            .into_iter()
            .flatten()
            .collect();
        let avg_voltage_v = if voltages.is_empty() {
            0.0
        } else {
            voltages.iter().sum::<f64>() / voltages.len() as f64
        };
        Self {
            total_power_w,
            total_current_a,
            avg_voltage_v,
            has_voltage: !voltages.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Imbalances {
    pub power_pct: f64,
    pub current_pct: f64,
    pub voltage_pct: f64,
}

impl Imbalances {
    pub fn from_readings(master: &UnitReading, slave: &UnitReading) -> Self {
        Self {
            power_pct: imbalance_pct(master.power_w, slave.power_w),
            current_pct: imbalance_pct(master.current_a, slave.current_a),
            voltage_pct: imbalance_pct(master.voltage_v, slave.voltage_v),
        }
    }
}

/// Running integrals. Written only by the tick loop; tick N depends on tick N-1 alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatorState {
    pub cumulative_energy_wh: f64,
    pub cumulative_capacity_ah: f64,
    pub last_total_power: f64,
    pub last_total_current: f64,
    pub last_sample_time: Option<Instant>,
    pub last_avg_voltage: Option<f64>,
    pub last_capacity_ah: f64,
    pub last_dqdv: f64,
    pub last_dqdv_voltage: f64,
    pub dqdv_valid: bool,
}

impl AccumulatorState {
    /// Trapezoidal step against the previous tick. The first call only sets the baseline.
    pub fn integrate(&mut self, total_power_w: f64, total_current_a: f64, now: Instant) {
        if let Some(last) = self.last_sample_time {
            let hours = now.saturating_duration_since(last).as_secs_f64() / 3600.0;
            self.cumulative_energy_wh += (self.last_total_power + total_power_w) / 2.0 * hours;
            self.cumulative_capacity_ah +=
                (self.last_total_current + total_current_a) / 2.0 * hours;
        }
        self.last_sample_time = Some(now);
        self.last_total_power = total_power_w;
        self.last_total_current = total_current_a;
    }

    /// Differential capacity against the last baseline voltage.
    ///
    /// `None` (no voltage reading at all) leaves the state untouched.
    pub fn update_dqdv(&mut self, avg_voltage: Option<f64>) {
        let Some(voltage) = avg_voltage else {
            return;
        };
        let Some(baseline) = self.last_avg_voltage else {
            self.last_avg_voltage = Some(voltage);
            self.last_capacity_ah = self.cumulative_capacity_ah;
            self.last_dqdv = 0.0;
            self.last_dqdv_voltage = voltage;
            self.dqdv_valid = false;
            return;
        };
        let dv = voltage - baseline;
        if dv.abs() < DQDV_VOLTAGE_THRESHOLD {
            return;
        }
        let dq = self.cumulative_capacity_ah - self.last_capacity_ah;
        self.last_dqdv = dq / dv;
        self.last_dqdv_voltage = (voltage + baseline) / 2.0;
        self.last_avg_voltage = Some(voltage);
        self.last_capacity_ah = self.cumulative_capacity_ah;
        self.dqdv_valid = true;
    }
}

/// Imbalance threshold schedule of one profile step.
#[derive(Debug, Clone)]
pub struct TransitionWindow {
    started: Instant,
    duration: Duration,
    transition_pct: f64,
    limit_pct: f64,
    tightened: bool,
}

impl TransitionWindow {
    pub fn new(settings: &Settings, started: Instant) -> Self {
        Self {
            started,
            duration: settings.transition_duration,
            transition_pct: settings.imbalance_transition_pct,
            limit_pct: settings.imbalance_limit_pct,
            tightened: false,
        }
    }

    /// Threshold in force at `now`, and whether this call is the one that tightened it.
    /// The window is inclusive of its end.
    pub fn threshold(&mut self, now: Instant) -> (f64, bool) {
        if now.saturating_duration_since(self.started) <= self.duration {
            return (self.transition_pct, false);
        }
        let just_tightened = !self.tightened;
        self.tightened = true;
        (self.limit_pct, just_tightened)
    }
}

/// A safety trip together with its narrative line.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub reason: ShutdownReason,
    pub message: String,
}

/// Result of the safety checks for one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Assessment {
    pub trip: Option<Trip>,
    pub warnings: Vec<String>,
}

fn show(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_owned())
}

/// Evaluate the trip rules in priority order; the first match wins.
pub fn assess(
    settings: &Settings,
    master: &UnitReading,
    slave: &UnitReading,
    imbalance: &Imbalances,
    threshold_pct: f64,
    cutoff_armed: bool,
) -> Assessment {
    let mut assessment = Assessment::default();

    if settings.imbalance_check_enabled {
        if imbalance.power_pct > threshold_pct {
            assessment.trip = Some(Trip {
                reason: ShutdownReason::PowerImbalance,
                message: format!(
                    "[ALERT] Power imbalance >{}%: M={}W S={}W ({:.1}%)",
                    threshold_pct,
                    show(master.power_w),
                    show(slave.power_w),
                    imbalance.power_pct
                ),
            });
            return assessment;
        }
        if imbalance.current_pct > threshold_pct {
            assessment.trip = Some(Trip {
                reason: ShutdownReason::CurrentImbalance,
                message: format!(
                    "[ALERT] Current imbalance >{}%: M={}A S={}A ({:.1}%)",
                    threshold_pct,
                    show(master.current_a),
                    show(slave.current_a),
                    imbalance.current_pct
                ),
            });
            return assessment;
        }
        if imbalance.voltage_pct > settings.voltage_diff_limit_pct {
            assessment.trip = Some(Trip {
                reason: ShutdownReason::VoltageImbalance,
                message: format!(
                    "[ALERT] Voltage imbalance >{}%: M={}V S={}V ({:.1}%)",
                    settings.voltage_diff_limit_pct,
                    show(master.voltage_v),
                    show(slave.voltage_v),
                    imbalance.voltage_pct
                ),
            });
            return assessment;
        }
    } else {
        if imbalance.power_pct > UNCHECKED_IMBALANCE_WARN_PCT {
            assessment.warnings.push(format!(
                "[WARNING] High power imbalance: {:.1}% (monitoring disabled)",
                imbalance.power_pct
            ));
        }
        if imbalance.current_pct > UNCHECKED_IMBALANCE_WARN_PCT {
            assessment.warnings.push(format!(
                "[WARNING] High current imbalance: {:.1}% (monitoring disabled)",
                imbalance.current_pct
            ));
        }
        if imbalance.voltage_pct > UNCHECKED_VOLTAGE_WARN_PCT {
            assessment.warnings.push(format!(
                "[WARNING] High voltage difference: {:.1}% (monitoring disabled)",
                imbalance.voltage_pct
            ));
        }
    }

    if cutoff_armed {
        let breached = [master.voltage_v, slave.voltage_v]
            .into_iter()
            .flatten()
            .any(|voltage| voltage <= settings.cutoff_voltage);
        if breached {
            assessment.trip = Some(Trip {
                reason: ShutdownReason::VoltageCutoff,
                message: format!(
                    "[CUTOFF] Voltage cutoff: M={}V S={}V <= {}V",
                    show(master.voltage_v),
                    show(slave.voltage_v),
                    settings.cutoff_voltage
                ),
            });
        }
    }
    assessment
}

/// Raw inputs of one tick.
#[derive(Debug, Clone)]
pub struct TickInput {
    pub step_index: usize,
    pub requested_total_power_w: f64,
    pub master: UnitReading,
    pub slave: UnitReading,
    pub timestamp: DateTime<Local>,
    pub relative_s: f64,
    pub now: Instant,
    pub cutoff_armed: bool,
}

/// Everything the executor needs after evaluating a tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub sample: TelemetrySample,
    pub trip: Option<Trip>,
    /// Narrative lines to record before the row (milestones, warnings).
    pub notes: Vec<String>,
}

/// Telemetry and safety monitor for one run.
#[derive(Debug)]
pub struct Monitor {
    settings: Arc<Settings>,
    accumulator: AccumulatorState,
}

impl Monitor {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            accumulator: AccumulatorState::default(),
        }
    }

    pub fn accumulator(&self) -> &AccumulatorState {
        &self.accumulator
    }

    /// Derive totals, integrate, and assess one tick.
    pub fn evaluate(&mut self, input: TickInput, window: &mut TransitionWindow) -> TickOutcome {
        let totals = Totals::from_readings(&input.master, &input.slave);
        self.accumulator
            .integrate(totals.total_power_w, totals.total_current_a, input.now);
        self.accumulator
            .update_dqdv(totals.has_voltage.then_some(totals.avg_voltage_v));

        let mut notes = Vec::new();
        let (threshold_pct, just_tightened) = window.threshold(input.now);
        if just_tightened {
            notes.push(format!(
                "=== Normal phase: {}% imbalance threshold ===",
                threshold_pct
            ));
        }

        let imbalance = Imbalances::from_readings(&input.master, &input.slave);
        let assessment = assess(
            &self.settings,
            &input.master,
            &input.slave,
            &imbalance,
            threshold_pct,
            input.cutoff_armed,
        );
        notes.extend(assessment.warnings);

        let acc = &self.accumulator;
        let sample = TelemetrySample {
            timestamp: input.timestamp,
            relative_s: input.relative_s,
            step_index: input.step_index,
            requested_total_power_w: input.requested_total_power_w,
            master: input.master,
            slave: input.slave,
            total_power_w: totals.total_power_w,
            total_current_a: totals.total_current_a,
            avg_voltage_v: totals.avg_voltage_v,
            power_imbalance_pct: imbalance.power_pct,
            current_imbalance_pct: imbalance.current_pct,
            voltage_imbalance_pct: imbalance.voltage_pct,
            cumulative_energy_wh: acc.cumulative_energy_wh,
            cumulative_capacity_ah: acc.cumulative_capacity_ah,
            dqdv_ah_per_v: acc.last_dqdv,
            dqdv_at_voltage_v: acc.last_dqdv_voltage,
            dqdv_valid: acc.dqdv_valid,
        };

        TickOutcome {
            sample,
            trip: assessment.trip,
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paraload_common::{ProfileEntry, TestConfig};

    fn settings() -> Settings {
        TestConfig {
            profile: vec![ProfileEntry::until_cutoff(300.0)],
            ..TestConfig::default()
        }
        .settings()
        .unwrap()
    }

    fn reading(v: Option<f64>, i: Option<f64>, p: Option<f64>) -> UnitReading {
        UnitReading {
            voltage_v: v,
            current_a: i,
            power_w: p,
        }
    }

    #[test]
    fn imbalance_requires_both_positive() {
        assert!((imbalance_pct(Some(110.0), Some(90.0)) - 20.0).abs() < 1e-9);
        assert_eq!(imbalance_pct(Some(100.0), None), 0.0);
        assert_eq!(imbalance_pct(Some(100.0), Some(0.0)), 0.0);
        assert_eq!(imbalance_pct(None, None), 0.0);
    }

    #[test]
    fn totals_use_present_readings_only() {
        let totals = Totals::from_readings(
            &reading(Some(200.0), Some(1.0), Some(150.0)),
            &reading(None, None, Some(140.0)),
        );
        assert_eq!(totals.total_power_w, 290.0);
        assert_eq!(totals.total_current_a, 1.0);
        assert_eq!(totals.avg_voltage_v, 200.0);
        assert!(totals.has_voltage);

        let empty = Totals::from_readings(&UnitReading::default(), &UnitReading::default());
        assert_eq!(empty, Totals::default());
    }

    #[test]
    fn trapezoid_integration_uses_previous_tick() {
        let start = Instant::now();
        let mut acc = AccumulatorState::default();
        acc.integrate(300.0, 1.5, start);
        assert_eq!(acc.cumulative_energy_wh, 0.0);
        acc.integrate(300.0, 1.5, start + Duration::from_secs(3600));
        assert!((acc.cumulative_energy_wh - 300.0).abs() < 1e-9);
        acc.integrate(100.0, 0.5, start + Duration::from_secs(5400));
        assert!((acc.cumulative_energy_wh - 400.0).abs() < 1e-9);
        assert!((acc.cumulative_capacity_ah - 2.0).abs() < 1e-9);
    }

    #[test]
    fn dqdv_threshold_and_baseline() {
        let mut acc = AccumulatorState::default();
        acc.update_dqdv(Some(200.0));
        assert!(!acc.dqdv_valid);
        assert_eq!(acc.last_avg_voltage, Some(200.0));

        acc.cumulative_capacity_ah = 0.5;
        acc.update_dqdv(Some(199.995));
        assert!(!acc.dqdv_valid);
        assert_eq!(acc.last_avg_voltage, Some(200.0));

        acc.update_dqdv(None);
        assert_eq!(acc.last_avg_voltage, Some(200.0));

        acc.update_dqdv(Some(199.0));
        assert!(acc.dqdv_valid);
        assert!((acc.last_dqdv - (-0.5)).abs() < 1e-9);
        assert!((acc.last_dqdv_voltage - 199.5).abs() < 1e-9);

        // below threshold: previous value and validity retained
        acc.cumulative_capacity_ah = 0.7;
        acc.update_dqdv(Some(198.995));
        assert!(acc.dqdv_valid);
        assert!((acc.last_dqdv - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn transition_window_is_inclusive_and_tightens_once() {
        let settings = settings();
        let start = Instant::now();
        let mut window = TransitionWindow::new(&settings, start);
        assert_eq!(window.threshold(start), (25.0, false));
        assert_eq!(
            window.threshold(start + Duration::from_secs(120)),
            (25.0, false)
        );
        assert_eq!(
            window.threshold(start + Duration::from_millis(120_001)),
            (10.0, true)
        );
        assert_eq!(
            window.threshold(start + Duration::from_secs(200)),
            (10.0, false)
        );
    }

    #[test]
    fn trips_follow_priority_order() {
        let settings = settings();
        let master = reading(Some(200.0), Some(1.0), Some(150.0));
        let slave = reading(Some(150.0), Some(0.5), Some(100.0));
        let imbalance = Imbalances::from_readings(&master, &slave);
        let assessment = assess(&settings, &master, &slave, &imbalance, 10.0, true);
        assert_eq!(
            assessment.trip.map(|t| t.reason),
            Some(ShutdownReason::PowerImbalance)
        );

        let slave = reading(Some(150.0), Some(0.5), Some(150.0));
        let imbalance = Imbalances::from_readings(&master, &slave);
        let assessment = assess(&settings, &master, &slave, &imbalance, 10.0, true);
        assert_eq!(
            assessment.trip.map(|t| t.reason),
            Some(ShutdownReason::CurrentImbalance)
        );

        let slave = reading(Some(150.0), Some(1.0), Some(150.0));
        let imbalance = Imbalances::from_readings(&master, &slave);
        let assessment = assess(&settings, &master, &slave, &imbalance, 10.0, true);
        let trip = assessment.trip.unwrap();
        assert_eq!(trip.reason, ShutdownReason::VoltageImbalance);
        assert!(trip.message.starts_with("[ALERT]"));
    }

    #[test]
    fn cutoff_only_when_armed() {
        let settings = settings();
        let master = reading(Some(180.0), Some(1.0), Some(150.0));
        let slave = reading(Some(181.0), Some(1.0), Some(150.0));
        let imbalance = Imbalances::from_readings(&master, &slave);
        let disarmed = assess(&settings, &master, &slave, &imbalance, 10.0, false);
        assert!(disarmed.trip.is_none());
        let armed = assess(&settings, &master, &slave, &imbalance, 10.0, true);
        let trip = armed.trip.unwrap();
        assert_eq!(trip.reason, ShutdownReason::VoltageCutoff);
        assert!(trip.message.starts_with("[CUTOFF]"));
    }

    #[test]
    fn missing_sensor_never_trips() {
        let settings = settings();
        let master = reading(Some(200.0), Some(1.0), Some(150.0));
        let slave = reading(None, Some(1.0), Some(150.0));
        let imbalance = Imbalances::from_readings(&master, &slave);
        assert_eq!(imbalance.voltage_pct, 0.0);
        let assessment = assess(&settings, &master, &slave, &imbalance, 10.0, true);
        assert!(assessment.trip.is_none());
    }

    #[test]
    fn disabled_checks_only_warn() {
        let mut settings = settings();
        settings.imbalance_check_enabled = false;
        let master = reading(Some(200.0), Some(2.0), Some(300.0));
        let slave = reading(Some(150.0), Some(0.5), Some(100.0));
        let imbalance = Imbalances::from_readings(&master, &slave);
        let assessment = assess(&settings, &master, &slave, &imbalance, 10.0, false);
        assert!(assessment.trip.is_none());
        assert_eq!(assessment.warnings.len(), 3);
        assert!(assessment.warnings.iter().all(|w| w.starts_with("[WARNING]")));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_builds_samples_and_milestones() {
        let mut settings = settings();
        settings.transition_duration = Duration::from_secs(1);
        let settings = Arc::new(settings);
        let mut monitor = Monitor::new(settings.clone());
        let start = Instant::now();
        let mut window = TransitionWindow::new(&settings, start);

        let input = |now: Instant, relative_s: f64| TickInput {
            step_index: 1,
            requested_total_power_w: 300.0,
            master: reading(Some(200.0), Some(0.75), Some(150.0)),
            slave: reading(Some(200.0), Some(0.75), Some(150.0)),
            timestamp: Local::now(),
            relative_s,
            now,
            cutoff_armed: false,
        };

        let first = monitor.evaluate(input(start, 0.0), &mut window);
        assert!(first.notes.is_empty());
        assert_eq!(first.sample.total_power_w, 300.0);
        assert_eq!(first.sample.cumulative_energy_wh, 0.0);

        let second = monitor.evaluate(input(start + Duration::from_secs(2), 2.0), &mut window);
        assert_eq!(second.notes.len(), 1);
        assert!(second.notes[0].starts_with("==="));
        assert!((second.sample.cumulative_energy_wh - 300.0 * 2.0 / 3600.0).abs() < 1e-9);
        assert!(second.trip.is_none());
    }
}
