//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Profile executor driving both loads from conditioning to safe shutdown."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::FutureExt;
use paraload_common::{
    ProfileStep, Settings, ShutdownReason, StepTermination, TelemetrySample, UnitReading, UnitRole,
};
use paraload_instrument::{Connector, InstrumentController, LoadCommand, ProtocolTiming};
use paraload_metrics::RunMetrics;
use paraload_persistence::RecordingSession;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::alert::{alert_body, should_alert, AlertSink, TracingAlertSink};
use crate::feed::{Feed, StatusLine, DEFAULT_FEED_CAPACITY};
use crate::journal::Journal;
use crate::monitor::{Monitor, TickInput, TransitionWindow};
use crate::shutdown::{safe_shutdown, UnitPair};
use crate::stop::{stop_channel, StopHandle, StopSignal};
use crate::{ExecutorState, OrchestratorError, RunSummary};

/// Longest single sleep inside the inter-poll wait; bounds stop latency.
pub const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Tunables that are not part of the test configuration.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub telemetry_capacity: usize,
    pub status_capacity: usize,
    /// Pause between conditioning phases.
    pub phase_pause: Duration,
    /// Pause before the conditioning read-back.
    pub verify_pause: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            telemetry_capacity: DEFAULT_FEED_CAPACITY,
            status_capacity: DEFAULT_FEED_CAPACITY,
            phase_pause: Duration::from_millis(500),
            verify_pause: Duration::from_secs(1),
        }
    }
}

/// What an outside context gets back: a stop switch and read-only views.
#[derive(Debug)]
pub struct OrchestratorHandle {
    pub stop: StopHandle,
    pub telemetry: mpsc::Receiver<Arc<TelemetrySample>>,
    pub status: mpsc::Receiver<StatusLine>,
    pub state: watch::Receiver<ExecutorState>,
}

/// Runs one test profile against a master and a slave load.
///
/// The executor owns both instrument links, the accumulator, and the recording files for
/// the whole run and works strictly sequentially. [`Orchestrator::run`] always ends with
/// the safe-shutdown sequence once conditioning has succeeded.
pub struct Orchestrator<C: Connector> {
    settings: Arc<Settings>,
    units: UnitPair<C>,
    stop: StopSignal,
    state: watch::Sender<ExecutorState>,
    telemetry: Feed<Arc<TelemetrySample>>,
    journal: Journal,
    monitor: Monitor,
    alert_sink: Option<Arc<dyn AlertSink>>,
    metrics: Option<RunMetrics>,
    options: ExecutorOptions,
    ticks: u64,
    skipped_steps: Vec<usize>,
    trip_detail: Option<String>,
}

impl<C: Connector> Orchestrator<C> {
    pub fn new(settings: Arc<Settings>, master: C, slave: C) -> (Self, OrchestratorHandle) {
        Self::with_options(settings, master, slave, ExecutorOptions::default())
    }

    pub fn with_options(
        settings: Arc<Settings>,
        master: C,
        slave: C,
        options: ExecutorOptions,
    ) -> (Self, OrchestratorHandle) {
        let timing = ProtocolTiming::with_io_timeout(settings.io_timeout);
        let units = UnitPair {
            master: InstrumentController::new(UnitRole::Master, master, timing),
            slave: InstrumentController::new(UnitRole::Slave, slave, timing),
        };
        let (stop_handle, stop) = stop_channel();
        let (state, state_rx) = watch::channel(ExecutorState::Idle);
        let (telemetry, telemetry_rx) = Feed::channel("telemetry", options.telemetry_capacity);
        let (status, status_rx) = Feed::channel("status", options.status_capacity);
        let alert_sink = settings
            .alert
            .clone()
            .map(|channel| Arc::new(TracingAlertSink::new(channel)) as Arc<dyn AlertSink>);

        let orchestrator = Self {
            monitor: Monitor::new(settings.clone()),
            settings,
            units,
            stop,
            state,
            telemetry,
            journal: Journal::new(status),
            alert_sink,
            metrics: None,
            options,
            ticks: 0,
            skipped_steps: Vec::new(),
            trip_detail: None,
        };
        let handle = OrchestratorHandle {
            stop: stop_handle,
            telemetry: telemetry_rx,
            status: status_rx,
            state: state_rx,
        };
        (orchestrator, handle)
    }

    /// Replace the default tracing sink. Only consulted when an alert channel is configured.
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.telemetry.attach_metrics(metrics.clone());
        self.journal.attach_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute the whole test.
    ///
    /// Errors are returned only when the run never reached the running state (recording
    /// files or instrument links could not be set up). Everything after that, panics
    /// included, ends in a safe shutdown and a [`RunSummary`].
    pub async fn run(mut self) -> Result<RunSummary, OrchestratorError> {
        let started_at = Local::now();
        let session =
            RecordingSession::open(&self.settings.recording_dir, self.settings.rotate_interval)
                .map_err(|err| {
                    error!(error = %err, dir = %self.settings.recording_dir.display(), "cannot open recording files");
                    OrchestratorError::Recorder(err)
                })?;
        self.journal.begin(session);
        self.journal.note("═══ Master-slave load test started ═══");
        self.journal.note(format!(
            "Profile: {} step(s) | cutoff {} V (safety {}) | imbalance check {} ({}% -> {}% after {:.0} s) | voltage limit {}%",
            self.settings.profile.len(),
            self.settings.cutoff_voltage,
            on_off(self.settings.cutoff_safety_enabled),
            on_off(self.settings.imbalance_check_enabled),
            self.settings.imbalance_transition_pct,
            self.settings.imbalance_limit_pct,
            self.settings.transition_duration.as_secs_f64(),
            self.settings.voltage_diff_limit_pct,
        ));

        self.set_state(ExecutorState::Conditioning);
        if let Err(err) = self.condition().await {
            self.journal
                .note(format!("[ERROR] Conditioning aborted, no profile step executed: {}", err));
            if matches!(err, OrchestratorError::Conditioning { .. }) {
                self.release_after_failed_conditioning().await;
            }
            self.units.close().await;
            self.journal.close();
            self.set_state(ExecutorState::Idle);
            return Err(err);
        }

        let outcome = AssertUnwindSafe(self.execute_profile())
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(reason)) => reason,
            Ok(Err(err)) => {
                let message = err.to_string();
                self.journal.note(format!("[EXCEPTION] {}", message));
                self.trip_detail = Some(message.clone());
                ShutdownReason::Exception(message)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.journal
                    .note(format!("[EXCEPTION] profile execution panicked: {}", message));
                self.trip_detail = Some(message.clone());
                ShutdownReason::Exception(message)
            }
        };

        self.set_state(ExecutorState::ShuttingDown);
        self.journal.note(format!("=== Test ended: {} ===", reason));
        let shutdown_failures = safe_shutdown(&mut self.units, &mut self.journal, &reason).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_shutdown(reason.label());
            metrics.set_step(0);
        }
        self.raise_alert(&reason).await;
        self.units.close().await;

        let totals = self.monitor.accumulator().clone();
        self.journal.note(format!(
            "Run summary: {} tick(s), energy {:.3} Wh, capacity {:.4} Ah",
            self.ticks, totals.cumulative_energy_wh, totals.cumulative_capacity_ah
        ));
        let elapsed = Duration::from_secs_f64(self.journal.relative_s());
        self.journal.close();
        self.set_state(ExecutorState::Idle);
        info!(reason = reason.label(), ticks = self.ticks, "test run finished");

        Ok(RunSummary {
            reason,
            started_at,
            elapsed,
            ticks: self.ticks,
            skipped_steps: std::mem::take(&mut self.skipped_steps),
            cumulative_energy_wh: totals.cumulative_energy_wh,
            cumulative_capacity_ah: totals.cumulative_capacity_ah,
            shutdown_failures,
            telemetry_dropped: self.telemetry.dropped(),
            row_files: self.journal.row_paths().to_vec(),
            narrative_files: self.journal.narrative_paths().to_vec(),
        })
    }

    fn set_state(&self, state: ExecutorState) {
        info!(state = %state, "executor state");
        self.state.send_replace(state);
    }

    async fn condition(&mut self) -> Result<(), OrchestratorError> {
        self.journal.note("═══ Phase 1: Instrument conditioning ═══");
        for unit in self.units.each_mut() {
            let role = unit.role();
            let endpoint = unit.endpoint().to_owned();
            if let Err(source) = unit.open(self.settings.io_timeout).await {
                self.journal
                    .note(format!("[ERROR] {}: cannot open {}: {}", role, endpoint, source));
                return Err(OrchestratorError::Open { unit: role, source });
            }
            self.journal.note(format!("{}: connected on {}", role, endpoint));
        }

        for unit in self.units.each_mut() {
            let role = unit.role();
            match unit.identify().await {
                Some(idn) => self.journal.note(format!("{}: {}", role, idn)),
                None => self
                    .journal
                    .note(format!("[WARNING] {}: no identification response", role)),
            };
        }

        let mode = self.settings.power_mode;
        self.condition_step("Step 1: Setting REMOTE control", |_| LoadCommand::Remote)
            .await?;
        self.condition_step(
            format!("Step 2: Selecting power mode ({})", LoadCommand::SelectMode(mode)),
            move |_| LoadCommand::SelectMode(mode),
        )
        .await?;
        self.condition_step("Step 3: Setting power to 0 W", |_| LoadCommand::SetPower(0.0))
            .await?;
        self.condition_step("Step 4: Enabling inputs", |_| LoadCommand::Input(true))
            .await?;
        self.condition_step("Step 5: Assigning parallel roles", LoadCommand::ParallelRole)
            .await?;
        self.condition_step("Step 6: Enabling parallel mode", |_| {
            LoadCommand::Parallel(true)
        })
        .await?;
        self.condition_step("Step 7: Turning loads ON", |_| LoadCommand::Load(true))
            .await?;

        sleep(self.options.verify_pause).await;
        for unit in self.units.each_mut() {
            let role = unit.role();
            match unit.read_power().await {
                Some(power) => self
                    .journal
                    .note(format!("{}: read-back power {} W", role, power)),
                None => self
                    .journal
                    .note(format!("[WARNING] {}: no power read-back", role)),
            };
        }
        self.journal.note("✓ Conditioning complete");
        Ok(())
    }

    async fn condition_step(
        &mut self,
        title: impl AsRef<str>,
        command: impl Fn(UnitRole) -> LoadCommand,
    ) -> Result<(), OrchestratorError> {
        self.journal.note(format!("  {}", title.as_ref()));
        for unit in self.units.each_mut() {
            let role = unit.role();
            let command = command(role);
            if let Err(source) = unit.execute(command).await {
                self.journal
                    .note(format!("[ERROR] {}: '{}' failed: {}", role, command, source));
                return Err(OrchestratorError::Conditioning {
                    unit: role,
                    command: command.to_string(),
                    source,
                });
            }
        }
        sleep(self.options.phase_pause).await;
        Ok(())
    }

    async fn release_after_failed_conditioning(&mut self) {
        self.journal
            .note("[WARNING] Releasing instruments after failed conditioning");
        for command in [
            LoadCommand::SetPower(0.0),
            LoadCommand::Load(false),
            LoadCommand::Local,
        ] {
            self.units
                .execute_each(&mut self.journal, move |_| command)
                .await;
        }
    }

    async fn execute_profile(&mut self) -> Result<ShutdownReason, OrchestratorError> {
        let settings = Arc::clone(&self.settings);
        let total = settings.profile.len();
        self.journal.note("═══ Phase 2: Profile execution ═══");

        for (offset, step) in settings.profile.iter().enumerate() {
            let index = offset + 1;
            if self.stop.is_requested() {
                return Ok(self.stopped());
            }
            self.set_state(ExecutorState::Running { step: index });
            if let Some(metrics) = &self.metrics {
                metrics.set_step(index);
            }
            self.journal.note(format!(
                "=== Step {}/{}: {} W total ({} W per unit), {} ===",
                index,
                total,
                step.total_power_w,
                step.per_unit_power_w(),
                describe_termination(step)
            ));

            let per_unit = step.per_unit_power_w();
            let mut failures = self
                .units
                .execute_each(&mut self.journal, |_| LoadCommand::SetPower(per_unit))
                .await;
            failures += self
                .units
                .execute_each(&mut self.journal, |_| LoadCommand::Load(true))
                .await;
            if failures > 0 {
                self.journal.note(format!(
                    "[ERROR] Step {} could not be started, releasing both units",
                    index
                ));
                self.release_step().await;
                self.skipped_steps.push(index);
                if let Some(metrics) = &self.metrics {
                    metrics.record_step_skipped();
                }
                continue;
            }

            let started = Instant::now();
            let deadline = step.duration().map(|duration| started + duration);
            let mut window = TransitionWindow::new(&settings, started);
            let cutoff_armed = settings.cutoff_safety_enabled || step.is_cutoff();
            self.journal.note(format!(
                "  Transition phase: {}% imbalance allowed for {:.0} s",
                settings.imbalance_transition_pct,
                settings.transition_duration.as_secs_f64()
            ));

            loop {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    break;
                }
                if let Some(reason) = self.tick(index, step, &mut window, cutoff_armed).await? {
                    return Ok(reason);
                }
                if self.stop.is_requested() {
                    return Ok(self.stopped());
                }
                self.wait(settings.record_interval, deadline).await;
                if self.stop.is_requested() {
                    return Ok(self.stopped());
                }
            }

            self.journal.note(format!("Step {} complete", index));
            self.release_step().await;
        }

        if !self.skipped_steps.is_empty() {
            let detail = format!("step(s) {} could not be started", list(&self.skipped_steps));
            self.trip_detail = Some(detail.clone());
            if self.skipped_steps.len() == total {
                self.journal
                    .note(format!("[ERROR] No profile step executed: {}", detail));
                return Ok(ShutdownReason::Exception(
                    "no profile step could be started".to_owned(),
                ));
            }
            self.journal
                .note(format!("[WARNING] Profile incomplete: {}", detail));
        }
        self.journal.note("═══ Profile completed ═══");
        Ok(ShutdownReason::ProfileCompleted)
    }

    /// Both units to 0 W and load off before anything else is commanded.
    async fn release_step(&mut self) {
        self.units
            .execute_each(&mut self.journal, |_| LoadCommand::SetPower(0.0))
            .await;
        self.units
            .execute_each(&mut self.journal, |_| LoadCommand::Load(false))
            .await;
    }

    fn stopped(&mut self) -> ShutdownReason {
        self.journal.note("⏸ Stop requested by user");
        ShutdownReason::UserRequested
    }

    /// Sleep for `interval`, clipped to `deadline`, in slices of at most [`MAX_WAIT_SLICE`].
    async fn wait(&self, interval: Duration, deadline: Option<Instant>) {
        let mut until = Instant::now() + interval;
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }
        loop {
            if self.stop.is_requested() {
                return;
            }
            let now = Instant::now();
            if now >= until {
                return;
            }
            sleep((until - now).min(MAX_WAIT_SLICE)).await;
        }
    }

    async fn tick(
        &mut self,
        index: usize,
        step: &ProfileStep,
        window: &mut TransitionWindow,
        cutoff_armed: bool,
    ) -> Result<Option<ShutdownReason>, OrchestratorError> {
        let timestamp = Local::now();
        let relative_s = self.journal.relative_s();
        let master = self.units.get_mut(UnitRole::Master).read_all().await;
        let slave = self.units.get_mut(UnitRole::Slave).read_all().await;
        for (role, reading) in [(UnitRole::Master, &master), (UnitRole::Slave, &slave)] {
            for quantity in reading.missing() {
                if let Some(metrics) = &self.metrics {
                    metrics.record_missing_reading(role.as_str(), quantity.as_str());
                }
                self.journal
                    .note(format!("[WARNING] {}: no {} reading", role, quantity.as_str()));
            }
        }

        let outcome = self.monitor.evaluate(
            TickInput {
                step_index: index,
                requested_total_power_w: step.total_power_w,
                master,
                slave,
                timestamp,
                relative_s,
                now: Instant::now(),
                cutoff_armed,
            },
            window,
        );
        for note in &outcome.notes {
            self.journal.note(note);
        }

        self.journal.record(&outcome.sample)?;
        self.ticks += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_tick();
            metrics.set_totals(
                outcome.sample.cumulative_energy_wh,
                outcome.sample.cumulative_capacity_ah,
            );
        }
        self.journal.note(tick_line(&outcome.sample));
        self.telemetry.publish(Arc::new(outcome.sample));

        match outcome.trip {
            Some(trip) => {
                self.journal.note(&trip.message);
                if let Some(metrics) = &self.metrics {
                    metrics.record_trip(trip.reason.label());
                }
                self.trip_detail = Some(trip.message);
                Ok(Some(trip.reason))
            }
            None => Ok(None),
        }
    }

    async fn raise_alert(&mut self, reason: &ShutdownReason) {
        let Some(channel) = self.settings.alert.as_ref() else {
            return;
        };
        if !should_alert(channel, reason, self.skipped_steps.len()) {
            return;
        }
        let Some(sink) = self.alert_sink.clone() else {
            return;
        };
        let subject = channel.subject.clone();
        let body = alert_body(reason, self.trip_detail.as_deref(), self.journal.relative_s());
        match sink.trigger(reason, &body).await {
            Ok(()) => self.journal.note(format!("Alert raised: {}", subject)),
            Err(err) => self
                .journal
                .note(format!("[WARNING] Alert delivery failed: {}", err)),
        };
    }
}

fn list(steps: &[usize]) -> String {
    steps
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn describe_termination(step: &ProfileStep) -> String {
    match step.termination {
        StepTermination::FixedDuration { value, unit } => format!("{} {}", value, unit.as_str()),
        StepTermination::RunUntilCutoff => "until voltage cutoff".to_owned(),
    }
}

fn show(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(value) => format!("{:.*}", precision, value),
        None => "--".to_owned(),
    }
}

fn unit_line(reading: &UnitReading) -> String {
    format!(
        "V={}V I={}A P={}W",
        show(reading.voltage_v, 2),
        show(reading.current_a, 3),
        show(reading.power_w, 1)
    )
}

/// Per-tick narrative line.
fn tick_line(sample: &TelemetrySample) -> String {
    let dqdv = if sample.dqdv_valid {
        format!(
            "{:.4} Ah/V @ {:.2}V",
            sample.dqdv_ah_per_v, sample.dqdv_at_voltage_v
        )
    } else {
        "--".to_owned()
    };
    format!(
        "  M: {} | S: {} | Total: {:.1}W, {:.3}A | Energy: {:.3}Wh, Cap: {:.4}Ah | dQ/dV: {}",
        unit_line(&sample.master),
        unit_line(&sample.slave),
        sample.total_power_w,
        sample.total_current_a,
        sample.cumulative_energy_wh,
        sample.cumulative_capacity_ah,
        dqdv
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paraload_common::{DurationUnit, UnitReading};

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn termination_descriptions() {
        assert_eq!(
            describe_termination(&ProfileStep::fixed(300.0, 10.0, DurationUnit::Seconds)),
            "10 seconds"
        );
        assert_eq!(
            describe_termination(&ProfileStep::until_cutoff(300.0)),
            "until voltage cutoff"
        );
    }

    #[test]
    fn unit_line_marks_missing_values() {
        let reading = UnitReading {
            voltage_v: Some(201.5),
            current_a: None,
            power_w: Some(150.0),
        };
        assert_eq!(unit_line(&reading), "V=201.50V I=--A P=150.0W");
    }
}
