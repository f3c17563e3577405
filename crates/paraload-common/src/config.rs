//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Test configuration document and validated run settings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::LogFormat;
use crate::telemetry::UnitRole;

fn default_master_port() -> String {
    "COM10".to_owned()
}

fn default_slave_port() -> String {
    "COM8".to_owned()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_cutoff_voltage() -> f64 {
    180.0
}

fn default_imbalance_check_enabled() -> bool {
    true
}

fn default_imbalance_limit_pct() -> f64 {
    10.0
}

fn default_imbalance_transition_pct() -> f64 {
    25.0
}

fn default_transition_duration() -> Duration {
    Duration::from_secs(120)
}

fn default_voltage_diff_limit_pct() -> f64 {
    10.0
}

fn default_recording_directory() -> PathBuf {
    PathBuf::from("target/runs")
}

fn default_record_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_rotate_interval_hours() -> f64 {
    6.0
}

fn default_alert_subject() -> String {
    "IT8514B+ Load Imbalance Alert".to_owned()
}

fn default_notify_on_completion() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// On-disk test configuration document.
///
/// The document is deliberately permissive; [`TestConfig::settings`] performs the
/// validation that turns it into the immutable [`Settings`] used for a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub instruments: InstrumentConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub profile: Vec<ProfileEntry>,
    #[serde(default)]
    pub alert: Option<AlertChannel>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`TestConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedTestConfig {
    pub config: TestConfig,
    pub source: PathBuf,
}

impl TestConfig {
    pub const ENV_CONFIG_PATH: &str = "PARALOAD_CONFIG";

    /// Load the first existing candidate, respecting the `PARALOAD_CONFIG` override.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedTestConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedTestConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedTestConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a configuration file. `.json` and `.txt` documents are read as JSON,
    /// everything else as TOML.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        let config = if is_json {
            serde_json::from_str::<TestConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            toml::from_str::<TestConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        };
        config
            .settings()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Write the document back out as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let rendered = toml::to_string_pretty(self).context("failed to render configuration")?;
        fs::write(path, rendered)
            .with_context(|| format!("unable to write config file {}", path.display()))?;
        Ok(())
    }

    /// Validate the document and build the immutable run settings.
    pub fn settings(&self) -> std::result::Result<Settings, SettingsError> {
        Settings::from_config(self)
    }
}

impl std::str::FromStr for TestConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: TestConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.settings()?;
        Ok(config)
    }
}

/// Operating mode for a run.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Drive real instruments over their serial ports.
    #[default]
    Production,
    /// Dry run against in-process simulated loads.
    Simulation,
}

impl Mode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Mode::Simulation)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "simulation" | "dry-run" => Ok(Mode::Simulation),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Constant-power selection command understood by the loads.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PowerMode {
    /// `FUNC CP`
    #[default]
    FuncCp,
    /// `FUNC POW`
    FuncPow,
    /// `MODE:CW`
    ModeCw,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default = "default_master_port")]
    pub master_port: String,
    #[serde(default = "default_slave_port")]
    pub slave_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_io_timeout", rename = "io_timeout_s")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub io_timeout: Duration,
    #[serde(default)]
    pub power_mode: PowerMode,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            master_port: default_master_port(),
            slave_port: default_slave_port(),
            baud_rate: default_baud_rate(),
            io_timeout: default_io_timeout(),
            power_mode: PowerMode::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_cutoff_voltage")]
    pub cutoff_voltage: f64,
    #[serde(default)]
    pub cutoff_safety_enabled: bool,
    #[serde(default = "default_imbalance_check_enabled")]
    pub imbalance_check_enabled: bool,
    #[serde(default = "default_imbalance_limit_pct")]
    pub imbalance_limit_pct: f64,
    #[serde(default = "default_imbalance_transition_pct")]
    pub imbalance_transition_pct: f64,
    #[serde(
        default = "default_transition_duration",
        rename = "transition_duration_s"
    )]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub transition_duration: Duration,
    #[serde(default = "default_voltage_diff_limit_pct")]
    pub voltage_diff_limit_pct: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cutoff_voltage: default_cutoff_voltage(),
            cutoff_safety_enabled: false,
            imbalance_check_enabled: default_imbalance_check_enabled(),
            imbalance_limit_pct: default_imbalance_limit_pct(),
            imbalance_transition_pct: default_imbalance_transition_pct(),
            transition_duration: default_transition_duration(),
            voltage_diff_limit_pct: default_voltage_diff_limit_pct(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_recording_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_record_interval", rename = "record_interval_s")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub record_interval: Duration,
    #[serde(default = "default_rotate_interval_hours")]
    pub rotate_interval_hours: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: default_recording_directory(),
            record_interval: default_record_interval(),
            rotate_interval_hours: default_rotate_interval_hours(),
        }
    }
}

/// Unit of a fixed-duration profile step.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    pub fn seconds(&self) -> f64 {
        match self {
            DurationUnit::Seconds => 1.0,
            DurationUnit::Minutes => 60.0,
            DurationUnit::Hours => 3600.0,
            DurationUnit::Days => 86_400.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Seconds => "seconds",
            DurationUnit::Minutes => "minutes",
            DurationUnit::Hours => "hours",
            DurationUnit::Days => "days",
        }
    }
}

/// One row of the profile as written in the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileEntry {
    pub total_power_w: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_unit: Option<DurationUnit>,
    #[serde(default)]
    pub cutoff: bool,
}

impl ProfileEntry {
    pub fn fixed(total_power_w: f64, value: f64, unit: DurationUnit) -> Self {
        Self {
            total_power_w,
            duration_value: Some(value),
            duration_unit: Some(unit),
            cutoff: false,
        }
    }

    pub fn until_cutoff(total_power_w: f64) -> Self {
        Self {
            total_power_w,
            duration_value: None,
            duration_unit: None,
            cutoff: true,
        }
    }
}

/// Optional alerting collaborator settings. Only the trigger contract is modelled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertChannel {
    #[serde(default = "default_alert_subject")]
    pub subject: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default = "default_notify_on_completion")]
    pub notify_on_completion: bool,
}

impl Default for AlertChannel {
    fn default() -> Self {
        Self {
            subject: default_alert_subject(),
            recipients: Vec::new(),
            notify_on_completion: default_notify_on_completion(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// How a profile step ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepTermination {
    /// Ends strictly on elapsed wall-clock time.
    FixedDuration { value: f64, unit: DurationUnit },
    /// Ends only when a voltage-cutoff breach is detected.
    RunUntilCutoff,
}

/// Validated profile step. Power is split evenly between the two loads at execution time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileStep {
    pub total_power_w: f64,
    pub termination: StepTermination,
}

impl ProfileStep {
    pub fn fixed(total_power_w: f64, value: f64, unit: DurationUnit) -> Self {
        Self {
            total_power_w,
            termination: StepTermination::FixedDuration { value, unit },
        }
    }

    pub fn until_cutoff(total_power_w: f64) -> Self {
        Self {
            total_power_w,
            termination: StepTermination::RunUntilCutoff,
        }
    }

    /// Power commanded to each of the two units.
    pub fn per_unit_power_w(&self) -> f64 {
        self.total_power_w / 2.0
    }

    /// Wall-clock length of a fixed-duration step; `None` for cutoff steps.
    pub fn duration(&self) -> Option<Duration> {
        match self.termination {
            StepTermination::FixedDuration { value, unit } => {
                Duration::try_from_secs_f64(value * unit.seconds()).ok()
            }
            StepTermination::RunUntilCutoff => None,
        }
    }

    pub fn is_cutoff(&self) -> bool {
        matches!(self.termination, StepTermination::RunUntilCutoff)
    }
}

/// A validated serial channel bound to one of the two loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub role: UnitRole,
    pub port: String,
}

/// Validation failures raised while building [`Settings`].
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{0} port must not be empty")]
    EmptyPort(UnitRole),
    #[error("master and slave share the same port {0}")]
    SharedPort(String),
    #[error("baud rate must be positive")]
    InvalidBaudRate,
    #[error("{field} must be a positive finite value (got {value})")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must lie in (0, 100] percent (got {value})")]
    PercentOutOfRange { field: &'static str, value: f64 },
    #[error("transition imbalance limit {transition}% is tighter than the steady limit {limit}%")]
    TransitionTighterThanLimit { transition: f64, limit: f64 },
    #[error("cutoff voltage must be a non-negative finite value (got {0})")]
    InvalidCutoffVoltage(f64),
    #[error("profile must contain at least one step")]
    EmptyProfile,
    #[error("step {step}: total power must be a non-negative finite value (got {value})")]
    InvalidPower { step: usize, value: f64 },
    #[error("step {step}: fixed-duration steps need a positive duration")]
    InvalidDuration { step: usize },
}

/// Immutable, validated settings for one test run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub master: ChannelConfig,
    pub slave: ChannelConfig,
    pub baud_rate: u32,
    pub io_timeout: Duration,
    pub power_mode: PowerMode,
    pub cutoff_voltage: f64,
    pub cutoff_safety_enabled: bool,
    pub imbalance_check_enabled: bool,
    pub imbalance_limit_pct: f64,
    pub imbalance_transition_pct: f64,
    pub transition_duration: Duration,
    pub voltage_diff_limit_pct: f64,
    pub record_interval: Duration,
    pub rotate_interval: Duration,
    pub recording_dir: PathBuf,
    pub profile: Vec<ProfileStep>,
    pub alert: Option<AlertChannel>,
}

impl Settings {
    /// Validate a configuration document.
    pub fn from_config(config: &TestConfig) -> std::result::Result<Self, SettingsError> {
        let instruments = &config.instruments;
        let master_port = instruments.master_port.trim();
        let slave_port = instruments.slave_port.trim();
        if master_port.is_empty() {
            return Err(SettingsError::EmptyPort(UnitRole::Master));
        }
        if slave_port.is_empty() {
            return Err(SettingsError::EmptyPort(UnitRole::Slave));
        }
        if master_port == slave_port {
            return Err(SettingsError::SharedPort(master_port.to_owned()));
        }
        if instruments.baud_rate == 0 {
            return Err(SettingsError::InvalidBaudRate);
        }
        positive_duration("io_timeout_s", instruments.io_timeout)?;

        let safety = &config.safety;
        if !safety.cutoff_voltage.is_finite() || safety.cutoff_voltage < 0.0 {
            return Err(SettingsError::InvalidCutoffVoltage(safety.cutoff_voltage));
        }
        percent("imbalance_limit_pct", safety.imbalance_limit_pct)?;
        percent("imbalance_transition_pct", safety.imbalance_transition_pct)?;
        percent("voltage_diff_limit_pct", safety.voltage_diff_limit_pct)?;
        if safety.imbalance_transition_pct < safety.imbalance_limit_pct {
            return Err(SettingsError::TransitionTighterThanLimit {
                transition: safety.imbalance_transition_pct,
                limit: safety.imbalance_limit_pct,
            });
        }

        let recording = &config.recording;
        positive_duration("record_interval_s", recording.record_interval)?;
        let rotate_hours = recording.rotate_interval_hours;
        let rotate_interval = if rotate_hours.is_finite() && rotate_hours > 0.0 {
            Duration::try_from_secs_f64(rotate_hours * 3600.0).map_err(|_| {
                SettingsError::NonPositive {
                    field: "rotate_interval_hours",
                    value: rotate_hours,
                }
            })?
        } else {
            return Err(SettingsError::NonPositive {
                field: "rotate_interval_hours",
                value: rotate_hours,
            });
        };

        let profile = build_profile(&config.profile)?;
        if let Some(position) = profile.iter().position(ProfileStep::is_cutoff) {
            if position + 1 < profile.len() {
                warn!(
                    step = position + 1,
                    remaining = profile.len() - position - 1,
                    "steps after a run-until-cutoff step are only reached if the run is not cut off"
                );
            }
        }

        Ok(Self {
            master: ChannelConfig {
                role: UnitRole::Master,
                port: master_port.to_owned(),
            },
            slave: ChannelConfig {
                role: UnitRole::Slave,
                port: slave_port.to_owned(),
            },
            baud_rate: instruments.baud_rate,
            io_timeout: instruments.io_timeout,
            power_mode: instruments.power_mode,
            cutoff_voltage: safety.cutoff_voltage,
            cutoff_safety_enabled: safety.cutoff_safety_enabled,
            imbalance_check_enabled: safety.imbalance_check_enabled,
            imbalance_limit_pct: safety.imbalance_limit_pct,
            imbalance_transition_pct: safety.imbalance_transition_pct,
            transition_duration: safety.transition_duration,
            voltage_diff_limit_pct: safety.voltage_diff_limit_pct,
            record_interval: recording.record_interval,
            rotate_interval,
            recording_dir: recording.directory.clone(),
            profile,
            alert: config.alert.clone(),
        })
    }

    /// Channel configuration for the requested unit.
    pub fn channel(&self, role: UnitRole) -> &ChannelConfig {
        match role {
            UnitRole::Master => &self.master,
            UnitRole::Slave => &self.slave,
        }
    }
}

fn build_profile(entries: &[ProfileEntry]) -> std::result::Result<Vec<ProfileStep>, SettingsError> {
    if entries.is_empty() {
        return Err(SettingsError::EmptyProfile);
    }
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let step = index + 1;
            if !entry.total_power_w.is_finite() || entry.total_power_w < 0.0 {
                return Err(SettingsError::InvalidPower {
                    step,
                    value: entry.total_power_w,
                });
            }
            if entry.cutoff {
                return Ok(ProfileStep::until_cutoff(entry.total_power_w));
            }
            let value = entry.duration_value.unwrap_or(0.0);
            let unit = entry.duration_unit.unwrap_or_default();
            let parsed = ProfileStep::fixed(entry.total_power_w, value, unit);
            match parsed.duration() {
                Some(duration) if value.is_finite() && !duration.is_zero() => Ok(parsed),
                _ => Err(SettingsError::InvalidDuration { step }),
            }
        })
        .collect()
}

fn positive_duration(field: &'static str, value: Duration) -> std::result::Result<(), SettingsError> {
    if value.is_zero() {
        return Err(SettingsError::NonPositive {
            field,
            value: value.as_secs_f64(),
        });
    }
    Ok(())
}

fn percent(field: &'static str, value: f64) -> std::result::Result<(), SettingsError> {
    if !value.is_finite() || value <= 0.0 || value > 100.0 {
        return Err(SettingsError::PercentOutOfRange { field, value });
    }
    Ok(())
}
