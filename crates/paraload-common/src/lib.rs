//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared settings, telemetry types, and logging for paraload."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the paraload workspace: configuration loading and
//! validation, the telemetry data model, and tracing initialisation.

pub mod config;
pub mod logging;
pub mod telemetry;

pub use config::{
    AlertChannel, ChannelConfig, DurationUnit, InstrumentConfig, LoadedTestConfig, LoggingConfig,
    Mode, PowerMode, ProfileEntry, ProfileStep, RecordingConfig, SafetyConfig, Settings,
    SettingsError, StepTermination, TestConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use telemetry::{
    format_timestamp, Quantity, ShutdownReason, TelemetrySample, UnitReading, UnitRole,
};
