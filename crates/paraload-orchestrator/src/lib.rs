//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Test orchestration: profile execution, safety monitoring, and shutdown."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Drives a master and a slave electronic load through a power profile.
//!
//! [`Orchestrator`] conditions both instruments, executes each profile step while the
//! [`monitor`] evaluates every tick, and always finishes with the safe-shutdown sequence.
//! Callers hold an [`OrchestratorHandle`]: a stop switch plus the telemetry, status, and
//! state feeds.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use paraload_common::{ShutdownReason, UnitRole};
use paraload_instrument::TransportError;
use paraload_persistence::PersistenceError;
use thiserror::Error;

pub mod alert;
pub mod executor;
pub mod feed;
mod journal;
pub mod monitor;
pub mod shutdown;
pub mod stop;

pub use alert::{AlertError, AlertSink, TracingAlertSink};
pub use executor::{ExecutorOptions, Orchestrator, OrchestratorHandle, MAX_WAIT_SLICE};
pub use feed::{Feed, StatusLine, DEFAULT_FEED_CAPACITY};
pub use monitor::{AccumulatorState, Monitor, Trip};
pub use shutdown::{ShutdownStage, SHUTDOWN_STAGES};
pub use stop::{stop_channel, StopHandle, StopSignal};

/// Reasons a run could not reach the running state, plus failures inside it that are
/// converted to [`ShutdownReason::Exception`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("recording failed: {0}")]
    Recorder(#[from] PersistenceError),
    #[error("{unit} link could not be opened: {source}")]
    Open {
        unit: UnitRole,
        #[source]
        source: TransportError,
    },
    #[error("{unit} rejected '{command}' during conditioning: {source}")]
    Conditioning {
        unit: UnitRole,
        command: String,
        #[source]
        source: TransportError,
    },
}

/// Lifecycle of the executor, published on [`OrchestratorHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorState {
    #[default]
    Idle,
    Conditioning,
    /// 1-based profile step.
    Running {
        step: usize,
    },
    ShuttingDown,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorState::Idle => f.write_str("idle"),
            ExecutorState::Conditioning => f.write_str("conditioning"),
            ExecutorState::Running { step } => write!(f, "running step {}", step),
            ExecutorState::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

/// Outcome of a run that reached the running state.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: ShutdownReason,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub ticks: u64,
    /// 1-based indices of steps whose power or load-on command failed.
    pub skipped_steps: Vec<usize>,
    pub cumulative_energy_wh: f64,
    pub cumulative_capacity_ah: f64,
    /// Shutdown commands that could not be delivered.
    pub shutdown_failures: usize,
    pub telemetry_dropped: u64,
    pub row_files: Vec<PathBuf>,
    pub narrative_files: Vec<PathBuf>,
}
