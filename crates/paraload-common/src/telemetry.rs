//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry data model shared by the monitor, recorder, and feed."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};

/// Which of the two paralleled loads a value belongs to.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UnitRole {
    Master,
    Slave,
}

impl UnitRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitRole::Master => "master",
            UnitRole::Slave => "slave",
        }
    }
}

impl fmt::Display for UnitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measured quantity; used to label missing readings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Quantity {
    Voltage,
    Current,
    Power,
}

impl Quantity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
        }
    }
}

/// Raw readings from one unit for a single tick. `None` means the query failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitReading {
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub power_w: Option<f64>,
}

impl UnitReading {
    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::Voltage => self.voltage_v,
            Quantity::Current => self.current_a,
            Quantity::Power => self.power_w,
        }
    }

    /// Quantities whose query produced no value.
    pub fn missing(&self) -> impl Iterator<Item = Quantity> + '_ {
        [Quantity::Voltage, Quantity::Current, Quantity::Power]
            .into_iter()
            .filter(|quantity| self.get(*quantity).is_none())
    }
}

/// Immutable snapshot of one tick, written to the row file and published on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Local>,
    pub relative_s: f64,
    pub step_index: usize,
    pub requested_total_power_w: f64,
    pub master: UnitReading,
    pub slave: UnitReading,
    pub total_power_w: f64,
    pub total_current_a: f64,
    pub avg_voltage_v: f64,
    pub power_imbalance_pct: f64,
    pub current_imbalance_pct: f64,
    pub voltage_imbalance_pct: f64,
    pub cumulative_energy_wh: f64,
    pub cumulative_capacity_ah: f64,
    pub dqdv_ah_per_v: f64,
    pub dqdv_at_voltage_v: f64,
    pub dqdv_valid: bool,
}

impl TelemetrySample {
    /// RFC 3339 timestamp with millisecond precision.
    pub fn timestamp_rfc3339(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Why a run left the running state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    UserRequested,
    PowerImbalance,
    CurrentImbalance,
    VoltageImbalance,
    VoltageCutoff,
    Exception(String),
    ProfileCompleted,
}

impl ShutdownReason {
    /// Stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ShutdownReason::UserRequested => "user_requested",
            ShutdownReason::PowerImbalance => "power_imbalance",
            ShutdownReason::CurrentImbalance => "current_imbalance",
            ShutdownReason::VoltageImbalance => "voltage_imbalance",
            ShutdownReason::VoltageCutoff => "voltage_cutoff",
            ShutdownReason::Exception(_) => "exception",
            ShutdownReason::ProfileCompleted => "profile_completed",
        }
    }

    /// Safety trips, as opposed to stops and normal completion.
    pub fn is_trip(&self) -> bool {
        matches!(
            self,
            ShutdownReason::PowerImbalance
                | ShutdownReason::CurrentImbalance
                | ShutdownReason::VoltageImbalance
                | ShutdownReason::VoltageCutoff
        )
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserRequested => f.write_str("Stop requested by user"),
            ShutdownReason::PowerImbalance => f.write_str("Power imbalance"),
            ShutdownReason::CurrentImbalance => f.write_str("Current imbalance"),
            ShutdownReason::VoltageImbalance => f.write_str("Voltage imbalance"),
            ShutdownReason::VoltageCutoff => f.write_str("Voltage cutoff"),
            ShutdownReason::Exception(message) => write!(f, "Exception: {}", message),
            ShutdownReason::ProfileCompleted => f.write_str("Profile completed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_lists_absent_quantities() {
        let reading = UnitReading {
            voltage_v: Some(200.0),
            current_a: None,
            power_w: None,
        };
        let missing: Vec<_> = reading.missing().collect();
        assert_eq!(missing, vec![Quantity::Current, Quantity::Power]);
    }

    #[test]
    fn reason_labels_and_trips() {
        assert_eq!(ShutdownReason::VoltageCutoff.label(), "voltage_cutoff");
        assert!(ShutdownReason::PowerImbalance.is_trip());
        assert!(!ShutdownReason::UserRequested.is_trip());
        assert_eq!(
            ShutdownReason::Exception("boom".into()).to_string(),
            "Exception: boom"
        );
    }
}
