//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command set of the electronic loads and its wire serialization."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Device command definitions, serialization, and parsing.

use std::fmt;
use std::str::FromStr;

use paraload_common::{PowerMode, UnitRole};

/// Measurement queries answered with a single numeric line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    Voltage,
    Current,
    Power,
}

/// Every command the orchestrator sends to a load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadCommand {
    /// Command: `SYST:REM`
    Remote,
    /// Command: `SYST:LOC`
    Local,
    /// Command: `FUNC CP`, `FUNC POW` or `MODE:CW`
    SelectMode(PowerMode),
    /// Command: `POW <watts>`
    SetPower(f64),
    /// Command: `INPUT <ON|OFF>`
    Input(bool),
    /// Command: `LOAD <ON|OFF>`
    Load(bool),
    /// Command: `CONF:PARA:MODE <MASTER|SLAVE>`
    ParallelRole(UnitRole),
    /// Command: `CONF:PARA <ON|OFF>`
    Parallel(bool),
    /// Command: `MEAS:VOLT?`, `MEAS:CURR?` or `MEAS:POW?`
    Measure(Measure),
    /// Command: `*IDN?`
    Identify,
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

impl fmt::Display for LoadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadCommand::Remote => write!(f, "SYST:REM"),
            LoadCommand::Local => write!(f, "SYST:LOC"),
            LoadCommand::SelectMode(PowerMode::FuncCp) => write!(f, "FUNC CP"),
            LoadCommand::SelectMode(PowerMode::FuncPow) => write!(f, "FUNC POW"),
            LoadCommand::SelectMode(PowerMode::ModeCw) => write!(f, "MODE:CW"),
            LoadCommand::SetPower(watts) => write!(f, "POW {}", watts),
            LoadCommand::Input(on) => write!(f, "INPUT {}", on_off(*on)),
            LoadCommand::Load(on) => write!(f, "LOAD {}", on_off(*on)),
            LoadCommand::ParallelRole(UnitRole::Master) => write!(f, "CONF:PARA:MODE MASTER"),
            LoadCommand::ParallelRole(UnitRole::Slave) => write!(f, "CONF:PARA:MODE SLAVE"),
            LoadCommand::Parallel(on) => write!(f, "CONF:PARA {}", on_off(*on)),
            LoadCommand::Measure(Measure::Voltage) => write!(f, "MEAS:VOLT?"),
            LoadCommand::Measure(Measure::Current) => write!(f, "MEAS:CURR?"),
            LoadCommand::Measure(Measure::Power) => write!(f, "MEAS:POW?"),
            LoadCommand::Identify => write!(f, "*IDN?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command: {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

fn parse_switch(arg: &str, line: &str) -> Result<bool, UnknownCommand> {
    match arg.to_ascii_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        _ => Err(UnknownCommand(line.to_owned())),
    }
}

impl FromStr for LoadCommand {
    type Err = UnknownCommand;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let trimmed = line.trim();
        let (head, arg) = match trimmed.split_once(char::is_whitespace) {
            Some((head, arg)) => (head, arg.trim()),
            None => (trimmed, ""),
        };
        let unknown = || UnknownCommand(trimmed.to_owned());
        match (head.to_ascii_uppercase().as_str(), arg) {
            ("SYST:REM", "") => Ok(LoadCommand::Remote),
            ("SYST:LOC", "") => Ok(LoadCommand::Local),
            ("MODE:CW", "") => Ok(LoadCommand::SelectMode(PowerMode::ModeCw)),
            ("FUNC", arg) if arg.eq_ignore_ascii_case("CP") => {
                Ok(LoadCommand::SelectMode(PowerMode::FuncCp))
            }
            ("FUNC", arg) if arg.eq_ignore_ascii_case("POW") => {
                Ok(LoadCommand::SelectMode(PowerMode::FuncPow))
            }
            ("POW", arg) => arg
                .parse::<f64>()
                .map(LoadCommand::SetPower)
                .map_err(|_| unknown()),
            ("INPUT", arg) => parse_switch(arg, trimmed).map(LoadCommand::Input),
            ("LOAD", arg) => parse_switch(arg, trimmed).map(LoadCommand::Load),
            ("CONF:PARA:MODE", arg) if arg.eq_ignore_ascii_case("MASTER") => {
                Ok(LoadCommand::ParallelRole(UnitRole::Master))
            }
            ("CONF:PARA:MODE", arg) if arg.eq_ignore_ascii_case("SLAVE") => {
                Ok(LoadCommand::ParallelRole(UnitRole::Slave))
            }
            ("CONF:PARA", arg) => parse_switch(arg, trimmed).map(LoadCommand::Parallel),
            ("MEAS:VOLT?", "") => Ok(LoadCommand::Measure(Measure::Voltage)),
            ("MEAS:CURR?", "") => Ok(LoadCommand::Measure(Measure::Current)),
            ("MEAS:POW?", "") => Ok(LoadCommand::Measure(Measure::Power)),
            ("*IDN?", "") => Ok(LoadCommand::Identify),
            _ => Err(unknown()),
        }
    }
}

/// Extract the numeric value from a response line: first whitespace token, commas stripped.
pub fn parse_numeric(response: &str) -> Option<f64> {
    let token = response.split_whitespace().next()?;
    token.replace(',', "").parse::<f64>().ok()
}
