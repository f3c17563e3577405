//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process electronic load speaking the instrument line protocol."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Simulated load used for dry runs and tests.
//!
//! Each [`SimulatedLoad`] is a shared handle; [`SimConnector`] spawns a device task that
//! serves the protocol over a `tokio::io::duplex` pipe. The handle can inject faults
//! (imbalance, voltage sag, silent queries, refused connects, hang-ups) and exposes the
//! full command history for assertions.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use paraload_common::{PowerMode, UnitRole};
use parking_lot::Mutex;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::command::{LoadCommand, Measure};
use crate::transport::{Connector, LineChannel, TransportError};

const PIPE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct SimState {
    idn: String,
    remote: bool,
    mode: Option<PowerMode>,
    input_on: bool,
    load_on: bool,
    parallel_role: Option<UnitRole>,
    parallel_on: bool,
    set_power_w: f64,
    voltage_v: f64,
    discharge: Option<(f64, Instant)>,
    power_scale: f64,
    current_scale: f64,
    silent: HashSet<Measure>,
    refuse_connect: bool,
    connections: u32,
    history: Vec<String>,
}

impl SimState {
    fn voltage_now(&self) -> f64 {
        match self.discharge {
            Some((rate, since)) => {
                let sagged = self.voltage_v - rate * since.elapsed().as_secs_f64();
                sagged.max(0.0)
            }
            None => self.voltage_v,
        }
    }

    fn power_now(&self) -> f64 {
        if self.input_on && self.load_on {
            self.set_power_w * self.power_scale
        } else {
            0.0
        }
    }

    fn current_now(&self) -> f64 {
        let voltage = self.voltage_now();
        if voltage > 0.0 {
            self.power_now() / voltage * self.current_scale
        } else {
            0.0
        }
    }

    /// Apply a received line; returns the reply for queries.
    fn apply(&mut self, line: &str) -> Option<String> {
        self.history.push(line.to_owned());
        let command = match line.parse::<LoadCommand>() {
            Ok(command) => command,
            Err(err) => {
                debug!(error = %err, "simulated load ignoring command");
                return None;
            }
        };
        match command {
            LoadCommand::Remote => self.remote = true,
            LoadCommand::Local => self.remote = false,
            LoadCommand::SelectMode(mode) => self.mode = Some(mode),
            LoadCommand::SetPower(watts) => self.set_power_w = watts,
            LoadCommand::Input(on) => self.input_on = on,
            LoadCommand::Load(on) => self.load_on = on,
            LoadCommand::ParallelRole(role) => self.parallel_role = Some(role),
            LoadCommand::Parallel(on) => self.parallel_on = on,
            LoadCommand::Identify => return Some(self.idn.clone()),
            LoadCommand::Measure(quantity) => {
                if self.silent.contains(&quantity) {
                    return None;
                }
                let value = match quantity {
                    Measure::Voltage => self.voltage_now(),
                    Measure::Current => self.current_now(),
                    Measure::Power => self.power_now(),
                };
                return Some(format!("{:.4}", value));
            }
        }
        None
    }
}

struct Shared {
    state: Mutex<SimState>,
    hang_up: Notify,
}

/// Observable output state of a simulated load.
#[derive(Debug, Clone, PartialEq)]
pub struct SimStatus {
    pub remote: bool,
    pub mode: Option<PowerMode>,
    pub input_on: bool,
    pub load_on: bool,
    pub parallel_role: Option<UnitRole>,
    pub parallel_on: bool,
    pub set_power_w: f64,
}

/// Shared handle to one simulated electronic load.
#[derive(Clone)]
pub struct SimulatedLoad {
    role: UnitRole,
    shared: Arc<Shared>,
}

impl SimulatedLoad {
    pub fn new(role: UnitRole) -> Self {
        let state = SimState {
            idn: format!("ITECH Ltd.,IT8514B+,SIM-{},1.0", role.as_str().to_uppercase()),
            remote: false,
            mode: None,
            input_on: false,
            load_on: false,
            parallel_role: None,
            parallel_on: false,
            set_power_w: 0.0,
            voltage_v: 250.0,
            discharge: None,
            power_scale: 1.0,
            current_scale: 1.0,
            silent: HashSet::new(),
            refuse_connect: false,
            connections: 0,
            history: Vec::new(),
        };
        Self {
            role,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                hang_up: Notify::new(),
            }),
        }
    }

    pub fn role(&self) -> UnitRole {
        self.role
    }

    /// Connector that attaches a fresh device task to this load on every connect.
    pub fn connector(&self) -> SimConnector {
        SimConnector {
            endpoint: format!("sim://{}", self.role),
            load: self.clone(),
        }
    }

    /// Terminal voltage; restarts any configured discharge from this level.
    pub fn set_voltage(&self, volts: f64) {
        let mut state = self.shared.state.lock();
        state.voltage_v = volts;
        if let Some((rate, _)) = state.discharge {
            state.discharge = Some((rate, Instant::now()));
        }
    }

    /// Let the voltage sag linearly at `volts_per_second` from now on.
    pub fn set_discharge(&self, volts_per_second: f64) {
        let mut state = self.shared.state.lock();
        state.discharge = Some((volts_per_second, Instant::now()));
    }

    /// Scale the measured power relative to the commanded power.
    pub fn set_power_scale(&self, scale: f64) {
        self.shared.state.lock().power_scale = scale;
    }

    /// Scale the measured current independently of power.
    pub fn set_current_scale(&self, scale: f64) {
        self.shared.state.lock().current_scale = scale;
    }

    /// Stop answering `quantity` queries; the controller sees a read timeout.
    pub fn set_silent(&self, quantity: Measure, silent: bool) {
        let mut state = self.shared.state.lock();
        if silent {
            state.silent.insert(quantity);
        } else {
            state.silent.remove(&quantity);
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_connect = refuse;
    }

    /// Drop the current link from the device side.
    pub fn hang_up(&self) {
        self.shared.hang_up.notify_one();
    }

    /// Every line received, in order, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.shared.state.lock().history.clone()
    }

    pub fn connections(&self) -> u32 {
        self.shared.state.lock().connections
    }

    pub fn status(&self) -> SimStatus {
        let state = self.shared.state.lock();
        SimStatus {
            remote: state.remote,
            mode: state.mode,
            input_on: state.input_on,
            load_on: state.load_on,
            parallel_role: state.parallel_role,
            parallel_on: state.parallel_on,
            set_power_w: state.set_power_w,
        }
    }

    async fn serve(self, stream: DuplexStream) {
        let mut channel = LineChannel::new(stream);
        loop {
            let line = tokio::select! {
                _ = self.shared.hang_up.notified() => {
                    debug!(unit = %self.role, "simulated load hanging up");
                    break;
                }
                line = channel.read_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };
            if line.is_empty() {
                continue;
            }
            trace!(unit = %self.role, command = %line, "simulated load received");
            let reply = self.shared.state.lock().apply(&line);
            if let Some(reply) = reply {
                if channel.write_line(&reply).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// [`Connector`] backed by a [`SimulatedLoad`].
#[derive(Clone)]
pub struct SimConnector {
    endpoint: String,
    load: SimulatedLoad,
}

#[async_trait]
impl Connector for SimConnector {
    type Stream = DuplexStream;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<DuplexStream, TransportError> {
        {
            let mut state = self.load.shared.state.lock();
            if state.refuse_connect {
                return Err(TransportError::Open {
                    endpoint: self.endpoint.clone(),
                    reason: "connection refused".to_owned(),
                });
            }
            state.connections += 1;
        }
        let (near, far) = duplex(PIPE_CAPACITY);
        tokio::spawn(self.load.clone().serve(far));
        Ok(near)
    }
}
