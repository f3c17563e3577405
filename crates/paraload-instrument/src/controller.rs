//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command/response client for one electronic load."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use paraload_common::{PowerMode, UnitReading, UnitRole};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::command::{parse_numeric, LoadCommand, Measure};
use crate::transport::{Connector, LineChannel, TransportError};

/// Timing applied to every exchange with an instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolTiming {
    /// Pause after each write before the next action.
    pub settle_delay: Duration,
    /// Upper bound on a single write or line read.
    pub read_timeout: Duration,
    pub query_attempts: u32,
    pub retry_delay: Duration,
}

impl ProtocolTiming {
    pub fn with_io_timeout(io_timeout: Duration) -> Self {
        Self {
            read_timeout: io_timeout,
            ..Self::default()
        }
    }
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            read_timeout: Duration::from_secs(1),
            query_attempts: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Client for one load. Owns its link exclusively; not shared between tasks.
pub struct InstrumentController<C: Connector> {
    role: UnitRole,
    connector: C,
    timing: ProtocolTiming,
    link: Option<LineChannel<C::Stream>>,
}

impl<C: Connector> InstrumentController<C> {
    pub fn new(role: UnitRole, connector: C, timing: ProtocolTiming) -> Self {
        Self {
            role,
            connector,
            timing,
            link: None,
        }
    }

    pub fn role(&self) -> UnitRole {
        self.role
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Establish the link, bounded by `open_timeout`.
    pub async fn open(&mut self, open_timeout: Duration) -> Result<(), TransportError> {
        let endpoint = self.connector.endpoint().to_owned();
        let stream = match timeout(open_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(unit = %self.role, endpoint = %endpoint, error = %err, "unable to open instrument link");
                return Err(err);
            }
            Err(_) => {
                warn!(unit = %self.role, endpoint = %endpoint, "timed out opening instrument link");
                return Err(TransportError::OpenTimeout {
                    endpoint,
                    timeout: open_timeout,
                });
            }
        };
        self.link = Some(LineChannel::new(stream));
        info!(unit = %self.role, endpoint = %endpoint, "instrument link opened");
        Ok(())
    }

    /// Drop the link. Safe to call when already closed.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.shutdown().await {
                warn!(unit = %self.role, error = %err, "error closing instrument link");
            }
            info!(unit = %self.role, "instrument link closed");
        }
    }

    /// Write `text` and wait `settle_delay`. Failures are logged and returned, never retried.
    pub async fn send_command(
        &mut self,
        text: &str,
        settle_delay: Duration,
    ) -> Result<(), TransportError> {
        let write_timeout = self.timing.read_timeout;
        let role = self.role;
        let Some(link) = self.link.as_mut() else {
            warn!(unit = %role, command = text, "write attempted on closed link");
            return Err(TransportError::NotOpen(role.to_string()));
        };
        match timeout(write_timeout, link.write_line(text)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                warn!(unit = %role, command = text, error = %source, "write failed");
                return Err(TransportError::Write {
                    unit: role.to_string(),
                    source,
                });
            }
            Err(_) => {
                warn!(unit = %role, command = text, "write timed out");
                return Err(TransportError::WriteTimeout {
                    unit: role.to_string(),
                    timeout: write_timeout,
                });
            }
        }
        debug!(unit = %role, command = text, "sent");
        sleep(settle_delay).await;
        Ok(())
    }

    /// Read one response line within the read timeout. Empty lines, timeouts and I/O
    /// errors all yield `None`.
    pub async fn read_response(&mut self) -> Option<String> {
        let read_timeout = self.timing.read_timeout;
        let role = self.role;
        let link = self.link.as_mut()?;
        match timeout(read_timeout, link.read_line()).await {
            Ok(Ok(Some(line))) if !line.is_empty() => Some(line),
            Ok(Ok(Some(_))) => None,
            Ok(Ok(None)) => {
                warn!(unit = %role, "link closed by instrument");
                None
            }
            Ok(Err(err)) => {
                warn!(unit = %role, error = %err, "read failed");
                None
            }
            Err(_) => {
                debug!(unit = %role, "read timed out");
                None
            }
        }
    }

    /// Send `query` and parse the numeric answer, retrying up to `attempts` times.
    pub async fn query_numeric(
        &mut self,
        query: &str,
        attempts: u32,
        retry_delay: Duration,
    ) -> Option<f64> {
        for attempt in 1..=attempts.max(1) {
            if let Some(link) = self.link.as_mut() {
                link.discard_buffered();
            }
            if self
                .send_command(query, self.timing.settle_delay)
                .await
                .is_err()
            {
                sleep(retry_delay).await;
                continue;
            }
            match self.read_response().await.as_deref().map(parse_numeric) {
                Some(Some(value)) => return Some(value),
                Some(None) => {
                    debug!(unit = %self.role, query, attempt, "unparseable response")
                }
                None => debug!(unit = %self.role, query, attempt, "no response"),
            }
            sleep(retry_delay).await;
        }
        None
    }

    /// Send a typed command with the default settle delay.
    pub async fn execute(&mut self, command: LoadCommand) -> Result<(), TransportError> {
        let settle = self.timing.settle_delay;
        self.send_command(&command.to_string(), settle).await
    }

    pub async fn set_remote(&mut self) -> Result<(), TransportError> {
        self.execute(LoadCommand::Remote).await
    }

    pub async fn set_local(&mut self) -> Result<(), TransportError> {
        self.execute(LoadCommand::Local).await
    }

    pub async fn select_power_mode(&mut self, mode: PowerMode) -> Result<(), TransportError> {
        self.execute(LoadCommand::SelectMode(mode)).await
    }

    pub async fn set_power(&mut self, watts: f64) -> Result<(), TransportError> {
        self.execute(LoadCommand::SetPower(watts)).await
    }

    pub async fn set_input(&mut self, on: bool) -> Result<(), TransportError> {
        self.execute(LoadCommand::Input(on)).await
    }

    pub async fn set_load(&mut self, on: bool) -> Result<(), TransportError> {
        self.execute(LoadCommand::Load(on)).await
    }

    pub async fn set_parallel_role(&mut self, role: UnitRole) -> Result<(), TransportError> {
        self.execute(LoadCommand::ParallelRole(role)).await
    }

    pub async fn set_parallel(&mut self, on: bool) -> Result<(), TransportError> {
        self.execute(LoadCommand::Parallel(on)).await
    }

    async fn measure(&mut self, quantity: Measure) -> Option<f64> {
        let ProtocolTiming {
            query_attempts,
            retry_delay,
            ..
        } = self.timing;
        self.query_numeric(
            &LoadCommand::Measure(quantity).to_string(),
            query_attempts,
            retry_delay,
        )
        .await
    }

    pub async fn read_voltage(&mut self) -> Option<f64> {
        self.measure(Measure::Voltage).await
    }

    pub async fn read_current(&mut self) -> Option<f64> {
        self.measure(Measure::Current).await
    }

    pub async fn read_power(&mut self) -> Option<f64> {
        self.measure(Measure::Power).await
    }

    /// Voltage, current and power in that order.
    pub async fn read_all(&mut self) -> UnitReading {
        UnitReading {
            voltage_v: self.read_voltage().await,
            current_a: self.read_current().await,
            power_w: self.read_power().await,
        }
    }

    /// `*IDN?` response, if the instrument answers.
    pub async fn identify(&mut self) -> Option<String> {
        if let Some(link) = self.link.as_mut() {
            link.discard_buffered();
        }
        let settle = self.timing.settle_delay;
        self.send_command(&LoadCommand::Identify.to_string(), settle)
            .await
            .ok()?;
        self.read_response().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConnector, SimulatedLoad};

    async fn open_sim(role: UnitRole) -> (SimulatedLoad, InstrumentController<SimConnector>) {
        let load = SimulatedLoad::new(role);
        let mut controller =
            InstrumentController::new(role, load.connector(), ProtocolTiming::default());
        controller.open(Duration::from_secs(1)).await.unwrap();
        (load, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn commands_reach_the_instrument_in_order() {
        let (load, mut controller) = open_sim(UnitRole::Slave).await;
        controller.set_remote().await.unwrap();
        controller.set_parallel_role(UnitRole::Slave).await.unwrap();
        controller.set_power(150.0).await.unwrap();
        controller.set_input(true).await.unwrap();
        controller.set_load(true).await.unwrap();

        let reading = controller.read_all().await;
        assert_eq!(reading.power_w, Some(150.0));
        assert_eq!(reading.voltage_v, Some(250.0));
        assert_eq!(
            load.commands()[..5],
            [
                "SYST:REM",
                "CONF:PARA:MODE SLAVE",
                "POW 150",
                "INPUT ON",
                "LOAD ON"
            ]
        );
        let status = load.status();
        assert!(status.remote && status.load_on && status.input_on);
        controller.close().await;
        assert!(!controller.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_query_retries_then_gives_up() {
        let (load, mut controller) = open_sim(UnitRole::Master).await;
        load.set_silent(Measure::Voltage, true);
        assert_eq!(controller.read_voltage().await, None);
        let queries = load
            .commands()
            .iter()
            .filter(|line| line.as_str() == "MEAS:VOLT?")
            .count();
        assert_eq!(queries, 3);
        load.set_silent(Measure::Voltage, false);
        assert_eq!(controller.read_power().await, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn identify_returns_device_string() {
        let (_load, mut controller) = open_sim(UnitRole::Master).await;
        let idn = controller.identify().await.unwrap();
        assert!(idn.starts_with("ITECH"));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_on_closed_link_fail() {
        let load = SimulatedLoad::new(UnitRole::Master);
        let mut controller =
            InstrumentController::new(UnitRole::Master, load.connector(), ProtocolTiming::default());
        assert!(matches!(
            controller.set_remote().await,
            Err(TransportError::NotOpen(_))
        ));
        assert_eq!(controller.read_power().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_surfaces_as_write_error() {
        let (load, mut controller) = open_sim(UnitRole::Master).await;
        load.hang_up();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.read_power().await, None);
        assert!(controller.set_load(false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_is_fatal() {
        let load = SimulatedLoad::new(UnitRole::Slave);
        load.refuse_connections(true);
        let mut controller =
            InstrumentController::new(UnitRole::Slave, load.connector(), ProtocolTiming::default());
        assert!(controller.open(Duration::from_secs(1)).await.is_err());
        assert!(!controller.is_open());
    }
}
