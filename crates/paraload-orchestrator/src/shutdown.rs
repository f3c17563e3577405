//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Both-unit bookkeeping and the fault-tolerant safe-shutdown sequence."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use paraload_common::{ShutdownReason, UnitRole};
use paraload_instrument::{Connector, InstrumentController, LoadCommand};
use tokio::time::sleep;

use crate::journal::Journal;

/// One stage of the shutdown sequence, applied to the master and then the slave.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownStage {
    pub title: &'static str,
    pub commands: &'static [LoadCommand],
    /// Pause after each command.
    pub settle: Duration,
}

/// Power zero, loads off, parallel off, local. Order is fixed.
pub const SHUTDOWN_STAGES: [ShutdownStage; 4] = [
    ShutdownStage {
        title: "Step 1: Ramping power to zero...",
        commands: &[LoadCommand::SetPower(0.0)],
        settle: Duration::from_millis(500),
    },
    ShutdownStage {
        title: "Step 2: Turning loads OFF...",
        commands: &[LoadCommand::Load(false), LoadCommand::Input(false)],
        settle: Duration::from_millis(200),
    },
    ShutdownStage {
        title: "Step 3: Disabling parallel mode...",
        commands: &[LoadCommand::Parallel(false)],
        settle: Duration::from_millis(200),
    },
    ShutdownStage {
        title: "Step 4: Returning to LOCAL control...",
        commands: &[LoadCommand::Local],
        settle: Duration::from_millis(200),
    },
];

/// The master and slave controllers of a run.
pub(crate) struct UnitPair<C: Connector> {
    pub(crate) master: InstrumentController<C>,
    pub(crate) slave: InstrumentController<C>,
}

impl<C: Connector> UnitPair<C> {
    /// Master first.
    pub(crate) fn each_mut(&mut self) -> [&mut InstrumentController<C>; 2] {
        [&mut self.master, &mut self.slave]
    }

    pub(crate) fn get_mut(&mut self, role: UnitRole) -> &mut InstrumentController<C> {
        match role {
            UnitRole::Master => &mut self.master,
            UnitRole::Slave => &mut self.slave,
        }
    }

    pub(crate) async fn close(&mut self) {
        for unit in self.each_mut() {
            unit.close().await;
        }
    }

    /// Send `command` to both units, narrating failures. Returns the number that failed.
    pub(crate) async fn execute_each(
        &mut self,
        journal: &mut Journal,
        command: impl Fn(UnitRole) -> LoadCommand,
    ) -> usize {
        let mut failures = 0;
        for unit in self.each_mut() {
            let role = unit.role();
            let command = command(role);
            if let Err(err) = unit.execute(command).await {
                failures += 1;
                journal.note(format!("[ERROR] {}: '{}' failed: {}", role, command, err));
            }
        }
        failures
    }
}

/// Drive both units to a safe state. Every command is attempted regardless of earlier
/// failures and the sequence does not observe the stop switch.
pub(crate) async fn safe_shutdown<C: Connector>(
    units: &mut UnitPair<C>,
    journal: &mut Journal,
    reason: &ShutdownReason,
) -> usize {
    journal.note(format!("⚠ Initiating safe shutdown sequence... ({})", reason));
    let mut failures = 0;
    for stage in SHUTDOWN_STAGES.iter() {
        journal.note(format!("  {}", stage.title));
        for unit in units.each_mut() {
            let role = unit.role();
            for command in stage.commands {
                match unit.execute(*command).await {
                    Ok(()) => {
                        journal.note(format!("    ✓ {} {}", role, command));
                    }
                    Err(err) => {
                        failures += 1;
                        journal.note(format!("    ✗ [ERROR] {} {} failed: {}", role, command, err));
                    }
                }
                sleep(stage.settle).await;
            }
        }
    }
    if failures == 0 {
        journal.note("✓ Safe shutdown sequence complete.  Equipment is safe.");
    } else {
        journal.note(format!(
            "[WARNING] Safe shutdown finished with {} failed command(s); verify equipment state",
            failures
        ));
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Feed;
    use paraload_instrument::{ProtocolTiming, SimConnector, SimulatedLoad};

    async fn pair(master: &SimulatedLoad, slave: &SimulatedLoad) -> UnitPair<SimConnector> {
        let mut units = UnitPair {
            master: InstrumentController::new(
                UnitRole::Master,
                master.connector(),
                ProtocolTiming::default(),
            ),
            slave: InstrumentController::new(
                UnitRole::Slave,
                slave.connector(),
                ProtocolTiming::default(),
            ),
        };
        for unit in units.each_mut() {
            unit.open(Duration::from_secs(1)).await.unwrap();
        }
        units
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_sends_fixed_tail_to_both_units() {
        let master = SimulatedLoad::new(UnitRole::Master);
        let slave = SimulatedLoad::new(UnitRole::Slave);
        let mut units = pair(&master, &slave).await;
        let (feed, mut rx) = Feed::channel("status", 64);
        let mut journal = Journal::new(feed);

        let failures = safe_shutdown(&mut units, &mut journal, &ShutdownReason::UserRequested).await;
        assert_eq!(failures, 0);
        let expected = ["POW 0", "LOAD OFF", "INPUT OFF", "CONF:PARA OFF", "SYST:LOC"];
        assert_eq!(master.commands(), expected);
        assert_eq!(slave.commands(), expected);

        let mut last = None;
        while let Ok(line) = rx.try_recv() {
            last = Some(line.message);
        }
        assert_eq!(
            last.as_deref(),
            Some("✓ Safe shutdown sequence complete.  Equipment is safe.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dead_master_does_not_block_slave() {
        let master = SimulatedLoad::new(UnitRole::Master);
        let slave = SimulatedLoad::new(UnitRole::Slave);
        let mut units = pair(&master, &slave).await;
        units.master.close().await;
        let (feed, _rx) = Feed::channel("status", 64);
        let mut journal = Journal::new(feed);

        let failures =
            safe_shutdown(&mut units, &mut journal, &ShutdownReason::VoltageCutoff).await;
        assert_eq!(failures, 5);
        assert_eq!(slave.commands().len(), 5);
        assert_eq!(slave.commands().last().map(String::as_str), Some("SYST:LOC"));
    }
}
