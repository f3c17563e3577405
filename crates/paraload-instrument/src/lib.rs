//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Electronic-load instrument client, serial transport, and simulator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Instrument layer for the paralleled electronic loads.
//!
//! [`InstrumentController`] speaks the newline-terminated ASCII protocol over any
//! [`Connector`]: a real serial port ([`SerialConnector`]) or an in-process
//! [`SimulatedLoad`].

pub mod command;
pub mod controller;
pub mod sim;
pub mod transport;

pub use command::{parse_numeric, LoadCommand, Measure, UnknownCommand};
pub use controller::{InstrumentController, ProtocolTiming};
pub use sim::{SimConnector, SimStatus, SimulatedLoad};
pub use transport::{Connector, LineChannel, SerialConnector, TransportError};
