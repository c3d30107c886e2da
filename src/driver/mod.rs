//! Modem drivers.
//!
//! A driver owns the device link and runs its I/O on dedicated worker
//! threads. It never calls into the simulator: everything the simulation
//! must see is queued as a [`ModemEvent`] and drained by the periodic tick
//! through [`UwModem::drain_events`].
//!
//! ## Variants
//!
//! - [`s2c::S2cProtocol`]: EvoLogics S2C, burst or instant messages
//! - [`csa::CsaProtocol`]: `PACKET` framed modem, no transmit confirmation
//! - [`applicon::AppliconProtocol`]: Applicon SEA JSON modem with acknowledgements
//! - [`ahoi::AhoiProtocol`]: ahoi! binary packets with confirmations
//! - [`moda::ModaModem`]: MODA, separate signaling and data links
//!
//! All but MODA share the generic single-link [`line::LineModem`].

pub mod ahoi;
pub mod applicon;
pub mod buffer;
pub mod csa;
pub mod line;
pub mod moda;
pub mod queue;
pub mod runtime;
pub mod s2c;
pub mod state;

pub use self::line::{LineModem, Protocol};
pub use self::moda::ModaModem;
pub use self::queue::ModemEvent;
pub use self::runtime::{DriverCore, DriverSettings, StatsSnapshot};
pub use self::state::ModemState;

use crate::config::{LinkKind, ModemConfig, ModemKind};
use crate::connector::{Connector, ConnectorError, Role, SerialConnector, SocketConnector};
use crate::logging::ModemLog;
use crate::sim::Packet;
use anyhow::Context;
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("modem address not set")]
    NoAddress,
    #[error("cannot open the {which} link")]
    Connector {
        which: &'static str,
        #[source]
        source: ConnectorError,
    },
    #[error("driver is already running")]
    AlreadyRunning,
    #[error("cannot spawn a worker thread")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("invalid arguments for `{verb}`: {reason}")]
    Invalid { verb: String, reason: String },
    #[error("`{0}` is only accepted while the driver is stopped")]
    WhileRunning(String),
    #[error("`{verb}` failed: {reason}")]
    Failed { verb: String, reason: String },
}

impl CommandError {
    pub(crate) fn invalid(verb: &str, reason: impl Into<String>) -> Self {
        CommandError::Invalid {
            verb: verb.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Handled,
    /// The command produced a value for the caller.
    Reply(String),
}

/// Interface every driver offers to the simulation side.
pub trait UwModem: Send {
    /// Module name used in log lines.
    fn name(&self) -> &'static str;

    /// Opens the device link and spawns the workers.
    fn start(&mut self) -> Result<(), DriverError>;

    /// Stops and joins every worker. Safe to call repeatedly.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Queues a packet for transmission without blocking. A full queue
    /// hands the packet back.
    fn enqueue(&self, packet: Packet) -> Result<(), Packet>;

    /// Pending events in the order the workers produced them.
    fn drain_events(&self) -> Vec<ModemEvent>;

    /// Driver specific command. `args[0]` is the verb.
    fn command(&mut self, args: &[&str]) -> Result<CommandOutcome, CommandError>;

    /// Device address used by the next [`UwModem::start`].
    fn set_address(&mut self, address: &str);

    fn address(&self) -> &str;

    fn log(&self) -> &ModemLog;

    fn state_name(&self) -> &'static str;

    fn stats(&self) -> StatsSnapshot;
}

fn log_for(config: &ModemConfig) -> ModemLog {
    let log = ModemLog::new(config.id, config.log_level);
    log.set_suffix(&config.log_suffix);
    log.set_dir(config.log_dir.clone());
    log
}

fn socket_for(config: &ModemConfig) -> Arc<SocketConnector> {
    let role = if config.server { Role::Server } else { Role::Client };
    let socket = SocketConnector::new(config.transport, role);
    socket.set_read_timeout(config.read_timeout());
    Arc::new(socket)
}

fn line_modem<P: Protocol>(config: &ModemConfig, protocol: P) -> anyhow::Result<Box<dyn UwModem>> {
    let settings = config.driver_settings(P::MODEM_TIMEOUT);
    let log = log_for(config);
    let mut modem = match config.link {
        LinkKind::Socket => LineModem::with_socket(protocol, socket_for(config), settings, log),
        LinkKind::Serial => {
            let serial: Arc<dyn Connector> = Arc::new(SerialConnector::new());
            LineModem::with_connector(protocol, serial, settings, log)
        }
    };
    modem.set_address(&config.address);
    Ok(Box::new(modem))
}

/// Builds the driver described by `config`, ready to be started.
pub fn build_modem(config: &ModemConfig) -> anyhow::Result<Box<dyn UwModem>> {
    config.validate().context("invalid modem configuration")?;
    match config.kind {
        ModemKind::S2c => line_modem(config, s2c::S2cProtocol::from_config(&config.s2c)),
        ModemKind::Csa => line_modem(config, csa::CsaProtocol::new()),
        ModemKind::Applicon => line_modem(config, applicon::AppliconProtocol::from_config(&config.applicon)),
        ModemKind::Ahoi => line_modem(config, ahoi::AhoiProtocol::from_config(&config.ahoi)),
        ModemKind::Moda => {
            let signal_address = config
                .signal_address
                .clone()
                .context("a MODA modem needs `signal-address`")?;
            let settings = config.driver_settings(moda::MODA_TIMEOUT);
            let mut modem = ModaModem::new(socket_for(config), socket_for(config), settings, log_for(config));
            modem.set_address(&config.address);
            modem.set_signal_address(&signal_address);
            Ok(Box::new(modem))
        }
    }
}
