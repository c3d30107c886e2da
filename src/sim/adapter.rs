//! Glue between a driver and the host simulator.
//!
//! Everything here runs on the simulation thread. Packets from the driver
//! reach the simulator only through [`ModemAdapter::check_events`], which the
//! host calls once per period.

use super::{Direction, Packet, PhysicalLayerPort};
use crate::config::DEFAULT_PERIOD;
use crate::driver::{CommandError, CommandOutcome, DriverError, ModemEvent, UwModem};
use crate::logging::LogLevel;
use log::{debug, warn};

/// Delay applied when handing a packet to the layer above.
pub const UP_DELAY: f64 = 0.01;

const MODULE: &str = "UWMODEM";

pub struct ModemAdapter<P: PhysicalLayerPort> {
    modem: Box<dyn UwModem>,
    port: P,
    period: f64,
}

impl<P: PhysicalLayerPort> ModemAdapter<P> {
    pub fn new(modem: Box<dyn UwModem>, port: P) -> Self {
        Self {
            modem,
            port,
            period: DEFAULT_PERIOD,
        }
    }

    pub fn with_period(mut self, period: f64) -> Self {
        self.period = period;
        self
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn modem(&self) -> &dyn UwModem {
        self.modem.as_ref()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Entry point for packets coming from the simulator.
    pub fn recv(&mut self, mut packet: Packet) {
        match packet.direction {
            Direction::Up => {
                self.port.notify_start_rx(&packet);
                self.port.send_up(packet, UP_DELAY);
            }
            Direction::Down => {
                if !self.modem.is_running() {
                    self.modem.log().error(MODULE, format!("recv::MODEM_STOPPED::FREEING_PACKET::UID::{}", packet.uid));
                    self.port.free(packet);
                    return;
                }
                let now = self.port.now();
                packet.phy.pr = 0.0;
                packet.phy.pn = 0.0;
                packet.phy.pi = 0.0;
                packet.phy.tx_time = now;
                packet.phy.rx_time = now;
                packet.phy.src_position = self.port.position();
                if let Err(packet) = self.modem.enqueue(packet) {
                    self.port.free(packet);
                }
            }
        }
    }

    pub fn start(&mut self) -> Result<(), DriverError> {
        self.modem.start()
    }

    pub fn stop(&mut self) {
        self.modem.stop();
    }

    /// Base verbs first, everything else goes to the driver.
    pub fn command(&mut self, args: &[&str]) -> Result<CommandOutcome, CommandError> {
        let outcome = match args {
            ["start"] => self
                .start()
                .map(|()| CommandOutcome::Handled)
                .map_err(|e| CommandError::Failed {
                    verb: "start".to_string(),
                    reason: e.to_string(),
                }),
            ["stop"] => {
                self.stop();
                Ok(CommandOutcome::Handled)
            }
            ["setModemAddress", address] => {
                self.modem.set_address(address);
                Ok(CommandOutcome::Handled)
            }
            ["setLogSuffix", suffix] => {
                self.modem.log().set_suffix(suffix);
                Ok(CommandOutcome::Handled)
            }
            ["setLogLevel", level] => level
                .parse::<LogLevel>()
                .map(|level| {
                    self.modem.log().set_level(level);
                    CommandOutcome::Handled
                })
                .map_err(|e| CommandError::invalid("setLogLevel", e.to_string())),
            ["setModemAddress" | "setLogSuffix" | "setLogLevel", ..] => Err(CommandError::invalid(args[0], "expected one argument")),
            _ => self.modem.command(args),
        };
        if let Err(e) = &outcome {
            warn!("{}: {}", self.modem.name(), e);
        }
        outcome
    }

    /// Drains the driver's events into the simulator and returns the delay
    /// until the next call.
    pub fn check_events(&mut self) -> f64 {
        self.modem.log().set_sim_time(self.port.now());
        for event in self.modem.drain_events() {
            match event {
                ModemEvent::Received(packet) => {
                    debug!("{}: delivering packet {} ({} bytes)", self.modem.name(), packet.uid, packet.payload.len());
                    self.port.notify_start_rx(&packet);
                    self.port.send_up(packet, UP_DELAY);
                }
                ModemEvent::TxEnded(packet) => {
                    self.port.notify_end_tx(&packet);
                    self.port.free(packet);
                }
            }
        }
        self.period
    }
}

impl<P: PhysicalLayerPort> Drop for ModemAdapter<P> {
    fn drop(&mut self) {
        self.modem.stop();
    }
}
