//! Applicon SEA modem driver.
//!
//! A frame is written as JSON and the device acknowledges it with an `oook`
//! message. The acknowledgement is awaited for a bounded time only: a missing
//! one is logged and the transmission still counts as finished.

use super::line::{KindOf, Protocol};
use super::runtime::{DriverCore, bump};
use super::state::ModemState;
use crate::config::AppliconConfig;
use crate::interpreter::Response;
use crate::interpreter::applicon::{AppliconInterpreter, AppliconResponse};
use crate::sim::Packet;
use std::time::Duration;

pub const MODULE: &str = "APPLICONSEAMODEM";

#[derive(Debug)]
pub struct AppliconProtocol {
    interp: AppliconInterpreter,
    ack_timeout: Duration,
    max_packet_len: usize,
}

impl Default for AppliconProtocol {
    fn default() -> Self {
        Self::from_config(&AppliconConfig::default())
    }
}

impl AppliconProtocol {
    pub fn from_config(config: &AppliconConfig) -> Self {
        Self {
            interp: AppliconInterpreter::new(),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            max_packet_len: config.max_packet_len,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }
}

impl Protocol for AppliconProtocol {
    type Interp = AppliconInterpreter;
    const MODULE: &'static str = MODULE;
    const MODEM_TIMEOUT: Duration = Duration::from_millis(500);

    fn interpreter(&self) -> &AppliconInterpreter {
        &self.interp
    }

    fn transmit(&self, core: &DriverCore, packet: Packet) {
        let frame = self.interp.build_send(&packet.payload);
        core.log.info(MODULE, format!("startTx::COMMAND_TX::{}_BYTES", packet.payload.len()));
        if !core.acquire(ModemState::Busy) {
            return;
        }
        if !core.send(&frame) {
            return;
        }
        if !core.await_release(ModemState::Busy, self.ack_timeout) && core.is_running() {
            core.log.error(MODULE, "startTx::TIMEOUT_EXPIRED::WAITING_FOR_ACK");
        }
        core.tx_ended(packet);
    }

    fn on_response(&self, core: &DriverCore, response: Response<KindOf<Self>>) {
        core.state.set(ModemState::Available);
        if response.kind == AppliconResponse::Ack {
            core.log.debug(MODULE, "updateStatus::ACK_RECEIVED");
            return;
        }
        if !response.integrity {
            bump(&core.stats.rx_corrupted);
            core.log.error(MODULE, "updateStatus::DROPPING_CORRUPTED_PACKET");
            return;
        }
        let mut payload = response.payload;
        if payload.len() > self.max_packet_len {
            core.log.error(
                MODULE,
                format!("updateStatus::PAYLOAD_TOO_LARGE_TRUNCATING::{}_TO_{}", payload.len(), self.max_packet_len),
            );
            payload.truncate(self.max_packet_len);
        }
        core.deliver(Packet::received(payload, response.rx));
    }
}
