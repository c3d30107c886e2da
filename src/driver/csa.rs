//! CSA modem driver.
//!
//! The device gives no transmit confirmation: it is AVAILABLE again as soon
//! as the `PACKET` frame has been written.

use super::line::{KindOf, Protocol};
use super::runtime::DriverCore;
use super::state::ModemState;
use crate::interpreter::Response;
use crate::interpreter::csa::CsaInterpreter;
use crate::sim::Packet;
use std::time::Duration;

pub const MODULE: &str = "MODEMCSA";

#[derive(Debug, Default)]
pub struct CsaProtocol {
    interp: CsaInterpreter,
}

impl CsaProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for CsaProtocol {
    type Interp = CsaInterpreter;
    const MODULE: &'static str = MODULE;
    const MODEM_TIMEOUT: Duration = Duration::from_millis(210);

    fn interpreter(&self) -> &CsaInterpreter {
        &self.interp
    }

    fn transmit(&self, core: &DriverCore, packet: Packet) {
        let frame = self.interp.build_send(&packet.payload);
        core.log.info(MODULE, format!("startTx::COMMAND_TX::{}", String::from_utf8_lossy(&frame)));
        if !core.acquire(ModemState::Busy) {
            return;
        }
        if !core.send(&frame) {
            return;
        }
        core.state.set(ModemState::Available);
        core.tx_ended(packet);
    }

    fn on_response(&self, core: &DriverCore, response: Response<KindOf<Self>>) {
        core.deliver(Packet::received(response.payload, None));
    }
}
