//! ahoi! modem driver.
//!
//! Every packet carries a sequence number. After a data packet the driver
//! is TX_WAITING until the modem confirms that sequence number; a missing
//! confirmation leads to up to `max-retransmissions` extra copies before the
//! driver gives up and forces itself idle. Any frame from the modem makes it
//! AVAILABLE again.
//!
//! Device queries (`queryModem batvol`, ...) are written ahead of the next
//! data packet while the modem is CONFIGURING. Their replies are logged.

use super::line::{KindOf, Protocol};
use super::runtime::{DriverCore, bump};
use super::state::{ModemState, StateCell};
use super::{CommandError, CommandOutcome};
use crate::config::AhoiConfig;
use crate::interpreter::ahoi::{AhoiCommand, AhoiInterpreter, AhoiPacket, BROADCAST, PAYLOAD_MAX_LEN};
use crate::interpreter::{Response, RxInfo};
use crate::lock;
use crate::sim::Packet;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

pub const MODULE: &str = "AHOIMODEM";

pub const DEFAULT_MAX_RETRANSMISSIONS: u32 = 0;
pub const DEFAULT_WAIT_DELIVERY_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    /// A packet went out and its confirmation has not arrived yet.
    Waiting,
}

#[derive(Debug)]
pub struct AhoiProtocol {
    interp: AhoiInterpreter,
    tx_status: StateCell<TxStatus>,
    /// Sequence number of the packet in flight, or of the next one.
    sequence: AtomicU8,
    query_sequence: AtomicU8,
    queries: Mutex<VecDeque<AhoiCommand>>,
    max_retransmissions: u32,
    wait_delivery: Duration,
}

impl Default for AhoiProtocol {
    fn default() -> Self {
        Self::from_config(&AhoiConfig::default())
    }
}

/// Header address of this modem; configuration keeps ahoi! ids below 256.
fn local_address(core: &DriverCore) -> u8 {
    (core.settings.modem_id & 0xFF) as u8
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

impl AhoiProtocol {
    pub fn from_config(config: &AhoiConfig) -> Self {
        Self {
            interp: AhoiInterpreter::new(),
            tx_status: StateCell::new(TxStatus::Idle),
            sequence: AtomicU8::new(0),
            query_sequence: AtomicU8::new(0),
            queries: Mutex::new(VecDeque::new()),
            max_retransmissions: config.max_retransmissions,
            wait_delivery: Duration::from_millis(config.wait_delivery_ms),
        }
    }

    pub fn tx_status(&self) -> TxStatus {
        self.tx_status.get()
    }

    pub fn sequence(&self) -> u8 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn pending_queries(&self) -> usize {
        lock(&self.queries).len()
    }

    fn wait_confirmation(&self, core: &DriverCore) -> bool {
        self.tx_status
            .wait_until(self.wait_delivery, |s| s == TxStatus::Idle || !core.is_running())
            && self.tx_status.get() == TxStatus::Idle
    }

    /// Writes the queued device queries, one at a time.
    fn send_queries(&self, core: &DriverCore) {
        while core.is_running() {
            let Some(cmd) = lock(&self.queries).pop_front() else {
                return;
            };
            let frame = self.interp.build_command(cmd, local_address(core), self.query_sequence.fetch_add(1, Ordering::SeqCst));
            let timeout = core.settings.modem_timeout;
            if !core
                .state
                .transition(timeout, |s| s == ModemState::Available || !core.is_running(), ModemState::Configuring)
            {
                core.log.error(MODULE, format!("startTx::MODEM_NOT_AVAILABLE::DROPPING_QUERY::{}", cmd));
                core.state.set(ModemState::Available);
                continue;
            }
            core.log.info(MODULE, format!("startTx::QUERY::{}", cmd));
            if !core.send(&frame) {
                continue;
            }
            if !core.state.wait_until(timeout, |s| s != ModemState::Configuring || !core.is_running()) {
                core.log.error(MODULE, format!("startTx::NO_REPLY::{}::FORCING_MODEM_AVAILABILITY", cmd));
                core.state.set(ModemState::Available);
            }
        }
    }

    /// Sends one data frame with its retransmissions. Returns whether the
    /// frame reached the device at all.
    fn send_data(&self, core: &DriverCore, frame: &[u8], dsn: u8) -> bool {
        if !core.acquire(ModemState::Transmitting) {
            return false;
        }
        self.tx_status.set(TxStatus::Waiting);
        core.log.debug(MODULE, format!("startTx::SENDING_PACKET::DSN::{}", dsn));
        if !core.send(frame) {
            self.tx_status.set(TxStatus::Idle);
            return false;
        }

        let mut copies = 0;
        loop {
            if self.wait_confirmation(core) {
                core.log.debug(MODULE, format!("startTx::CONFIRMED::DSN::{}", dsn));
                return true;
            }
            if !core.is_running() {
                return true;
            }
            if copies == self.max_retransmissions {
                break;
            }
            copies += 1;
            core.log.debug(MODULE, format!("startTx::SENDING_PACKET[{}]", copies));
            if !core.send(frame) {
                self.tx_status.set(TxStatus::Idle);
                return false;
            }
        }
        bump(&core.stats.tx_timeouts);
        core.log.error(
            MODULE,
            format!("startTx::NO_CONFIRMATION::DSN::{}::AFTER_{}_COPIES::FORCING_TX_STATUS_IDLE", dsn, copies + 1),
        );
        self.tx_status.set(TxStatus::Idle);
        core.state.set(ModemState::Available);
        true
    }

    fn deliver(&self, core: &DriverCore, packet: AhoiPacket) {
        let header = packet.header;
        if header.dst != local_address(core) && header.dst != BROADCAST {
            core.log.debug(MODULE, format!("updateStatus::NOT_ADDRESSED_TO_US::DST::{}", header.dst));
            return;
        }
        let footer = packet.footer.unwrap_or_default();
        core.log.debug(
            MODULE,
            format!(
                "storePacketInfo::[POWER::{}][RSSI::{}][BITERR::{}][AGC::{}/{}/{}]",
                footer.power, footer.rssi, footer.bit_errors, footer.agc_mean, footer.agc_min, footer.agc_max
            ),
        );
        let info = RxInfo {
            length: packet.payload.len(),
            source: header.src.into(),
            destination: header.dst.into(),
            rssi: footer.rssi.into(),
            integrity: 1,
            ..RxInfo::default()
        };
        core.deliver(Packet::received(packet.payload, Some(info)));
    }
}

impl Protocol for AhoiProtocol {
    type Interp = AhoiInterpreter;
    const MODULE: &'static str = MODULE;
    const MODEM_TIMEOUT: Duration = Duration::from_millis(3600);

    fn interpreter(&self) -> &AhoiInterpreter {
        &self.interp
    }

    fn transmit(&self, core: &DriverCore, packet: Packet) {
        self.send_queries(core);
        let dsn = self.sequence();
        let dst = u8::try_from(packet.mac_dest).unwrap_or(BROADCAST);
        let Some(frame) = self.interp.build_send(local_address(core), dst, dsn, &packet.payload) else {
            bump(&core.stats.tx_dropped);
            core.log.error(
                MODULE,
                format!("startTx::PAYLOAD_TOO_LARGE::{}_BYTES::MAX_{}", packet.payload.len(), PAYLOAD_MAX_LEN),
            );
            return;
        };
        let reached = self.send_data(core, &frame, dsn);
        let next = dsn.wrapping_add(1);
        self.sequence.store(next, Ordering::SeqCst);
        core.log.debug(MODULE, format!("updateSN::CURRENT_SEQ_NUM::[{}]", next));
        if reached {
            core.tx_ended(packet);
        }
    }

    fn on_response(&self, core: &DriverCore, response: Response<KindOf<Self>>) {
        let Some(packet) = AhoiPacket::decode(&response.payload).filter(|_| response.integrity) else {
            bump(&core.stats.rx_failed);
            core.log.error(MODULE, format!("receivingData::MALFORMED_FRAME::[{}]", hex(&response.payload)));
            return;
        };
        let header = packet.header;
        core.log.debug(
            MODULE,
            format!(
                "updateStatus::HEADER::[SRC::{}][DST::{}][TYP::{}][DSN::{}][LEN::{}]",
                header.src, header.dst, header.type_id, header.dsn, header.len
            ),
        );
        core.state.set(ModemState::Available);

        match packet.command_kind() {
            Some(AhoiCommand::Send) => self.deliver(core, packet),
            Some(AhoiCommand::Confirm) => {
                let expected = self.sequence();
                if header.src == local_address(core) && header.dsn == expected {
                    self.tx_status.set(TxStatus::Idle);
                } else {
                    core.log.error(
                        MODULE,
                        format!("updateStatus::WRONG_RESPONSE::[SRC::{}][DSN::{}]::EXPECTED_DSN::{}", header.src, header.dsn, expected),
                    );
                }
            }
            Some(cmd) => core.log.info(MODULE, format!("updateStatus::REPLY::{}::[{}]", cmd, hex(&packet.payload))),
            None => core.log.error(MODULE, format!("updateStatus::UNKNOWN_COMMAND_RECEIVED::TYPE::{:#04X}", header.type_id)),
        }
    }

    fn command(&self, _core: &DriverCore, args: &[&str]) -> Option<Result<CommandOutcome, CommandError>> {
        let outcome = match args {
            ["queryModem", name] => name
                .parse::<AhoiCommand>()
                .map(|cmd| {
                    lock(&self.queries).push_back(cmd);
                    CommandOutcome::Handled
                })
                .map_err(|e| CommandError::invalid("queryModem", e.to_string())),
            ["queryModem", ..] => Err(CommandError::invalid("queryModem", "expected one query name")),
            ["getSequenceNumber"] => Ok(CommandOutcome::Reply(self.sequence().to_string())),
            _ => return None,
        };
        Some(outcome)
    }

    fn reset(&self) {
        self.tx_status.set(TxStatus::Idle);
        lock(&self.queries).clear();
    }

    fn wake(&self) {
        self.tx_status.wake_all();
    }
}
