//! EvoLogics S2C driver.
//!
//! Data goes out either as burst data (`AT*SEND`) or as instant messages
//! (`AT*SENDIM`). Besides the device state the driver tracks a transmission
//! state: a frame is pending from the write until the device reports its
//! fate (`SENDEND`, `DELIVERED`, `FAILED`, ...). Instant message delivery is
//! polled with `AT?DI`.

use super::line::{KindOf, Protocol};
use super::runtime::{DriverCore, bump};
use super::state::{ModemState, StateCell};
use super::{CommandError, CommandOutcome};
use crate::config::S2cConfig;
use crate::connector;
use crate::interpreter::Response;
use crate::interpreter::s2c::{S2cInterpreter, S2cResponse, parse_key_values};
use crate::lock;
use crate::sim::Packet;
use serde::Deserialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const MODULE: &str = "EVOLOGICSS2CMODEM";

/// How long a burst transmission may take to be reported.
pub const WAIT_DELIVERY_BURST: Duration = Duration::from_secs(5);
/// Pause between two `AT?DI` queries.
pub const WAIT_DELIVERY_IM: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_STATUS_QUERIES: usize = 10;
pub const DEFAULT_SOURCE_LEVEL: u8 = 3;
pub const MAX_SOURCE_LEVEL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxMode {
    Burst,
    #[default]
    Im,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    Pending,
}

#[derive(Debug)]
struct SourceLevel {
    current: u8,
    /// Requested level, written before the next data frame.
    pending: Option<u8>,
}

#[derive(Debug)]
pub struct S2cProtocol {
    interp: S2cInterpreter,
    mode: Mutex<TxMode>,
    ack: AtomicBool,
    tx_status: StateCell<TxStatus>,
    source_level: Mutex<SourceLevel>,
    max_status_queries: usize,
}

impl Default for S2cProtocol {
    fn default() -> Self {
        Self::from_config(&S2cConfig::default())
    }
}

impl S2cProtocol {
    pub fn from_config(config: &S2cConfig) -> Self {
        let pending = (config.source_level != DEFAULT_SOURCE_LEVEL).then_some(config.source_level);
        Self {
            interp: S2cInterpreter::new(),
            mode: Mutex::new(config.mode),
            ack: AtomicBool::new(config.ack),
            tx_status: StateCell::new(TxStatus::Idle),
            source_level: Mutex::new(SourceLevel {
                current: DEFAULT_SOURCE_LEVEL,
                pending,
            }),
            max_status_queries: config.max_status_queries.max(1),
        }
    }

    pub fn mode(&self) -> TxMode {
        *lock(&self.mode)
    }

    pub fn ack_enabled(&self) -> bool {
        self.ack.load(Ordering::Relaxed)
    }

    pub fn tx_status(&self) -> TxStatus {
        self.tx_status.get()
    }

    pub fn source_level(&self) -> u8 {
        lock(&self.source_level).current
    }

    /// Blocks until the transmission state is idle, `timeout` elapses or the driver stops.
    fn wait_tx_idle(&self, core: &DriverCore, timeout: Duration) -> bool {
        self.tx_status.wait_until(timeout, |s| s == TxStatus::Idle || !core.is_running()) && self.tx_status.get() == TxStatus::Idle
    }

    /// Waits up to one modem timeout for the device to answer a command.
    /// The state is left alone when it does not; the next `acquire` bounds it.
    fn wait_accepted(&self, core: &DriverCore) {
        let timeout = core.settings.modem_timeout;
        if !core.state.wait_until(timeout, |s| s != ModemState::Busy || !core.is_running()) {
            core.log.debug(MODULE, format!("startTx::NO_ANSWER_WITHIN_{}_MS", timeout.as_millis()));
        }
    }

    fn tx_idle(&self) {
        self.tx_status.set(TxStatus::Idle);
    }

    /// Writes a pending source level change.
    fn apply_source_level(&self, core: &DriverCore) {
        let Some(level) = lock(&self.source_level).pending else {
            return;
        };
        let Some(cmd) = self.interp.build_set_source_level(level) else {
            lock(&self.source_level).pending = None;
            return;
        };
        core.log.info(MODULE, format!("startTx::SETTING_SOURCE_LEVEL::{}", level));
        if !core.acquire(ModemState::Busy) || !core.send(&cmd) {
            return;
        }
        self.wait_accepted(core);
        let mut source_level = lock(&self.source_level);
        source_level.current = level;
        if source_level.pending == Some(level) {
            source_level.pending = None;
        }
    }

    /// Polls the delivery status of the last instant message.
    fn poll_delivery(&self, core: &DriverCore) {
        let query = self.interp.build_atdi();
        for _ in 0..self.max_status_queries {
            if !core.is_running() {
                return;
            }
            core.log.info(MODULE, "startTx::SENDING::AT?DI");
            if let Err(e) = connector::write_all_while(core.connector.as_ref(), &query, || core.is_running()) {
                core.log.error(MODULE, format!("startTx::FAIL_TO_WRITE_TO_DEVICE::AT?DI::{}", e));
            }
            if self.wait_tx_idle(core, WAIT_DELIVERY_IM) {
                core.log.debug(MODULE, "startTx::TX_IDLE");
                return;
            }
            core.log.debug(MODULE, "startTx::TX_PENDING");
        }
        core.log.error(MODULE, "startTx::MAX_N_STATUS_QUERIES_REACHED");
    }

    fn deliver(&self, core: &DriverCore, response: Response<S2cResponse>) {
        core.state.set(ModemState::Available);
        let integrity = response.integrity;
        let mut packet = Packet::received(response.payload, response.rx);
        if !integrity {
            packet.error = true;
            bump(&core.stats.rx_corrupted);
            core.log.error(MODULE, "updateStatus::RECEIVED_CORRUPTED_PACKET");
        }
        core.deliver(packet);
    }
}

impl Protocol for S2cProtocol {
    type Interp = S2cInterpreter;
    const MODULE: &'static str = MODULE;
    const MODEM_TIMEOUT: Duration = Duration::from_millis(210);

    fn interpreter(&self) -> &S2cInterpreter {
        &self.interp
    }

    fn transmit(&self, core: &DriverCore, packet: Packet) {
        self.apply_source_level(core);

        let mode = self.mode();
        let cmd = match mode {
            TxMode::Im => self.interp.build_send_im(&packet.payload, packet.mac_dest, self.ack_enabled()),
            TxMode::Burst => self.interp.build_send(&packet.payload, packet.mac_dest),
        };
        core.log.info(MODULE, format!("startTx::COMMAND_TX::{}", String::from_utf8_lossy(&cmd).trim_end()));

        if !core.acquire(ModemState::Busy) {
            return;
        }
        self.tx_status.set(TxStatus::Pending);
        if !core.send(&cmd) {
            self.tx_idle();
            return;
        }
        self.wait_accepted(core);

        match mode {
            TxMode::Im => self.poll_delivery(core),
            TxMode::Burst => {
                if !self.wait_tx_idle(core, WAIT_DELIVERY_BURST) && core.is_running() {
                    core.log.error(MODULE, "startTx::BURST_NOT_REPORTED_AS_SENT");
                }
            }
        }
        self.tx_idle();
        core.tx_ended(packet);
    }

    fn on_response(&self, core: &DriverCore, response: Response<KindOf<Self>>) {
        match response.kind {
            S2cResponse::Recv | S2cResponse::RecvIm => self.deliver(core, response),
            S2cResponse::Empty
            | S2cResponse::Delivered
            | S2cResponse::DropCount
            | S2cResponse::WrongAddress
            | S2cResponse::ConnectionClosed
            | S2cResponse::Failed
            | S2cResponse::SendEnd => {
                core.state.set(ModemState::Available);
                self.tx_idle();
            }
            S2cResponse::Busy | S2cResponse::BufferFull => {
                core.state.set(ModemState::Busy);
            }
            S2cResponse::PhyOff => {
                core.state.set(ModemState::Quit);
            }
            S2cResponse::Internal => {
                core.state.set(ModemState::Reset);
            }
            S2cResponse::InitNoise => {
                core.state.set(ModemState::Noise);
            }
            S2cResponse::InitDeaf => {
                core.state.set(ModemState::Deaf);
            }
            S2cResponse::RecvFailed => {
                bump(&core.stats.rx_failed);
                core.log.info(MODULE, "updateStatus::FAILED_RX");
                core.state.set(ModemState::Available);
            }
            S2cResponse::CurrSettings | S2cResponse::ModemStatus => {
                let settings = parse_key_values(&response.payload);
                let level = settings.get("Source Level").and_then(|v| v.parse::<u8>().ok());
                if let Some(level) = level {
                    lock(&self.source_level).current = level;
                }
                core.log.info(MODULE, format!("updateStatus::{:?}::{:?}", response.kind, settings));
                core.state.set(ModemState::Available);
            }
            _ => {
                core.state.set(ModemState::Available);
            }
        }
        core.log.debug(MODULE, format!("updateStatus::TO::{}", core.state.get()));
    }

    fn command(&self, core: &DriverCore, args: &[&str]) -> Option<Result<CommandOutcome, CommandError>> {
        let outcome = match args {
            ["setBurstMode"] => {
                *lock(&self.mode) = TxMode::Burst;
                Ok(CommandOutcome::Handled)
            }
            ["setIMMode"] => {
                *lock(&self.mode) = TxMode::Im;
                Ok(CommandOutcome::Handled)
            }
            ["enableIMAck"] => {
                self.ack.store(true, Ordering::Relaxed);
                Ok(CommandOutcome::Handled)
            }
            ["disableIMAck"] => {
                self.ack.store(false, Ordering::Relaxed);
                Ok(CommandOutcome::Handled)
            }
            ["setSourceLevel", level] => match level.parse::<u8>() {
                Ok(level) if level <= MAX_SOURCE_LEVEL => {
                    lock(&self.source_level).pending = Some(level);
                    Ok(CommandOutcome::Handled)
                }
                _ => Err(CommandError::invalid("setSourceLevel", format!("`{}` is not a level between 0 and {}", level, MAX_SOURCE_LEVEL))),
            },
            ["getSourceLevel"] => Ok(CommandOutcome::Reply(self.source_level().to_string())),
            ["getRxFailed"] => Ok(CommandOutcome::Reply(core.stats().rx_failed.to_string())),
            _ => return None,
        };
        Some(outcome)
    }

    fn reset(&self) {
        self.tx_idle();
    }

    fn wake(&self) {
        self.tx_status.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SocketConnector;
    use crate::driver::line::LineModem;
    use crate::driver::line::testing::{FakeDevice, wait_for};
    use crate::driver::runtime::DriverSettings;
    use crate::driver::{ModemEvent, UwModem};
    use crate::logging::{LogLevel, ModemLog};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);

    fn s2c_modem(address: &str, config: &S2cConfig) -> LineModem<S2cProtocol> {
        let mut modem = LineModem::with_socket(
            S2cProtocol::from_config(config),
            Arc::new(SocketConnector::default()),
            DriverSettings::new(3, S2cProtocol::MODEM_TIMEOUT),
            ModemLog::new(3, LogLevel::Debug),
        );
        modem.set_address(address);
        modem
    }

    fn idle_core() -> DriverCore {
        DriverCore::new(
            MODULE,
            Arc::new(SocketConnector::default()),
            DriverSettings::new(3, S2cProtocol::MODEM_TIMEOUT),
            ModemLog::new(3, LogLevel::Error),
        )
    }

    #[test]
    fn test_burst_transmission() {
        let device = FakeDevice::listen();
        let config = S2cConfig {
            mode: TxMode::Burst,
            ..S2cConfig::default()
        };
        let mut modem = s2c_modem(&device.address, &config);
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.enqueue(Packet::outbound(b"hello".to_vec(), 7)).unwrap();
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT*SEND,5,7,hello\n");
        stream.send(b"OK\r\n");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(modem.stats().tx_sent, 0, "burst must wait for SENDEND");
        stream.send(b"SENDEND,7,burst,1234,2\r\n");

        assert!(wait_for(WAIT, || modem.stats().tx_sent == 1));
        assert_eq!(modem.stats().tx_timeouts, 0);
        assert!(matches!(&modem.drain_events()[0], ModemEvent::TxEnded(p) if p.payload == b"hello"));
        modem.stop();
    }

    #[test]
    fn test_late_ok_is_not_a_timeout() {
        let device = FakeDevice::listen();
        let config = S2cConfig {
            mode: TxMode::Burst,
            ..S2cConfig::default()
        };
        let mut modem = s2c_modem(&device.address, &config);
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.enqueue(Packet::outbound(b"slow".to_vec(), 4)).unwrap();
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT*SEND,4,4,slow\n");
        std::thread::sleep(S2cProtocol::MODEM_TIMEOUT * 2);
        stream.send(b"OK\r\nSENDEND,4,burst,1234,2\r\n");

        assert!(wait_for(WAIT, || modem.stats().tx_sent == 1));
        assert_eq!(modem.stats().tx_timeouts, 0);
        assert_eq!(modem.stats().tx_dropped, 0);
        assert_eq!(modem.state_name(), "AVAILABLE");
        modem.stop();
    }

    #[test]
    fn test_instant_message_polls_delivery() {
        let device = FakeDevice::listen();
        let config = S2cConfig {
            ack: true,
            ..S2cConfig::default()
        };
        let mut modem = s2c_modem(&device.address, &config);
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.enqueue(Packet::outbound(b"hi".to_vec(), 3)).unwrap();
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT*SENDIM,2,3,ack,hi\n");
        stream.send(b"OK\r\n");
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT?DI\n");
        stream.send(b"DELIVERING\r\n");
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT?DI\n");
        stream.send(b"EMPTY\r\n");

        assert!(wait_for(WAIT, || modem.stats().tx_sent == 1));
        assert_eq!(modem.protocol().tx_status(), TxStatus::Idle);
        assert_eq!(modem.state_name(), "AVAILABLE");
        modem.stop();
    }

    #[test]
    fn test_reception_and_failed_reception() {
        let device = FakeDevice::listen();
        let mut modem = s2c_modem(&device.address, &S2cConfig::default());
        modem.start().unwrap();
        let mut stream = device.accept();

        stream.send(b"RECVFAILED,-12,20,0.0\r\nRECV,5,10,20,1200,50,1,3,2.5,he");
        std::thread::sleep(Duration::from_millis(30));
        stream.send(b"llo\r\n");

        assert!(wait_for(WAIT, || modem.stats().rx_delivered == 1));
        let events = modem.drain_events();
        let ModemEvent::Received(packet) = &events[0] else {
            panic!("expected a reception");
        };
        assert_eq!(packet.payload, b"hello");
        let info = packet.rx.as_ref().unwrap();
        assert_eq!((info.source, info.destination, info.bitrate), (10, 20, Some(1200)));
        assert!(!packet.error);
        assert_eq!(modem.command(&["getRxFailed"]), Ok(CommandOutcome::Reply("1".into())));
        modem.stop();
    }

    #[test]
    fn test_source_level_is_written_before_next_frame() {
        let device = FakeDevice::listen();
        let mut modem = s2c_modem(&device.address, &S2cConfig::default());
        assert_eq!(modem.command(&["setSourceLevel", "1"]), Ok(CommandOutcome::Handled));
        assert!(matches!(modem.command(&["setSourceLevel", "9"]), Err(CommandError::Invalid { .. })));
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.enqueue(Packet::outbound(b"x".to_vec(), 2)).unwrap();
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT!L1\n");
        stream.send(b"OK\r\n");
        assert_eq!(stream.read_until(b"\n", WAIT).unwrap(), b"AT*SENDIM,1,2,noack,x\n");
        assert_eq!(modem.command(&["getSourceLevel"]), Ok(CommandOutcome::Reply("1".into())));
        modem.stop();
    }

    #[test]
    fn test_response_state_mapping() {
        let protocol = S2cProtocol::default();
        let core = idle_core();
        for (kind, expected) in [
            (S2cResponse::PhyOff, ModemState::Quit),
            (S2cResponse::Internal, ModemState::Reset),
            (S2cResponse::BufferFull, ModemState::Busy),
            (S2cResponse::InitDeaf, ModemState::Deaf),
            (S2cResponse::InitNoise, ModemState::Noise),
            (S2cResponse::InitListen, ModemState::Available),
            (S2cResponse::Busy, ModemState::Busy),
            (S2cResponse::Bitrate, ModemState::Available),
        ] {
            protocol.on_response(&core, Response::new(kind, 0, 0));
            assert_eq!(core.state.get(), expected, "{:?}", kind);
        }

        protocol.tx_status.set(TxStatus::Pending);
        protocol.on_response(&core, Response::new(S2cResponse::Delivering, 0, 0));
        assert_eq!(protocol.tx_status(), TxStatus::Pending);
        protocol.on_response(&core, Response::new(S2cResponse::Delivered, 0, 0));
        assert_eq!(protocol.tx_status(), TxStatus::Idle);
    }

    #[test]
    fn test_settings_listing_updates_source_level() {
        let protocol = S2cProtocol::default();
        let core = idle_core();
        let listing = b"Source Level: 2\r\nSource Control: 0\r\nGain: 0".to_vec();
        protocol.on_response(&core, Response::new(S2cResponse::CurrSettings, 0, 0).with_payload(listing));
        assert_eq!(protocol.source_level(), 2);
    }

    #[test]
    fn test_mode_commands() {
        let protocol = S2cProtocol::default();
        let core = idle_core();
        assert_eq!(protocol.mode(), TxMode::Im);
        assert_eq!(protocol.command(&core, &["setBurstMode"]), Some(Ok(CommandOutcome::Handled)));
        assert_eq!(protocol.mode(), TxMode::Burst);
        protocol.command(&core, &["enableIMAck"]);
        assert!(protocol.ack_enabled());
        protocol.command(&core, &["disableIMAck"]);
        assert!(!protocol.ack_enabled());
        assert!(protocol.command(&core, &["setModemAddress", "x"]).is_none());
    }
}
