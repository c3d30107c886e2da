//! MODA modem driver.
//!
//! MODA splits the device into two links:
//! - the signaling link carries phase changes (`DRIVER::RX_STARTED::<n>;`,
//!   `DRIVER::TX_ENDED;`, `DRIVER::CFG_ENDED;`)
//! - the data link carries raw payload bytes in both directions
//!
//! A reception is announced on the signaling link first; the data worker
//! then reads exactly the announced number of bytes from the data link.

use super::runtime::{DriverCore, DriverSettings, StatsSnapshot, bump, join_worker, spawn_worker};
use super::state::ModemState;
use super::{CommandError, CommandOutcome, DriverError, ModemEvent, UwModem};
use crate::connector::{self, Connector, SocketConnector};
use crate::interpreter::Response;
use crate::interpreter::moda::{ModaInterpreter, ModaSignal};
use crate::logging::ModemLog;
use crate::sim::Packet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

pub const MODULE: &str = "MODAMODEM";

/// Bound for every wait on the device state.
pub const MODA_TIMEOUT: Duration = Duration::from_millis(3000);

const READ_CHUNK: usize = 1024;

pub struct ModaModem {
    /// Its connector is the data link.
    core: Arc<DriverCore>,
    data: Arc<SocketConnector>,
    signal: Arc<SocketConnector>,
    interp: Arc<ModaInterpreter>,
    /// Size announced by the last `RX_STARTED`.
    rx_size: Arc<AtomicUsize>,
    address: String,
    signal_address: String,
    signal_worker: Option<JoinHandle<()>>,
    rx_worker: Option<JoinHandle<()>>,
    tx_worker: Option<JoinHandle<()>>,
}

impl ModaModem {
    pub fn new(data: Arc<SocketConnector>, signal: Arc<SocketConnector>, settings: DriverSettings, log: ModemLog) -> Self {
        let connector: Arc<dyn Connector> = data.clone();
        Self {
            core: Arc::new(DriverCore::new(MODULE, connector, settings, log)),
            data,
            signal,
            interp: Arc::new(ModaInterpreter::new()),
            rx_size: Arc::new(AtomicUsize::new(0)),
            address: String::new(),
            signal_address: String::new(),
            signal_worker: None,
            rx_worker: None,
            tx_worker: None,
        }
    }

    pub fn set_signal_address(&mut self, address: &str) {
        self.signal_address = address.to_string();
    }

    pub fn signal_address(&self) -> &str {
        &self.signal_address
    }

    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    fn spawn_workers(&mut self) -> io::Result<()> {
        let id = self.core.settings.modem_id;

        let core = Arc::clone(&self.core);
        let signal = Arc::clone(&self.signal);
        let interp = Arc::clone(&self.interp);
        let rx_size = Arc::clone(&self.rx_size);
        self.signal_worker = Some(spawn_worker(format!("moda-sig-{id}"), move || {
            core.receive_loop(signal.as_ref(), interp.as_ref(), |response| on_signal(&core, &rx_size, response));
        })?);

        let core = Arc::clone(&self.core);
        let rx_size = Arc::clone(&self.rx_size);
        self.rx_worker = Some(spawn_worker(format!("moda-rx-{id}"), move || receive_data(&core, &rx_size))?);

        let core = Arc::clone(&self.core);
        self.tx_worker = Some(spawn_worker(format!("moda-tx-{id}"), move || {
            core.transmit_loop(|packet| transmit(&core, packet));
        })?);
        Ok(())
    }
}

/// Applies a signaling message on the signaling worker.
fn on_signal(core: &DriverCore, rx_size: &AtomicUsize, response: Response<ModaSignal>) {
    match response.kind {
        ModaSignal::RxBegin => {
            let size = response.rx.map_or(0, |rx| rx.length);
            if size > core.settings.buffer_size {
                bump(&core.stats.rx_failed);
                core.log.error(
                    MODULE,
                    format!("updateStatus::RX_STARTED::{}_BYTES::EXCEEDS_BUFFER_OF_{}", size, core.settings.buffer_size),
                );
                return;
            }
            rx_size.store(size, Ordering::SeqCst);
            core.state.set(ModemState::Receiving);
            core.log.info(MODULE, format!("updateStatus::RX_STARTED::{}_BYTES", size));
        }
        ModaSignal::TxEnd | ModaSignal::CfgEnd => {
            core.state.set(ModemState::Available);
            core.log.debug(MODULE, format!("updateStatus::{:?}", response.kind));
        }
        ModaSignal::Untagged => core.log.debug(MODULE, "updateStatus::IGNORING_UNTAGGED_MESSAGE"),
    }
}

/// Data worker body: waits for an announced reception and reads it.
fn receive_data(core: &DriverCore, rx_size: &AtomicUsize) {
    while core.is_running() {
        let receiving = core
            .state
            .wait_until(MODA_TIMEOUT, |s| s == ModemState::Receiving || !core.is_running());
        if !receiving || !core.is_running() {
            continue;
        }
        let size = rx_size.load(Ordering::SeqCst);
        match read_exact(core, size) {
            Some(payload) => core.deliver(Packet::received(payload, None)),
            None if core.is_running() => {
                bump(&core.stats.rx_failed);
                core.log.error(MODULE, "receivingData::DATA_LINK_CLOSED_DURING_RECEPTION");
            }
            None => break,
        }
        core.state.set(ModemState::Available);
    }
    core.log.debug(MODULE, "receivingData::STOPPED");
}

/// Reads `size` bytes from the data link, `None` when the link goes away first.
fn read_exact(core: &DriverCore, size: usize) -> Option<Vec<u8>> {
    let mut payload = Vec::with_capacity(size.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() < size {
        if !core.is_running() {
            return None;
        }
        let want = (size - payload.len()).min(READ_CHUNK);
        match core.connector.read(&mut chunk[..want]) {
            Ok(0) => return None,
            Ok(n) => payload.extend_from_slice(&chunk[..n]),
            Err(e) if connector::is_timeout(&e) => continue,
            Err(e) => {
                core.log.error(MODULE, format!("receivingData::READ_ERROR::{}", e));
                return None;
            }
        }
    }
    Some(payload)
}

fn transmit(core: &DriverCore, packet: Packet) {
    core.log.info(MODULE, format!("startTx::SENDING::{}_BYTES", packet.payload.len()));
    if !core.acquire(ModemState::Transmitting) {
        return;
    }
    if !core.send(&packet.payload) {
        return;
    }
    // DRIVER::TX_ENDED on the signaling link releases the device.
    core.await_release(ModemState::Transmitting, core.settings.modem_timeout);
    core.tx_ended(packet);
}

impl UwModem for ModaModem {
    fn name(&self) -> &'static str {
        MODULE
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.core.is_running() {
            return Err(DriverError::AlreadyRunning);
        }
        if self.address.is_empty() || self.signal_address.is_empty() {
            self.core.log.error(MODULE, "start::ADDRESS_NOT_SET");
            return Err(DriverError::NoAddress);
        }
        if let Err(source) = self.signal.open(&self.signal_address) {
            self.core.log.error(MODULE, format!("start::SIGNAL_CONNECTION_OPEN_FAILED::{}", source));
            return Err(DriverError::Connector { which: "signal", source });
        }
        if let Err(source) = self.data.open(&self.address) {
            self.core.log.error(MODULE, format!("start::DATA_CONNECTION_OPEN_FAILED::{}", source));
            self.signal.close();
            return Err(DriverError::Connector { which: "data", source });
        }

        self.core.state.set(ModemState::Available);
        self.rx_size.store(0, Ordering::SeqCst);
        self.core.set_running(true);
        if let Err(e) = self.spawn_workers() {
            self.core.log.error(MODULE, format!("start::CANNOT_SPAWN_WORKER::{}", e));
            self.stop();
            return Err(DriverError::Spawn(e));
        }
        self.core.log.info(MODULE, format!("start::CONNECTED::{}::{}", self.address, self.signal_address));
        Ok(())
    }

    fn stop(&mut self) {
        if !self.core.is_running() && self.signal_worker.is_none() && self.rx_worker.is_none() && self.tx_worker.is_none() {
            return;
        }
        self.core.log.info(MODULE, "stop::CLOSING_CONNECTIONS");
        self.core.halt();
        self.core.close_link(self.signal.as_ref(), "SIGNAL");
        self.core.close_link(self.data.as_ref(), "DATA");
        join_worker(&self.core, self.tx_worker.take());
        join_worker(&self.core, self.signal_worker.take());
        join_worker(&self.core, self.rx_worker.take());
        self.core.flush_tx_queue();
        self.core.state.set(ModemState::Available);
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn enqueue(&self, packet: Packet) -> Result<(), Packet> {
        self.core.enqueue(packet)
    }

    fn drain_events(&self) -> Vec<ModemEvent> {
        self.core.events.drain()
    }

    fn command(&mut self, args: &[&str]) -> Result<CommandOutcome, CommandError> {
        match args {
            ["setSignalAddress", address] => {
                self.set_signal_address(address);
                Ok(CommandOutcome::Handled)
            }
            ["setSignalAddress", ..] => Err(CommandError::invalid("setSignalAddress", "expected one address")),
            [verb, ..] => Err(CommandError::Unknown(verb.to_string())),
            [] => Err(CommandError::Unknown(String::new())),
        }
    }

    fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn log(&self) -> &ModemLog {
        &self.core.log
    }

    fn state_name(&self) -> &'static str {
        self.core.state.get().as_str()
    }

    fn stats(&self) -> StatsSnapshot {
        self.core.stats()
    }
}

impl Drop for ModaModem {
    fn drop(&mut self) {
        self.stop();
    }
}
