//! State shared by a driver's worker threads.
//!
//! [`DriverCore`] owns the device link, the state machine and both queues.
//! It is wrapped in an `Arc` and handed to each worker. The worker loops only
//! ever touch the core: simulator-side objects are reached exclusively
//! through [`ModemEvent`]s drained on the simulation thread.

use super::buffer::RxBuffer;
use super::queue::{EventQueue, ModemEvent, TxQueue};
use super::state::{ModemState, StateCell};
use crate::connector::{self, Connector};
use crate::interpreter::{Interpreter, ParseOutcome, Response};
use crate::logging::ModemLog;
use crate::sim::Packet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause after a hard read error before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Sizing and timing of a driver instance.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub modem_id: u32,
    pub buffer_size: usize,
    pub max_read_size: usize,
    pub tx_queue_capacity: usize,
    /// Upper bound for every wait on the device state.
    pub modem_timeout: Duration,
}

impl DriverSettings {
    pub fn new(modem_id: u32, modem_timeout: Duration) -> Self {
        Self {
            modem_id,
            buffer_size: super::buffer::DEFAULT_BUFFER_SIZE,
            max_read_size: super::buffer::DEFAULT_MAX_READ,
            tx_queue_capacity: super::queue::DEFAULT_TX_QUEUE_CAPACITY,
            modem_timeout,
        }
    }
}

/// Counters updated by the workers.
#[derive(Debug, Default)]
pub struct DriverStats {
    pub tx_sent: AtomicU64,
    pub tx_dropped: AtomicU64,
    pub tx_timeouts: AtomicU64,
    pub rx_delivered: AtomicU64,
    pub rx_failed: AtomicU64,
    pub rx_corrupted: AtomicU64,
    pub discarded_bytes: AtomicU64,
}

/// Point-in-time copy of [`DriverStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_sent: u64,
    pub tx_dropped: u64,
    pub tx_timeouts: u64,
    pub rx_delivered: u64,
    pub rx_failed: u64,
    pub rx_corrupted: u64,
    pub discarded_bytes: u64,
    pub degraded: bool,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct DriverCore {
    pub module: &'static str,
    pub connector: Arc<dyn Connector>,
    pub state: StateCell<ModemState>,
    pub tx_queue: TxQueue,
    pub events: EventQueue,
    pub log: ModemLog,
    pub stats: DriverStats,
    pub settings: DriverSettings,
    running: AtomicBool,
    degraded: AtomicBool,
}

impl DriverCore {
    pub fn new(module: &'static str, connector: Arc<dyn Connector>, settings: DriverSettings, log: ModemLog) -> Self {
        Self {
            module,
            connector,
            state: StateCell::new(ModemState::Available),
            tx_queue: TxQueue::new(settings.tx_queue_capacity),
            events: EventQueue::new(),
            log,
            stats: DriverStats::default(),
            settings,
            running: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tx_sent: load(&self.stats.tx_sent),
            tx_dropped: load(&self.stats.tx_dropped),
            tx_timeouts: load(&self.stats.tx_timeouts),
            rx_delivered: load(&self.stats.rx_delivered),
            rx_failed: load(&self.stats.rx_failed),
            rx_corrupted: load(&self.stats.rx_corrupted),
            discarded_bytes: load(&self.stats.discarded_bytes),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    /// Queues a packet for the transmit worker without blocking.
    pub fn enqueue(&self, packet: Packet) -> Result<(), Packet> {
        match self.tx_queue.push(packet) {
            Ok(()) => {
                self.log.debug(self.module, "recv::PUSHING_IN_TX_QUEUE");
                Ok(())
            }
            Err(packet) => {
                bump(&self.stats.tx_dropped);
                self.log.error(
                    self.module,
                    format!(
                        "recv::TX_QUEUE_FULL::DROPPING_PACKET::UID::{}::CAPACITY::{}",
                        packet.uid,
                        self.tx_queue.capacity()
                    ),
                );
                Err(packet)
            }
        }
    }

    /// Waits for AVAILABLE and claims the device by moving to `busy`.
    ///
    /// On timeout the state is forced back to AVAILABLE so the driver never
    /// locks up, and `false` tells the caller to drop its packet.
    pub fn acquire(&self, busy: ModemState) -> bool {
        let claimed = self
            .state
            .transition(self.settings.modem_timeout, |s| s == ModemState::Available || !self.is_running(), busy);
        if claimed && self.is_running() {
            return true;
        }
        if claimed {
            // Woken by shutdown rather than by the device.
            self.state.set(ModemState::Available);
            return false;
        }
        bump(&self.stats.tx_dropped);
        self.log.error(self.module, "startTx::TIMEOUT_EXPIRED::FORCING_MODEM_AVAILABILITY");
        self.state.set(ModemState::Available);
        false
    }

    /// Waits until the state leaves `busy`, forcing AVAILABLE after `timeout`.
    pub fn await_release(&self, busy: ModemState, timeout: Duration) -> bool {
        if self.state.wait_until(timeout, |s| s != busy || !self.is_running()) {
            return self.state.get() != busy;
        }
        bump(&self.stats.tx_timeouts);
        self.log
            .error(self.module, format!("startTx::NO_COMPLETION_AFTER_{}_MS::FORCING_MODEM_AVAILABILITY", timeout.as_millis()));
        self.state.set(ModemState::Available);
        false
    }

    /// Writes a command on the primary link.
    pub fn send(&self, bytes: &[u8]) -> bool {
        self.send_on(self.connector.as_ref(), bytes)
    }

    /// Writes `bytes` completely, giving up once the driver halts. A failure
    /// is logged and releases the device.
    pub fn send_on(&self, link: &dyn Connector, bytes: &[u8]) -> bool {
        match connector::write_all_while(link, bytes, || self.is_running()) {
            Ok(()) => {
                self.log.debug(self.module, format!("send::WROTE::{}_BYTES", bytes.len()));
                true
            }
            Err(e) if !self.is_running() => {
                bump(&self.stats.tx_dropped);
                self.log.info(self.module, format!("startTx::STOPPED_DURING_WRITE::{}", e));
                self.state.set(ModemState::Available);
                false
            }
            Err(e) => {
                bump(&self.stats.tx_dropped);
                self.log.error(
                    self.module,
                    format!("startTx::FAIL_TO_WRITE_TO_DEVICE::{}::ERRNO::{}", e, link.last_error()),
                );
                self.state.set(ModemState::Available);
                false
            }
        }
    }

    /// Hands a received payload to the simulation thread.
    pub fn deliver(&self, packet: Packet) {
        self.log.info(self.module, format!("receivingData::DELIVERING::{}_BYTES", packet.payload.len()));
        self.events.push(ModemEvent::Received(packet));
        bump(&self.stats.rx_delivered);
    }

    /// Reports a finished transmission to the simulation thread.
    pub fn tx_ended(&self, packet: Packet) {
        self.log.info(self.module, "startTx::PACKET_TRANSMITTED");
        self.events.push(ModemEvent::TxEnded(packet));
        bump(&self.stats.tx_sent);
    }

    /// Transmit worker body: one packet at a time, in queue order.
    pub fn transmit_loop(&self, mut transmit: impl FnMut(Packet)) {
        while let Some(packet) = self.tx_queue.pop(|| self.is_running()) {
            transmit(packet);
            self.log.debug(self.module, "transmittingData::BLOCKING_ON_NEXT_PACKET");
        }
        self.log.debug(self.module, "transmittingData::STOPPED");
    }

    /// Receive worker body: read, accumulate, and feed every complete
    /// response to `on_response` in stream order.
    pub fn receive_loop<I: Interpreter>(&self, link: &dyn Connector, interpreter: &I, mut on_response: impl FnMut(Response<I::Kind>)) {
        let mut buffer = RxBuffer::new(self.settings.buffer_size, self.settings.max_read_size);
        while self.is_running() {
            if buffer.is_full() {
                let discarded = buffer.discard();
                self.stats.discarded_bytes.fetch_add(discarded as u64, Ordering::Relaxed);
                self.degraded.store(true, Ordering::Relaxed);
                self.log
                    .error(self.module, format!("receivingData::BUFFER_FULL_WITHOUT_RESPONSE::DISCARDED_{}_BYTES", discarded));
            }

            match buffer.fill_from(link) {
                Ok(0) => {
                    if self.is_running() {
                        self.log.error(self.module, "receivingData::CONNECTION_CLOSED_BY_DEVICE");
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) if connector::is_timeout(&e) => continue,
                Err(e) => {
                    if !self.is_running() || e.kind() == io::ErrorKind::NotConnected {
                        break;
                    }
                    self.log
                        .error(self.module, format!("receivingData::READ_ERROR::{}::ERRNO::{}", e, link.last_error()));
                    thread::sleep(READ_ERROR_BACKOFF);
                    continue;
                }
            }

            while let Some(found) = interpreter.find_response(buffer.as_slice()) {
                match interpreter.parse_response(&found, buffer.as_slice()) {
                    ParseOutcome::Incomplete => break,
                    ParseOutcome::Complete(response) => {
                        let end = response.end;
                        self.log.debug(
                            self.module,
                            format!(
                                "receivingData::RX_MSG::{:?}::{}",
                                response.kind,
                                String::from_utf8_lossy(&buffer.as_slice()[response.start..end])
                            ),
                        );
                        on_response(response);
                        buffer.consume(end);
                        self.degraded.store(false, Ordering::Relaxed);
                    }
                }
            }
        }
        self.log.debug(self.module, "receivingData::STOPPED");
    }

    /// Flips the running flag and wakes every waiter so the workers observe it.
    pub fn halt(&self) {
        self.set_running(false);
        self.tx_queue.wake_all();
        self.state.wake_all();
    }

    /// Closes `link`, which also unblocks a reader parked in it.
    pub fn close_link(&self, link: &dyn Connector, which: &str) {
        if link.is_connected() && !link.close() {
            self.log.error(self.module, format!("stop::{}_CONNECTION_UNABLE_TO_CLOSE", which));
        }
    }

    /// Drops whatever is still waiting for the transmit worker.
    pub fn flush_tx_queue(&self) {
        let dropped = self.tx_queue.clear();
        if !dropped.is_empty() {
            self.stats.tx_dropped.fetch_add(dropped.len() as u64, Ordering::Relaxed);
            self.log.info(self.module, format!("stop::DROPPING_{}_QUEUED_PACKETS", dropped.len()));
        }
    }
}

/// Starts a named worker thread.
pub(crate) fn spawn_worker(name: String, body: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(body)
}

/// Joins a worker, logging a panic.
pub(crate) fn join_worker(core: &DriverCore, worker: Option<JoinHandle<()>>) {
    let Some(worker) = worker else {
        return;
    };
    let name = worker.thread().name().unwrap_or("worker").to_string();
    if worker.join().is_err() {
        core.log.error(core.module, format!("stop::WORKER_PANICKED::{}", name));
    }
}
