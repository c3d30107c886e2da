//! Generic single-link driver.
//!
//! [`LineModem`] runs one receive worker and one transmit worker over a
//! single connector. Everything device specific lives in a [`Protocol`]:
//! how a packet is transmitted and how a parsed response moves the state.

use super::runtime::{DriverCore, DriverSettings, StatsSnapshot, join_worker, spawn_worker};
use super::state::ModemState;
use super::{CommandError, CommandOutcome, DriverError, ModemEvent, UwModem};
use crate::connector::{Connector, Role, SocketConnector, Transport};
use crate::interpreter::{Interpreter, Response};
use crate::logging::ModemLog;
use crate::sim::Packet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Response kind produced by a protocol's interpreter.
pub type KindOf<P> = <<P as Protocol>::Interp as Interpreter>::Kind;

pub trait Protocol: Send + Sync + 'static {
    type Interp: Interpreter;

    /// Name used in log lines.
    const MODULE: &'static str;

    /// Default bound for state waits.
    const MODEM_TIMEOUT: Duration;

    fn interpreter(&self) -> &Self::Interp;

    /// Carries out one transmission on the transmit worker.
    fn transmit(&self, core: &DriverCore, packet: Packet);

    /// Applies a parsed response on the receive worker.
    fn on_response(&self, core: &DriverCore, response: Response<KindOf<Self>>);

    /// Protocol verbs. `None` when `args[0]` is not one of them.
    fn command(&self, _core: &DriverCore, _args: &[&str]) -> Option<Result<CommandOutcome, CommandError>> {
        None
    }

    /// Resets per-run state before the workers start.
    fn reset(&self) {}

    /// Wakes waiters on protocol state so they notice a stop.
    fn wake(&self) {}
}

pub struct LineModem<P: Protocol> {
    core: Arc<DriverCore>,
    protocol: Arc<P>,
    /// Present when the link is a socket, for the transport verbs.
    socket: Option<Arc<SocketConnector>>,
    address: String,
    rx_worker: Option<JoinHandle<()>>,
    tx_worker: Option<JoinHandle<()>>,
}

impl<P: Protocol> LineModem<P> {
    pub fn with_connector(protocol: P, connector: Arc<dyn Connector>, settings: DriverSettings, log: ModemLog) -> Self {
        Self {
            core: Arc::new(DriverCore::new(P::MODULE, connector, settings, log)),
            protocol: Arc::new(protocol),
            socket: None,
            address: String::new(),
            rx_worker: None,
            tx_worker: None,
        }
    }

    pub fn with_socket(protocol: P, socket: Arc<SocketConnector>, settings: DriverSettings, log: ModemLog) -> Self {
        let connector: Arc<dyn Connector> = socket.clone();
        let mut modem = Self::with_connector(protocol, connector, settings, log);
        modem.socket = Some(socket);
        modem
    }

    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    fn spawn_workers(&mut self) -> std::io::Result<()> {
        let id = self.core.settings.modem_id;
        let prefix = P::MODULE.to_lowercase();

        let core = Arc::clone(&self.core);
        let protocol = Arc::clone(&self.protocol);
        self.rx_worker = Some(spawn_worker(format!("{prefix}-rx-{id}"), move || {
            core.receive_loop(core.connector.as_ref(), protocol.interpreter(), |response| {
                protocol.on_response(&core, response)
            });
        })?);

        let core = Arc::clone(&self.core);
        let protocol = Arc::clone(&self.protocol);
        self.tx_worker = Some(spawn_worker(format!("{prefix}-tx-{id}"), move || {
            core.transmit_loop(|packet| protocol.transmit(&core, packet));
        })?);
        Ok(())
    }

    fn transport_command(&self, verb: &str) -> Result<CommandOutcome, CommandError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(CommandError::invalid(verb, "the modem is not on a socket link"));
        };
        if self.core.is_running() {
            return Err(CommandError::WhileRunning(verb.to_string()));
        }
        match verb {
            "setServer" => socket.set_role(Role::Server),
            "setTCP" => socket.set_transport(Transport::Tcp),
            _ => socket.set_transport(Transport::Udp),
        }
        Ok(CommandOutcome::Handled)
    }
}

impl<P: Protocol> UwModem for LineModem<P> {
    fn name(&self) -> &'static str {
        P::MODULE
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.core.is_running() {
            return Err(DriverError::AlreadyRunning);
        }
        if self.address.is_empty() {
            self.core.log.error(P::MODULE, "start::ADDRESS_NOT_SET");
            return Err(DriverError::NoAddress);
        }
        if let Err(source) = self.core.connector.open(&self.address) {
            self.core.log.error(P::MODULE, format!("start::CONNECTION_OPEN_FAILED::{}", source));
            return Err(DriverError::Connector { which: "modem", source });
        }

        self.core.state.set(ModemState::Available);
        self.protocol.reset();
        self.core.set_running(true);
        if let Err(e) = self.spawn_workers() {
            self.core.log.error(P::MODULE, format!("start::CANNOT_SPAWN_WORKER::{}", e));
            self.stop();
            return Err(DriverError::Spawn(e));
        }
        self.core.log.info(P::MODULE, format!("start::CONNECTED::{}", self.address));
        Ok(())
    }

    fn stop(&mut self) {
        if !self.core.is_running() && self.rx_worker.is_none() && self.tx_worker.is_none() {
            return;
        }
        self.core.log.info(P::MODULE, "stop::CLOSING_CONNECTION");
        self.core.halt();
        self.protocol.wake();
        // Closing first unblocks a writer stuck on a device that stopped reading.
        self.core.close_link(self.core.connector.as_ref(), "MODEM");
        join_worker(&self.core, self.tx_worker.take());
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
        let Some(&verb) = args.first() else {
            return Err(CommandError::Unknown(String::new()));
        };
        if matches!(verb, "setServer" | "setTCP" | "setUDP") && args.len() == 1 {
            return self.transport_command(verb);
        }
        self.protocol
            .command(&self.core, args)
            .unwrap_or_else(|| Err(CommandError::Unknown(verb.to_string())))
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

impl<P: Protocol> Drop for LineModem<P> {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeDevice, wait_for};
    use super::*;
    use crate::interpreter::csa::CsaInterpreter;
    use crate::logging::LogLevel;
    use std::time::Instant;

    /// Frames packets like CSA but waits for the device to echo them back
    /// before the transmission counts as finished.
    struct EchoConfirmed {
        interp: CsaInterpreter,
    }

    const CONFIRM_TIMEOUT: Duration = Duration::from_millis(150);

    impl Protocol for EchoConfirmed {
        type Interp = CsaInterpreter;
        const MODULE: &'static str = "ECHOMODEM";
        const MODEM_TIMEOUT: Duration = Duration::from_millis(100);

        fn interpreter(&self) -> &CsaInterpreter {
            &self.interp
        }

        fn transmit(&self, core: &DriverCore, packet: Packet) {
            if !core.acquire(ModemState::Transmitting) {
                return;
            }
            if !core.send(&self.interp.build_send(&packet.payload)) {
                return;
            }
            core.await_release(ModemState::Transmitting, CONFIRM_TIMEOUT);
            core.tx_ended(packet);
        }

        fn on_response(&self, core: &DriverCore, response: Response<KindOf<Self>>) {
            if core.state.get() == ModemState::Transmitting {
                core.state.set(ModemState::Available);
            } else {
                core.deliver(Packet::received(response.payload, None));
            }
        }
    }

    fn echo_modem(capacity: usize) -> LineModem<EchoConfirmed> {
        let mut settings = DriverSettings::new(1, EchoConfirmed::MODEM_TIMEOUT);
        settings.tx_queue_capacity = capacity;
        echo_modem_with(settings)
    }

    fn echo_modem_with(settings: DriverSettings) -> LineModem<EchoConfirmed> {
        LineModem::with_socket(
            EchoConfirmed {
                interp: CsaInterpreter::new(),
            },
            Arc::new(SocketConnector::default()),
            settings,
            ModemLog::new(1, LogLevel::Info),
        )
    }

    #[test]
    fn test_start_fails_without_address() {
        let mut modem = echo_modem(4);
        assert!(matches!(modem.start(), Err(DriverError::NoAddress)));
        assert!(!modem.is_running());
    }

    #[test]
    fn test_start_fails_when_device_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut modem = echo_modem(4);
        modem.set_address(&address);
        assert!(matches!(modem.start(), Err(DriverError::Connector { .. })));
        assert!(!modem.is_running());
        modem.stop();
    }

    #[test]
    fn test_unconfirmed_transmit_reverts_to_available() {
        let device = FakeDevice::listen();
        let mut modem = echo_modem(4);
        modem.set_address(&device.address);
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.enqueue(Packet::outbound(b"ping".to_vec(), 2)).unwrap();
        assert_eq!(stream.read_until(b"EPCK", Duration::from_secs(2)).unwrap(), b"PACKET,4,ping,EPCK");
        assert!(wait_for(Duration::from_millis(100), || modem.state_name() == "TRANSMITTING"));

        // No echo: the driver must give up on its own.
        assert!(wait_for(Duration::from_secs(2), || modem.state_name() == "AVAILABLE"));
        assert!(wait_for(Duration::from_secs(1), || modem.stats().tx_timeouts == 1));
        assert!(wait_for(Duration::from_secs(1), || !modem.core().events.is_empty()));
        assert!(matches!(modem.drain_events()[0], ModemEvent::TxEnded(_)));
        modem.stop();
    }

    #[test]
    fn test_confirmed_transmit_and_reception() {
        let device = FakeDevice::listen();
        let mut modem = echo_modem(4);
        modem.set_address(&device.address);
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.enqueue(Packet::outbound(b"abc".to_vec(), 2)).unwrap();
        let frame = stream.read_until(b"EPCK", Duration::from_secs(2)).unwrap();
        stream.send(&frame);
        assert!(wait_for(Duration::from_secs(2), || modem.stats().tx_sent == 1));
        assert_eq!(modem.stats().tx_timeouts, 0);

        stream.send(b"PACKET,2,");
        stream.send(b"hi,EPCK");
        assert!(wait_for(Duration::from_secs(2), || modem.stats().rx_delivered == 1));
        let events = modem.drain_events();
        assert!(matches!(&events[0], ModemEvent::TxEnded(p) if p.payload == b"abc"));
        assert!(matches!(&events[1], ModemEvent::Received(p) if p.payload == b"hi"));
        modem.stop();
    }

    #[test]
    fn test_stop_returns_while_reader_is_blocked() {
        let device = FakeDevice::listen();
        let mut modem = echo_modem(4);
        modem.set_address(&device.address);
        modem.start().unwrap();
        let _stream = device.accept();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        modem.stop();
        assert!(started.elapsed() < Duration::from_secs(2), "stop took {:?}", started.elapsed());
        assert!(!modem.is_running());
        // A second stop is a no-op.
        modem.stop();
    }

    #[test]
    fn test_stop_returns_while_writer_is_blocked() {
        let device = FakeDevice::listen();
        let mut modem = echo_modem(8);
        modem.set_address(&device.address);
        modem.start().unwrap();
        // Held open but never read, so the socket buffers fill up.
        let _stream = device.accept();
        for _ in 0..4 {
            modem.enqueue(Packet::outbound(vec![b'x'; 8 << 20], 2)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(300));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let stopper = std::thread::spawn(move || {
            modem.stop();
            let _ = done_tx.send(modem.stats());
        });
        let stats = done_rx.recv_timeout(Duration::from_secs(5)).expect("stop must not hang on a stalled device");
        stopper.join().unwrap();
        assert!(stats.tx_dropped >= 3, "{:?}", stats);
        assert_eq!(stats.tx_sent + stats.tx_dropped, 4);
    }

    #[test]
    fn test_full_buffer_without_response_is_discarded() {
        let device = FakeDevice::listen();
        let mut settings = DriverSettings::new(1, EchoConfirmed::MODEM_TIMEOUT);
        settings.buffer_size = 32;
        settings.max_read_size = 16;
        let mut modem = echo_modem_with(settings);
        modem.set_address(&device.address);
        modem.start().unwrap();
        let mut stream = device.accept();

        stream.send(&[b'x'; 48]);
        assert!(wait_for(Duration::from_secs(2), || modem.stats().degraded));
        assert_eq!(modem.stats().discarded_bytes, 32);
        assert!(modem.log().recent().iter().any(|e| e.message.contains("BUFFER_FULL_WITHOUT_RESPONSE")));

        // 16 bytes of noise are still buffered; the frame fits behind them.
        stream.send(b"PACKET,2,hi,EPCK");
        assert!(wait_for(Duration::from_secs(2), || modem.stats().rx_delivered == 1));
        let stats = modem.stats();
        assert!(!stats.degraded);
        assert_eq!(stats.discarded_bytes, 32);
        assert!(matches!(&modem.drain_events()[0], ModemEvent::Received(p) if p.payload == b"hi"));
        modem.stop();
    }

    #[test]
    fn test_device_that_never_frees_up_drops_the_packet() {
        let device = FakeDevice::listen();
        let mut modem = echo_modem(4);
        modem.set_address(&device.address);
        modem.start().unwrap();
        let mut stream = device.accept();

        modem.core().state.set(ModemState::Busy);
        modem.enqueue(Packet::outbound(b"lost".to_vec(), 2)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || modem.stats().tx_dropped == 1));
        assert_eq!(modem.state_name(), "AVAILABLE");
        assert!(stream.read_until(b"EPCK", Duration::from_millis(200)).is_none());
        assert!(modem.drain_events().is_empty());
        assert_eq!(modem.stats().tx_sent, 0);
        assert!(modem.log().recent().iter().any(|e| e.message.contains("FORCING_MODEM_AVAILABILITY")));

        // The forced release lets the next packet through.
        modem.enqueue(Packet::outbound(b"next".to_vec(), 2)).unwrap();
        let frame = stream.read_until(b"EPCK", Duration::from_secs(2)).unwrap();
        assert_eq!(frame, b"PACKET,4,next,EPCK");
        stream.send(&frame);
        assert!(wait_for(Duration::from_secs(2), || modem.stats().tx_sent == 1));
        modem.stop();
    }

    #[test]
    fn test_queue_overflow_drops_are_logged() {
        let modem = echo_modem(2);
        let mut rejected = 0;
        for i in 0..5u8 {
            if modem.enqueue(Packet::outbound(vec![i], 1)).is_err() {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 3);
        assert_eq!(modem.core().tx_queue.len(), 2);
        assert_eq!(modem.stats().tx_dropped, 3);
        let drops = modem.log().recent().into_iter().filter(|e| e.message.contains("TX_QUEUE_FULL")).count();
        assert_eq!(drops, 3);
    }

    #[test]
    fn test_transport_verbs() {
        let mut modem = echo_modem(2);
        assert_eq!(modem.command(&["setUDP"]), Ok(CommandOutcome::Handled));
        assert_eq!(modem.socket.as_ref().unwrap().transport(), Transport::Udp);
        assert_eq!(modem.command(&["setServer"]), Ok(CommandOutcome::Handled));
        assert_eq!(modem.socket.as_ref().unwrap().role(), Role::Server);
        assert_eq!(modem.command(&["bogus"]), Err(CommandError::Unknown("bogus".into())));
    }

    #[test]
    fn test_transport_verbs_rejected_while_running() {
        let device = FakeDevice::listen();
        let mut modem = echo_modem(2);
        modem.set_address(&device.address);
        modem.start().unwrap();
        let _stream = device.accept();
        assert_eq!(modem.command(&["setUDP"]), Err(CommandError::WhileRunning("setUDP".into())));
        modem.stop();
    }
}
