//! TCP and UDP links, in client or server role.

use super::address::SocketAddress;
use super::{Connector, ConnectorError, Role, Transport, not_connected};
use crate::lock;
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default receive timeout applied to every socket.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest a single TCP write may block before it reports a timeout.
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

struct UdpLink {
    socket: UdpSocket,
    /// Destination of writes. Server links learn it from the last datagram.
    peer: Mutex<Option<SocketAddr>>,
}

#[derive(Clone)]
enum Link {
    Tcp(Arc<TcpStream>),
    Udp(Arc<UdpLink>),
}

#[derive(Debug, Clone, Copy)]
struct SocketSettings {
    transport: Transport,
    role: Role,
    read_timeout: Duration,
}

pub struct SocketConnector {
    settings: Mutex<SocketSettings>,
    link: Mutex<Option<Link>>,
    address: Mutex<Option<String>>,
    last_error: AtomicI32,
}

impl Default for SocketConnector {
    fn default() -> Self {
        Self::new(Transport::Tcp, Role::Client)
    }
}

impl SocketConnector {
    pub fn new(transport: Transport, role: Role) -> Self {
        Self {
            settings: Mutex::new(SocketSettings {
                transport,
                role,
                read_timeout: DEFAULT_READ_TIMEOUT,
            }),
            link: Mutex::new(None),
            address: Mutex::new(None),
            last_error: AtomicI32::new(0),
        }
    }

    /// Takes effect on the next [`Connector::open`].
    pub fn set_transport(&self, transport: Transport) {
        lock(&self.settings).transport = transport;
    }

    /// Takes effect on the next [`Connector::open`].
    pub fn set_role(&self, role: Role) {
        lock(&self.settings).role = role;
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        lock(&self.settings).read_timeout = timeout;
    }

    pub fn transport(&self) -> Transport {
        lock(&self.settings).transport
    }

    pub fn role(&self) -> Role {
        lock(&self.settings).role
    }

    fn current_link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    fn record(&self, err: &io::Error) {
        self.last_error.store(err.raw_os_error().unwrap_or(-1), Ordering::Relaxed);
    }

    fn connect(&self, address: &str, settings: SocketSettings) -> io::Result<Link> {
        let parsed = SocketAddress::parse(address).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let timeout = Some(settings.read_timeout);
        match (settings.transport, settings.role) {
            (Transport::Tcp, Role::Client) => {
                let stream = TcpStream::connect(parsed.endpoint())?;
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(Link::Tcp(Arc::new(stream)))
            }
            (Transport::Tcp, Role::Server) => {
                let listener = TcpListener::bind(parsed.bind_endpoint())?;
                info!("Waiting for a TCP client on port {}", parsed.port);
                let (stream, peer) = listener.accept()?;
                info!("TCP client {} connected", peer);
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(Link::Tcp(Arc::new(stream)))
            }
            (Transport::Udp, Role::Client) => {
                let destination = resolve(&parsed.endpoint())?;
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.set_read_timeout(timeout)?;
                Ok(Link::Udp(Arc::new(UdpLink {
                    socket,
                    peer: Mutex::new(Some(destination)),
                })))
            }
            (Transport::Udp, Role::Server) => {
                let socket = UdpSocket::bind(parsed.bind_endpoint())?;
                socket.set_read_timeout(timeout)?;
                Ok(Link::Udp(Arc::new(UdpLink {
                    socket,
                    peer: Mutex::new(None),
                })))
            }
        }
    }
}

impl Connector for SocketConnector {
    fn open(&self, address: &str) -> Result<(), ConnectorError> {
        if self.is_connected() {
            return Err(ConnectorError::AlreadyOpen);
        }
        SocketAddress::parse(address)?;
        let settings = *lock(&self.settings);
        let link = self.connect(address, settings).map_err(|source| {
            self.record(&source);
            ConnectorError::Io {
                address: address.to_string(),
                source,
            }
        })?;
        debug!("Opened {:?}/{:?} socket on {}", settings.transport, settings.role, address);
        *lock(&self.link) = Some(link);
        *lock(&self.address) = Some(address.to_string());
        Ok(())
    }

    fn close(&self) -> bool {
        let Some(link) = lock(&self.link).take() else {
            return false;
        };
        if let Link::Tcp(stream) = link {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                // The peer may already be gone; the descriptor is released anyway.
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!("Socket shutdown failed: {}", e);
                    self.record(&e);
                }
            }
        }
        true
    }

    fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        let link = self.current_link().ok_or_else(not_connected)?;
        let result = match link {
            Link::Tcp(stream) => (&*stream).write(bytes),
            Link::Udp(udp) => {
                let peer = *lock(&udp.peer);
                match peer {
                    Some(peer) => udp.socket.send_to(bytes, peer),
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "no UDP peer known yet")),
                }
            }
        };
        result.inspect_err(|e| self.record(e))
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let link = self.current_link().ok_or_else(not_connected)?;
        let result = match link {
            Link::Tcp(stream) => (&*stream).read(buf),
            Link::Udp(udp) => recv_datagram(&udp, buf),
        };
        if let Err(e) = &result {
            if !super::is_timeout(e) {
                self.record(e);
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        lock(&self.link).is_some()
    }

    fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Relaxed)
    }

    fn address(&self) -> Option<String> {
        lock(&self.address).clone()
    }
}

/// Empty datagrams update the peer but are never reported as data, since
/// `Ok(0)` means a closed link.
fn recv_datagram(udp: &UdpLink, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let (n, from) = udp.socket.recv_from(buf)?;
        *lock(&udp.peer) = Some(from);
        if n > 0 {
            return Ok(n);
        }
    }
}

fn resolve(endpoint: &str) -> io::Result<SocketAddr> {
    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {}", endpoint)))
}
