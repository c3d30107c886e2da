//! Byte-stream links between a driver and its device.
//!
//! A [`Connector`] hides whether the modem sits behind a TCP or UDP socket or
//! a serial line. All methods take `&self`: the receive worker can be parked
//! in [`Connector::read`] while the transmit worker writes and the simulation
//! thread closes the link to wake it up.
//!
//! Failures never panic. They come back as `Err` values and the raw OS error
//! code is cached for [`Connector::last_error`].

pub mod address;
pub mod serial;
pub mod socket;

use serde::Deserialize;
use std::io;

pub use address::AddressError;
pub use serial::SerialConnector;
pub use socket::SocketConnector;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("connector is already open")]
    AlreadyOpen,
    #[error("no previous address to reconnect to")]
    NoAddress,
    #[error("cannot open `{address}`: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot open serial port `{address}`: {source}")]
    Serial {
        address: String,
        #[source]
        source: serialport::Error,
    },
}

/// Socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

/// Which side initiates the socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

pub trait Connector: Send + Sync {
    /// Parses `address` and establishes the link.
    fn open(&self, address: &str) -> Result<(), ConnectorError>;

    /// Releases the link. Returns `false` if it was not open.
    ///
    /// Closing also wakes up a reader blocked in [`Connector::read`].
    fn close(&self) -> bool;

    /// Single write attempt. Returns the number of bytes accepted.
    fn write(&self, bytes: &[u8]) -> io::Result<usize>;

    /// Single read attempt.
    ///
    /// `Ok(0)` means the peer closed the link. A read timeout surfaces as an
    /// error for which [`is_timeout`] holds.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn is_connected(&self) -> bool;

    /// Raw OS error code of the last failure, 0 if none was recorded.
    fn last_error(&self) -> i32;

    /// Address of the last successful [`Connector::open`].
    fn address(&self) -> Option<String>;

    /// Closes and reopens the link on the last address.
    fn refresh(&self) -> Result<(), ConnectorError> {
        let address = self.address().ok_or(ConnectorError::NoAddress)?;
        self.close();
        self.open(&address)
    }
}

/// True for errors that only mean "nothing arrived within the read timeout".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted)
}

/// Writes all of `bytes`, looping over short writes.
pub fn write_all(connector: &dyn Connector, bytes: &[u8]) -> io::Result<()> {
    write_all_while(connector, bytes, || true)
}

/// Like [`write_all`], but a write timeout is retried only while
/// `keep_going` holds. A device that stops reading therefore cannot pin the
/// caller once `keep_going` turns false.
pub fn write_all_while(connector: &dyn Connector, bytes: &[u8], keep_going: impl Fn() -> bool) -> io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match connector.write(&bytes[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "device accepted no bytes")),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) && keep_going() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connector is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timeouts_are_not_fatal() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_timeout(&not_connected()));
    }

    /// Accepts nothing, as a device that has stopped reading.
    struct Stalled {
        attempts: AtomicUsize,
    }

    impl Connector for Stalled {
        fn open(&self, _address: &str) -> Result<(), ConnectorError> {
            Ok(())
        }

        fn close(&self) -> bool {
            true
        }

        fn write(&self, _bytes: &[u8]) -> io::Result<usize> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }

        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn last_error(&self) -> i32 {
            0
        }

        fn address(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_write_timeouts_retry_until_told_to_stop() {
        let stalled = Stalled {
            attempts: AtomicUsize::new(0),
        };
        let err = write_all_while(&stalled, b"data", || stalled.attempts.load(Ordering::SeqCst) < 3).unwrap_err();
        assert!(is_timeout(&err));
        assert_eq!(stalled.attempts.load(Ordering::SeqCst), 3);
        assert!(write_all_while(&stalled, b"", || false).is_ok());
    }
}
