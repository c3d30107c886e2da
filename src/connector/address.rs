//! Address grammars accepted by the connectors.
//!
//! - sockets: `host:port` or a bare `port` (host defaults to `127.0.0.1`)
//! - serial: `<dev>:p<0|1>:s<0|1>:f<0|1>:b<baud>`

use std::path::PathBuf;

/// Host used when a socket address only names a port.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Baud rates the serial connector accepts.
pub const SUPPORTED_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
    #[error("serial address `{0}` must have the form dev:p<0|1>:s<0|1>:f<0|1>:b<baud>")]
    SerialFormat(String),
    #[error("invalid serial flag `{0}`")]
    SerialFlag(String),
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
}

/// A parsed `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    pub host: String,
    pub port: u16,
}

impl SocketAddress {
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => (host.to_string(), port),
            Some((_, port)) => (DEFAULT_HOST.to_string(), port),
            None => (DEFAULT_HOST.to_string(), address),
        };
        let port = port.parse::<u16>().map_err(|_| AddressError::InvalidPort(address.to_string()))?;
        Ok(Self { host, port })
    }

    /// `host:port` form usable with `ToSocketAddrs`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Wildcard bind endpoint for the server role.
    pub fn bind_endpoint(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// A parsed serial line description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialAddress {
    pub device: PathBuf,
    pub parity: bool,
    pub two_stop_bits: bool,
    pub hardware_flow: bool,
    pub baud: u32,
}

impl SerialAddress {
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let parts: Vec<&str> = address.split(':').collect();
        if parts.len() != 5 || parts[0].is_empty() {
            return Err(AddressError::SerialFormat(address.to_string()));
        }

        let device = if parts[0].starts_with('/') {
            PathBuf::from(parts[0])
        } else {
            PathBuf::from("/dev").join(parts[0])
        };
        let parity = parse_flag(parts[1], 'p')?;
        let two_stop_bits = parse_flag(parts[2], 's')?;
        let hardware_flow = parse_flag(parts[3], 'f')?;

        let baud = parts[4]
            .strip_prefix('b')
            .and_then(|b| b.parse::<u32>().ok())
            .ok_or_else(|| AddressError::SerialFlag(parts[4].to_string()))?;
        if !SUPPORTED_BAUD_RATES.contains(&baud) {
            return Err(AddressError::UnsupportedBaud(baud));
        }

        Ok(Self {
            device,
            parity,
            two_stop_bits,
            hardware_flow,
            baud,
        })
    }
}

fn parse_flag(part: &str, prefix: char) -> Result<bool, AddressError> {
    match part.strip_prefix(prefix) {
        Some("0") => Ok(false),
        Some("1") => Ok(true),
        _ => Err(AddressError::SerialFlag(part.to_string())),
    }
}
