//! Serial line link built on the `serialport` crate.
//!
//! The port is opened raw with 8 data bits and a one second read timeout.
//! Reads and writes go through separate handles so a parked reader does not
//! hold up the transmit worker.

use super::address::SerialAddress;
use super::{Connector, ConnectorError, not_connected};
use crate::lock;
use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct SerialConnector {
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    address: Mutex<Option<String>>,
    last_error: AtomicI32,
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialConnector {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            address: Mutex::new(None),
            last_error: AtomicI32::new(0),
        }
    }

    fn record(&self, err: &io::Error) {
        self.last_error.store(err.raw_os_error().unwrap_or(-1), Ordering::Relaxed);
    }

    fn open_port(settings: &SerialAddress) -> Result<Box<dyn SerialPort>, serialport::Error> {
        serialport::new(settings.device.to_string_lossy(), settings.baud)
            .data_bits(DataBits::Eight)
            .parity(if settings.parity { Parity::Even } else { Parity::None })
            .stop_bits(if settings.two_stop_bits { StopBits::Two } else { StopBits::One })
            .flow_control(if settings.hardware_flow { FlowControl::Hardware } else { FlowControl::None })
            .timeout(SERIAL_READ_TIMEOUT)
            .open()
    }
}

impl Connector for SerialConnector {
    fn open(&self, address: &str) -> Result<(), ConnectorError> {
        if self.is_connected() {
            return Err(ConnectorError::AlreadyOpen);
        }
        let settings = SerialAddress::parse(address)?;
        let serial_error = |source: serialport::Error| {
            self.record(&io::Error::from(source.clone()));
            ConnectorError::Serial {
                address: address.to_string(),
                source,
            }
        };
        let reader = Self::open_port(&settings).map_err(serial_error)?;
        let writer = reader.try_clone().map_err(serial_error)?;
        debug!("Opened serial port {} at {} baud", settings.device.display(), settings.baud);

        *lock(&self.writer) = Some(writer);
        *lock(&self.reader) = Some(reader);
        *lock(&self.address) = Some(address.to_string());
        Ok(())
    }

    fn close(&self) -> bool {
        // The writer goes first so is_connected() drops immediately; the
        // reader lock is held by a pending read for at most one timeout.
        let was_open = lock(&self.writer).take().is_some();
        lock(&self.reader).take();
        was_open
    }

    fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.writer);
        let port = guard.as_mut().ok_or_else(not_connected)?;
        port.write(bytes).inspect_err(|e| self.record(e))
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = lock(&self.reader);
        let port = guard.as_mut().ok_or_else(not_connected)?;
        let result = port.read(buf);
        if let Err(e) = &result {
            if !super::is_timeout(e) {
                self.record(e);
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        lock(&self.writer).is_some()
    }

    fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Relaxed)
    }

    fn address(&self) -> Option<String> {
        lock(&self.address).clone()
    }
}
