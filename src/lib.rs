//! Drivers bridging a network simulator to real underwater acoustic modems.
//!
//! - [`connector`]: byte links to the device (TCP, UDP, serial)
//! - [`interpreter`]: device dialects over a streaming receive buffer
//! - [`driver`]: per-device state machines with transmit and receive workers
//! - [`sim`]: the simulator-facing adapter and packet types
//! - [`config`]: TOML modem configuration
//! - [`logging`]: per-modem log sink and process logger

pub mod config;
pub mod connector;
pub mod driver;
pub mod interpreter;
pub mod logging;
pub mod sim;

use std::sync::{Mutex, MutexGuard};

/// Locks `m`, recovering the data if a worker panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
