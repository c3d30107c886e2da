//! Modem state variables guarded by a mutex and a condition variable.

use crate::lock;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Device availability as seen by the driver.
///
/// Every variant uses a subset: the MODA driver moves between `Available`,
/// `Transmitting`, `Receiving` and `Configuring`, the ahoi! driver skips
/// `Receiving`, the S2C driver uses `Busy` and the device conditions `Reset`
/// to `Noise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModemState {
    Available,
    Busy,
    Transmitting,
    Receiving,
    Configuring,
    Reset,
    Quit,
    Deaf,
    Noise,
}

impl ModemState {
    pub fn as_str(self) -> &'static str {
        match self {
            ModemState::Available => "AVAILABLE",
            ModemState::Busy => "BUSY",
            ModemState::Transmitting => "TRANSMITTING",
            ModemState::Receiving => "RECEIVING",
            ModemState::Configuring => "CONFIGURING",
            ModemState::Reset => "RESET",
            ModemState::Quit => "QUIT",
            ModemState::Deaf => "DEAF",
            ModemState::Noise => "NOISE",
        }
    }
}

impl std::fmt::Display for ModemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value that threads can wait on.
#[derive(Debug)]
pub struct StateCell<S> {
    value: Mutex<S>,
    changed: Condvar,
}

impl<S: Copy + PartialEq> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            value: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> S {
        *lock(&self.value)
    }

    /// Stores `value` and wakes every waiter. Returns the previous value.
    pub fn set(&self, value: S) -> S {
        let previous = std::mem::replace(&mut *lock(&self.value), value);
        self.changed.notify_all();
        previous
    }

    /// Blocks until `done` holds or `timeout` elapses. Returns whether
    /// `done` held when the wait ended.
    pub fn wait_until(&self, timeout: Duration, mut done: impl FnMut(S) -> bool) -> bool {
        let guard = lock(&self.value);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |value| !done(*value))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        done(*guard)
    }

    /// Waits for `from` to hold, then stores `to` under the same lock.
    pub fn transition(&self, timeout: Duration, mut from: impl FnMut(S) -> bool, to: S) -> bool {
        let guard = lock(&self.value);
        let (mut guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |value| !from(*value))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !from(*guard) {
            return false;
        }
        *guard = to;
        drop(guard);
        self.changed.notify_all();
        true
    }

    /// Wakes waiters without changing the value, so they re-check external flags.
    pub fn wake_all(&self) {
        let _guard = lock(&self.value);
        self.changed.notify_all();
    }
}
