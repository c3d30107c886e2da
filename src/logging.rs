//! Modem log sink and process-wide logger setup.
//!
//! Every driver owns a [`ModemLog`]. Each message is forwarded to the `log`
//! facade (so `env_logger` prints it) and, when it passes the modem's own
//! [`LogLevel`], kept in a bounded in-memory history and optionally appended
//! to a per-modem log file:
//!
//! `INFO::[1700000000.123]::[12.5]::S2C(3)::startTx::COMMAND_TX`
//!
//! The first timestamp is wall-clock seconds, the second the last simulation
//! time the adapter reported.

use chrono::Utc;
use env_logger::Builder;
use log::LevelFilter;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

/// Number of entries kept in memory per modem.
const RECENT_CAPACITY: usize = 256;

/// Verbosity of a modem log. Ordered so that `Error < Info < Debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "ERR")]
    Error,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "DBG")]
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid log level `{0}`, expected ERR, INFO or DBG")]
pub struct UnknownLogLevel(pub String);

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERR",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DBG",
        }
    }

    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ERR" => Ok(LogLevel::Error),
            "INFO" => Ok(LogLevel::Info),
            "DBG" => Ok(LogLevel::Debug),
            other => Err(UnknownLogLevel(other.to_string())),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message accepted by a [`ModemLog`].
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Wall-clock time in seconds since the Unix epoch.
    pub wall_clock: f64,
    /// Simulation time known to the modem when the entry was written.
    pub sim_time: f64,
    pub module: &'static str,
    pub message: String,
}

struct LogState {
    level: LogLevel,
    suffix: String,
    dir: Option<PathBuf>,
    file: Option<File>,
    file_failed: bool,
    sim_time: f64,
    recent: VecDeque<LogEntry>,
}

/// Per-modem log sink, shared by the simulation thread and the I/O workers.
pub struct ModemLog {
    modem_id: u32,
    state: Mutex<LogState>,
}

impl ModemLog {
    pub fn new(modem_id: u32, level: LogLevel) -> Self {
        Self {
            modem_id,
            state: Mutex::new(LogState {
                level,
                suffix: "_log".to_string(),
                dir: None,
                file: None,
                file_failed: false,
                sim_time: 0.0,
                recent: VecDeque::with_capacity(RECENT_CAPACITY),
            }),
        }
    }

    pub fn modem_id(&self) -> u32 {
        self.modem_id
    }

    pub fn level(&self) -> LogLevel {
        self.lock().level
    }

    pub fn set_level(&self, level: LogLevel) {
        self.lock().level = level;
    }

    /// Changes the file suffix. An already open file is closed so the next
    /// entry goes to the new name.
    pub fn set_suffix(&self, suffix: &str) {
        let mut state = self.lock();
        state.suffix = suffix.to_string();
        state.file = None;
        state.file_failed = false;
    }

    /// Enables file output into `dir`. Without a directory entries are only
    /// kept in memory.
    pub fn set_dir(&self, dir: Option<PathBuf>) {
        let mut state = self.lock();
        state.dir = dir;
        state.file = None;
        state.file_failed = false;
    }

    /// Path of the log file, if file output is enabled.
    pub fn file_path(&self) -> Option<PathBuf> {
        let state = self.lock();
        state.dir.as_ref().map(|dir| dir.join(format!("modem_{}{}", self.modem_id, state.suffix)))
    }

    pub fn set_sim_time(&self, now: f64) {
        self.lock().sim_time = now;
    }

    pub fn error(&self, module: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Error, module, message.into());
    }

    pub fn info(&self, module: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Info, module, message.into());
    }

    pub fn debug(&self, module: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Debug, module, message.into());
    }

    pub fn log(&self, level: LogLevel, module: &'static str, message: String) {
        log::log!(target: "uwmodem_bridge::modem", level.to_log(), "{}({})::{}", module, self.modem_id, message);

        let mut state = self.lock();
        if level > state.level {
            return;
        }
        let entry = LogEntry {
            level,
            wall_clock: Utc::now().timestamp_millis() as f64 / 1000.0,
            sim_time: state.sim_time,
            module,
            message,
        };
        self.write_to_file(&mut state, &entry);
        if state.recent.len() >= RECENT_CAPACITY {
            state.recent.pop_front();
        }
        state.recent.push_back(entry);
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn recent(&self) -> Vec<LogEntry> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Formats an entry the way it is written to the log file.
    pub fn format_line(&self, entry: &LogEntry) -> String {
        format!(
            "{}::[{:.3}]::[{}]::{}({})::{}",
            entry.level.as_str(),
            entry.wall_clock,
            entry.sim_time,
            entry.module,
            self.modem_id,
            entry.message
        )
    }

    fn write_to_file(&self, state: &mut LogState, entry: &LogEntry) {
        if state.file.is_none() && !state.file_failed {
            if let Some(dir) = state.dir.as_ref() {
                let path = dir.join(format!("modem_{}{}", self.modem_id, state.suffix));
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => state.file = Some(file),
                    Err(e) => {
                        log::warn!("Cannot open modem log file {}: {}", path.display(), e);
                        state.file_failed = true;
                    }
                }
            }
        }
        let line = self.format_line(entry);
        if let Some(file) = state.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                log::warn!("Cannot write modem log file: {}", e);
                state.file = None;
                state.file_failed = true;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        // A poisoned log must not take the driver down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Installs the process logger.
///
/// `RUST_LOG` overrides the defaults, which are `Info` globally and
/// `crate_level` for this crate.
pub fn init_logging(crate_level: LevelFilter) {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("uwmodem_bridge"), crate_level)
        .parse_default_env()
        .init();
}
