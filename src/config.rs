//! TOML configuration of one modem.
//!
//! ```toml
//! id = 3
//! kind = "s2c"
//! address = "192.168.0.212:9200"
//! log-level = "INFO"
//!
//! [s2c]
//! mode = "burst"
//! source-level = 2
//! ```

use crate::connector::Transport;
use crate::driver::DriverSettings;
use crate::driver::ahoi::{DEFAULT_MAX_RETRANSMISSIONS, DEFAULT_WAIT_DELIVERY_MS};
use crate::driver::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_READ};
use crate::driver::queue::DEFAULT_TX_QUEUE_CAPACITY;
use crate::driver::s2c::{DEFAULT_MAX_STATUS_QUERIES, DEFAULT_SOURCE_LEVEL, MAX_SOURCE_LEVEL, TxMode};
use crate::logging::LogLevel;
use anyhow::{Context, ensure};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between two adapter ticks, in simulated seconds.
pub const DEFAULT_PERIOD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemKind {
    #[default]
    S2c,
    Csa,
    Applicon,
    Moda,
    Ahoi,
}

/// Physical link to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    #[default]
    Socket,
    Serial,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct S2cConfig {
    pub mode: TxMode,
    /// Request an acknowledgement for instant messages.
    pub ack: bool,
    pub source_level: u8,
    pub max_status_queries: usize,
}

impl Default for S2cConfig {
    fn default() -> Self {
        Self {
            mode: TxMode::Im,
            ack: false,
            source_level: DEFAULT_SOURCE_LEVEL,
            max_status_queries: DEFAULT_MAX_STATUS_QUERIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppliconConfig {
    pub ack_timeout_ms: u64,
    pub max_packet_len: usize,
}

impl Default for AppliconConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 500,
            max_packet_len: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AhoiConfig {
    /// Extra copies of a packet sent while no confirmation arrives.
    pub max_retransmissions: u32,
    /// Wait for a confirmation after each copy.
    pub wait_delivery_ms: u64,
}

impl Default for AhoiConfig {
    fn default() -> Self {
        Self {
            max_retransmissions: DEFAULT_MAX_RETRANSMISSIONS,
            wait_delivery_ms: DEFAULT_WAIT_DELIVERY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModemConfig {
    pub id: u32,
    pub kind: ModemKind,
    /// `host:port`, bare `port`, or a serial descriptor when `link = "serial"`.
    pub address: String,
    /// Signaling link of a MODA modem.
    pub signal_address: Option<String>,
    pub link: LinkKind,
    pub transport: Transport,
    /// Wait for the device to connect instead of connecting to it.
    pub server: bool,
    pub buffer_size: usize,
    pub max_read_size: usize,
    pub period: f64,
    pub tx_queue_capacity: usize,
    pub read_timeout_ms: u64,
    /// Overrides the driver's own bound for state waits.
    pub modem_timeout_ms: Option<u64>,
    pub log_level: LogLevel,
    pub log_suffix: String,
    pub log_dir: Option<PathBuf>,
    pub s2c: S2cConfig,
    pub applicon: AppliconConfig,
    pub ahoi: AhoiConfig,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            id: 1,
            kind: ModemKind::default(),
            address: String::new(),
            signal_address: None,
            link: LinkKind::default(),
            transport: Transport::default(),
            server: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_read_size: DEFAULT_MAX_READ,
            period: DEFAULT_PERIOD,
            tx_queue_capacity: DEFAULT_TX_QUEUE_CAPACITY,
            read_timeout_ms: 100,
            modem_timeout_ms: None,
            log_level: LogLevel::Error,
            log_suffix: "_log".to_string(),
            log_dir: None,
            s2c: S2cConfig::default(),
            applicon: AppliconConfig::default(),
            ahoi: AhoiConfig::default(),
        }
    }
}

impl ModemConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.address.trim().is_empty(), "`address` must be set");
        ensure!(self.buffer_size > 0, "`buffer-size` must be positive");
        ensure!(self.max_read_size > 0, "`max-read-size` must be positive");
        ensure!(
            self.max_read_size <= self.buffer_size,
            "`max-read-size` ({}) exceeds `buffer-size` ({})",
            self.max_read_size,
            self.buffer_size
        );
        ensure!(self.tx_queue_capacity > 0, "`tx-queue-capacity` must be positive");
        ensure!(self.period.is_finite() && self.period > 0.0, "`period` must be positive");
        ensure!(self.read_timeout_ms > 0, "`read-timeout-ms` must be positive");
        ensure!(
            self.s2c.source_level <= MAX_SOURCE_LEVEL,
            "`s2c.source-level` must be between 0 and {}",
            MAX_SOURCE_LEVEL
        );
        if self.kind == ModemKind::Ahoi {
            ensure!(self.id <= u32::from(u8::MAX), "an ahoi! modem `id` must fit in one byte");
            ensure!(self.ahoi.wait_delivery_ms > 0, "`ahoi.wait-delivery-ms` must be positive");
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Driver sizing, with `default_timeout` unless `modem-timeout-ms` overrides it.
    pub fn driver_settings(&self, default_timeout: Duration) -> DriverSettings {
        DriverSettings {
            modem_id: self.id,
            buffer_size: self.buffer_size,
            max_read_size: self.max_read_size,
            tx_queue_capacity: self.tx_queue_capacity,
            modem_timeout: self.modem_timeout_ms.map_or(default_timeout, Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("uwmodem_config_{}_{}.toml", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ModemConfig::from_toml_str("address = \"9200\"").unwrap();
        assert_eq!(config.address, "9200");
        assert_eq!(config.kind, ModemKind::S2c);
        assert_eq!(config.link, LinkKind::Socket);
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.period, DEFAULT_PERIOD);
        assert_eq!(config.log_level, LogLevel::Error);
        assert_eq!(config.log_suffix, "_log");
        assert_eq!(config.s2c, S2cConfig::default());
        assert_eq!(config.applicon.ack_timeout_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = ModemConfig::from_toml_str(
            r#"
            id = 7
            kind = "applicon"
            address = "10.0.0.2:5000"
            transport = "udp"
            server = true
            buffer-size = 8192
            tx-queue-capacity = 4
            modem-timeout-ms = 900
            log-level = "DBG"
            log-dir = "/tmp/modems"

            [s2c]
            mode = "burst"
            ack = true
            source-level = 1

            [applicon]
            max-packet-len = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.id, 7);
        assert_eq!(config.kind, ModemKind::Applicon);
        assert_eq!(config.transport, Transport::Udp);
        assert!(config.server);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/modems")));
        assert_eq!(config.s2c.mode, TxMode::Burst);
        assert!(config.s2c.ack);
        assert_eq!(config.s2c.source_level, 1);
        assert_eq!(config.applicon.max_packet_len, 64);
        assert_eq!(config.applicon.ack_timeout_ms, 500);

        let settings = config.driver_settings(Duration::from_millis(210));
        assert_eq!(settings.modem_id, 7);
        assert_eq!(settings.buffer_size, 8192);
        assert_eq!(settings.tx_queue_capacity, 4);
        assert_eq!(settings.modem_timeout, Duration::from_millis(900));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "kind = \"csa\"",
            "address = \"1\"\nbuffer-size = 0",
            "address = \"1\"\nmax-read-size = 5000",
            "address = \"1\"\nperiod = 0.0",
            "address = \"1\"\ntx-queue-capacity = 0",
            "address = \"1\"\n[s2c]\nsource-level = 9",
            "kind = \"ahoi\"\naddress = \"ttyUSB0:p0:s0:f0:b115200\"\nid = 300",
            "kind = \"ahoi\"\naddress = \"1\"\n[ahoi]\nwait-delivery-ms = 0",
        ];
        for case in cases {
            let config = ModemConfig::from_toml_str(case).unwrap();
            assert!(config.validate().is_err(), "accepted {:?}", case);
        }
    }

    #[test]
    fn test_unknown_values_are_rejected() {
        assert!(ModemConfig::from_toml_str("kind = \"ahoi!\"").is_err());
        assert!(ModemConfig::from_toml_str("log-level = \"TRACE\"").is_err());
        assert!(ModemConfig::from_toml_str("[s2c]\nmode = \"fast\"").is_err());
    }

    #[test]
    fn test_ahoi_section() {
        let config = ModemConfig::from_toml_str(
            r#"
            id = 12
            kind = "ahoi"
            link = "serial"
            address = "ttyUSB0:p0:s0:f0:b115200"

            [ahoi]
            max-retransmissions = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, ModemKind::Ahoi);
        assert_eq!(config.link, LinkKind::Serial);
        assert_eq!(config.ahoi.max_retransmissions, 2);
        assert_eq!(config.ahoi.wait_delivery_ms, DEFAULT_WAIT_DELIVERY_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let path = temp_file("load", "id = 2\nkind = \"moda\"\naddress = \"1.2.3.4:1\"\nsignal-address = \"1.2.3.4:2\"\n");
        let config = ModemConfig::load(&path).unwrap();
        assert_eq!(config.kind, ModemKind::Moda);
        assert_eq!(config.signal_address.as_deref(), Some("1.2.3.4:2"));
        std::fs::remove_file(&path).unwrap();

        let missing = std::env::temp_dir().join("uwmodem_config_missing.toml");
        let err = ModemConfig::load(&missing).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
