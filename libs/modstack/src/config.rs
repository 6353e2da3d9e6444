//! Master and slave configuration
//!
//! All structs deserialize with defaults for every field, so a partial YAML
//! file or a handful of environment variables is enough.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

/// Medium a slave listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Serial => write!(f, "serial"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParameters {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    #[serde(default)]
    pub port_name: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// 5 to 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub stop_bits: StopBits,

    /// Adapter loops transmitted bytes back (two-wire RS-485)
    #[serde(default)]
    pub echo: bool,

    /// Fixed silence before each transmitted message; derived from the baud rate when unset
    #[serde(default)]
    pub transmit_delay_ms: Option<u64>,
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: StopBits::One,
            echo: false,
            transmit_delay_ms: None,
        }
    }
}

impl SerialParameters {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Self::default()
        }
    }

    pub fn transmit_delay(&self) -> Option<Duration> {
        self.transmit_delay_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.port_name.trim().is_empty() {
            return Err(ModbusError::config("serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::config("baud rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ModbusError::config(format!(
                "unsupported data bits: {}",
                self.data_bits
            )));
        }
        Ok(())
    }
}

/// Master (client) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// `tcp:<host>[:<port>]`, `udp:<host>[:<port>]` or `device:<portName>`
    #[serde(default = "default_target")]
    pub target: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts per transaction
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base of the randomized retry backoff
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Reject responses whose transaction ID differs from the request
    #[serde(default = "default_true")]
    pub check_validity: bool,

    /// Open a new connection for every transaction
    #[serde(default)]
    pub reconnecting: bool,

    /// Headless framing with CRC on TCP targets
    #[serde(default)]
    pub rtu_over_tcp: bool,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Line parameters for `device:` targets; the port name comes from the target
    #[serde(default)]
    pub serial: SerialParameters,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            check_validity: true,
            reconnecting: false,
            rtu_over_tcp: false,
            unit_id: default_unit_id(),
            serial: SerialParameters::default(),
        }
    }
}

impl MasterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.retries == 0 {
            return Err(ModbusError::config("retries must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(ModbusError::config("timeout must be positive"));
        }
        Ok(())
    }
}

/// Slave (server) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveConfig {
    #[serde(default)]
    pub transport: TransportKind,

    /// TCP/UDP port; ignored for serial
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Concurrently served TCP connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Headless framing with CRC on accepted TCP connections
    #[serde(default)]
    pub rtu_over_tcp: bool,

    /// Per-frame read timeout once a request has started
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Grace period for open connections on stop before they are aborted
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Required for the serial transport
    #[serde(default)]
    pub serial: Option<SerialParameters>,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            port: default_port(),
            bind_address: default_bind_address(),
            pool_size: default_pool_size(),
            rtu_over_tcp: false,
            timeout_ms: default_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            serial: None,
        }
    }
}

impl SlaveConfig {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            transport: TransportKind::Udp,
            port,
            ..Self::default()
        }
    }

    pub fn serial(parameters: SerialParameters) -> Self {
        Self {
            transport: TransportKind::Serial,
            serial: Some(parameters),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Address the listener binds to
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Registry key: port number for TCP/UDP, port name for serial
    pub fn port_key(&self) -> String {
        match (&self.transport, &self.serial) {
            (TransportKind::Serial, Some(serial)) => serial.port_name.clone(),
            _ => self.port.to_string(),
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.pool_size == 0 {
            return Err(ModbusError::config("pool size must be at least 1"));
        }
        match (&self.transport, &self.serial) {
            (TransportKind::Serial, Some(serial)) => serial.validate(),
            (TransportKind::Serial, None) => Err(ModbusError::config(
                "serial transport requires serial parameters",
            )),
            _ => Ok(()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_target() -> String {
    format!("tcp:127.0.0.1:{}", DEFAULT_PORT)
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_SLEEP_MS
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_millis() as u64
}

fn default_unit_id() -> u8 {
    1
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_master_defaults_from_empty_document() {
        let config: MasterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MasterConfig::default());
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert!(config.check_validity);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slave_config_parses_serial_section() {
        let config: SlaveConfig = serde_json::from_str(
            r#"{"transport":"serial","serial":{"port_name":"/dev/ttyS1","baud_rate":19200,"parity":"even","echo":true}}"#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportKind::Serial);
        let serial = config.serial.clone().unwrap();
        assert_eq!(serial.baud_rate, 19200);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, StopBits::One);
        assert!(serial.echo);
        assert_eq!(config.port_key(), "/dev/ttyS1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_are_config_errors() {
        let serial_without_port = SlaveConfig {
            transport: TransportKind::Serial,
            ..SlaveConfig::default()
        };
        assert!(matches!(
            serial_without_port.validate().unwrap_err(),
            ModbusError::Config { .. }
        ));

        let empty_pool = SlaveConfig {
            pool_size: 0,
            ..SlaveConfig::tcp(1502)
        };
        assert!(empty_pool.validate().is_err());

        let no_retries = MasterConfig {
            retries: 0,
            ..MasterConfig::default()
        };
        assert!(no_retries.validate().is_err());

        let mut bad_bits = SerialParameters::new("/dev/ttyS0", 9600);
        bad_bits.data_bits = 9;
        assert!(bad_bits.validate().is_err());
    }

    #[test]
    fn test_port_key_per_transport() {
        assert_eq!(SlaveConfig::tcp(1502).port_key(), "1502");
        assert_eq!(SlaveConfig::udp(1503).port_key(), "1503");
        assert_eq!(SlaveConfig::tcp(1502).bind_target(), "0.0.0.0:1502");
    }
}
