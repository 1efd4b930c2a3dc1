// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration snapshot consumed at startup
//!
//! The gateway never writes configuration back; persistence belongs to
//! the external configuration collaborator.

use std::{fmt, io, path::Path, time::Duration};

use serde::Deserialize;

use crate::catalog::SlaveEntry;

/// Serial session settings for the RTU side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baudrate: u32,
    pub parity: Parity,
    pub stopbits: StopBits,
    /// Response timeout in milliseconds.
    pub timeout: u64,
}

impl SerialConfig {
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baudrate: 19_200,
            parity: Parity::None,
            stopbits: StopBits::One,
            timeout: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "{c}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("invalid stop bits: {other}")),
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(stopbits: StopBits) -> Self {
        match stopbits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(f, "{n}")
    }
}

/// Northbound TCP ports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// JSON-over-TCP command port.
    pub listen_port: u16,
    /// Transparent Modbus TCP port.
    pub mb_port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_port: 5020,
            mb_port: 502,
        }
    }
}

/// Broker settings for the MQTT bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// The complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub modbus_rtu: SerialConfig,
    pub modbus_tcp: TcpConfig,
    pub mqtt: MqttConfig,
    pub slaves: Vec<SlaveEntry>,
    pub slaves_autoscan_on_start: bool,
    pub slaves_scan_start: u8,
    pub slaves_scan_end: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            modbus_rtu: SerialConfig::default(),
            modbus_tcp: TcpConfig::default(),
            mqtt: MqttConfig::default(),
            slaves: Vec::new(),
            slaves_autoscan_on_start: false,
            slaves_scan_start: 1,
            slaves_scan_end: 32,
        }
    }
}

impl GatewayConfig {
    /// Load the configuration from a TOML file.
    ///
    /// A missing file yields the built-in defaults; a file that fails
    /// to parse is a startup error.
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            log::info!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
