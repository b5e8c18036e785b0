//! Bridge configuration, loaded from a JSON file. Every field has a default so a
//! partial file (or none at all) works.

use crate::codec::{BaudRate, PacketId};
use crate::dispatcher::{
    DispatchSettings, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BAUD_SETTLE_MS, DEFAULT_COMMAND_SPACING_MS,
    DEFAULT_MAX_RETRIES, DEFAULT_MODE_SETTLE_MS, DEFAULT_READ_TIMEOUT_MS, DEFAULT_WRITE_TIMEOUT_MS,
};
use crate::telemetry::{DEFAULT_BROADCAST_CAPACITY, DEFAULT_POLL_INTERVAL_MS};
use crate::transport::SerialSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8934";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
// Below this the poll loop would starve user commands
const MIN_POLL_INTERVAL_MS: u64 = 15;

/// Host board the robot is attached to. Picks the default serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Board {
    RaspberryPi,
    UsbSerial,
    Simulated,
}

impl Board {
    pub fn default_device(self) -> &'static str {
        match self {
            Board::RaspberryPi => "/dev/ttyAMA0",
            Board::UsbSerial => "/dev/ttyUSB0",
            Board::Simulated => "sim",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "raspberrypi" | "raspberry-pi" | "rpi" | "pi" => Some(Board::RaspberryPi),
            "usb" | "usbserial" | "usb-serial" => Some(Board::UsbSerial),
            "sim" | "simulated" => Some(Board::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub board: Board,
    /// Overrides the board's default device path.
    pub device: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            board: Board::RaspberryPi,
            device: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or_else(|| self.board.default_device())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            device: self.device().to_string(),
            baud_rate: self.baud_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub command_spacing_ms: u64,
    pub mode_settle_ms: u64,
    pub baud_settle_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_spacing_ms: DEFAULT_COMMAND_SPACING_MS,
            mode_settle_ms: DEFAULT_MODE_SETTLE_MS,
            baud_settle_ms: DEFAULT_BAUD_SETTLE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub poll_interval_ms: u64,
    /// Packets polled from startup, independent of subscribers.
    pub packets: Vec<PacketId>,
    pub broadcast_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            packets: Vec::new(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen: String,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if BaudRate::from_bits_per_second(self.transport.baud_rate).is_none() {
            return Err(ConfigError::Invalid(format!(
                "baud rate {} is not one the robot supports",
                self.transport.baud_rate
            )));
        }
        if self.telemetry.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll interval must be at least {MIN_POLL_INTERVAL_MS} ms"
            )));
        }
        if self.transport.read_timeout_ms == 0 || self.transport.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            command_spacing: Duration::from_millis(self.dispatch.command_spacing_ms),
            mode_settle: Duration::from_millis(self.dispatch.mode_settle_ms),
            baud_settle: Duration::from_millis(self.dispatch.baud_settle_ms),
            read_timeout: Duration::from_millis(self.transport.read_timeout_ms),
            write_timeout: Duration::from_millis(self.transport.write_timeout_ms),
            max_retries: self.transport.reconnect.max_retries,
            backoff_base: Duration::from_millis(self.transport.reconnect.backoff_base_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
