//! # Configuration Management Module
//!
//! Centralized configuration for the ground station: serial device settings,
//! the radio parameters pushed to the modem at bring-up, session timing, and
//! logging.
//!
//! ## Configuration Structure
//!
//! - [`SerialConfig`] - Device path and line settings
//! - [`RadioConfig`] - LoRa parameters and addressing applied via AT commands
//! - [`SessionConfig`] - Exchange timeout, TIME_WAIT quiet period, polling, retransmission cap
//! - [`LoggingConfig`] - Log level and frame log destination
//!
//! ## Usage
//!
//! ```rust,no_run
//! use groundstation::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("groundstation.toml").await?;
//!     println!("Rover address: {}", config.radio.rover_address);
//!     Config::create_default("groundstation.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! data_bits = 8
//! timeout_secs = 2
//!
//! [radio]
//! spreading_factor = 12
//! bandwidth = 7
//! coding_rate = 2
//! preamble = 5
//! ground_address = 101
//! rover_address = 102
//! network_id = 5
//! band = 915000000
//! uart_baud = 115200
//!
//! [session]
//! exchange_timeout_ms = 5000
//! time_wait_ms = 3000
//! poll_interval_ms = 10
//! max_retransmits = 32
//! close_timeout_ms = 30000
//! configure_radio = true
//!
//! [logging]
//! level = "info"
//! frame_log = "logs/frames.log"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub serial: SerialConfig,
    pub radio: RadioConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub timeout_secs: u64,
}

/// Radio parameters applied once through the modem configurator before a session begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioConfig {
    pub spreading_factor: u8,
    pub bandwidth: u8,
    pub coding_rate: u8,
    pub preamble: u8,
    pub ground_address: u16,
    pub rover_address: u16,
    pub network_id: u8,
    pub band: u64, // Hz
    pub uart_baud: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub exchange_timeout_ms: u64,
    pub time_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// Consecutive retransmissions tolerated before the link is declared stalled.
    /// Zero retransmits forever.
    pub max_retransmits: u32,
    /// Time a session whose handle was dropped gets to finish its FIN exchange
    /// before the device is released anyway.
    pub close_timeout_ms: u64,
    /// Push `[radio]` to the modem when a session opens.
    pub configure_radio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub frame_log: Option<String>,
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn time_wait(&self) -> Duration {
        Duration::from_millis(self.time_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn retransmit_limit(&self) -> Option<u32> {
        (self.max_retransmits > 0).then_some(self.max_retransmits)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content).await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Check value ranges the modem and serial driver would otherwise reject at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(anyhow!("serial.port must not be empty"));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(anyhow!("serial.data_bits must be between 5 and 8, got {}", self.serial.data_bits));
        }
        if self.serial.baud_rate == 0 || self.radio.uart_baud == 0 {
            return Err(anyhow!("baud rates must be non-zero"));
        }
        if !(5..=12).contains(&self.radio.spreading_factor) {
            return Err(anyhow!("radio.spreading_factor must be between 5 and 12, got {}", self.radio.spreading_factor));
        }
        if self.radio.bandwidth > 9 {
            return Err(anyhow!("radio.bandwidth must be between 0 and 9, got {}", self.radio.bandwidth));
        }
        if !(1..=4).contains(&self.radio.coding_rate) {
            return Err(anyhow!("radio.coding_rate must be between 1 and 4, got {}", self.radio.coding_rate));
        }
        if self.radio.ground_address == self.radio.rover_address {
            return Err(anyhow!("radio.ground_address and radio.rover_address must differ"));
        }
        if self.session.exchange_timeout_ms == 0 {
            return Err(anyhow!("session.exchange_timeout_ms must be non-zero"));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            exchange_timeout_ms: 5000,
            time_wait_ms: 3000,
            poll_interval_ms: 10,
            max_retransmits: 32,
            close_timeout_ms: 30_000,
            configure_radio: true,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            spreading_factor: 12,
            bandwidth: 7,
            coding_rate: 2,
            preamble: 5,
            ground_address: 101,
            rover_address: 102,
            network_id: 5,
            band: 915_000_000,
            uart_baud: 115200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial: SerialConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 115200,
                data_bits: 8,
                timeout_secs: 2,
            },
            radio: RadioConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                frame_log: Some("logs/frames.log".to_string()),
            },
        }
    }
}
