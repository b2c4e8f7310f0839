//! Daemon configuration
//!
//! Every section is optional in the TOML file; missing values take the
//! defaults of the observed sensor. CLI flags override the file afterwards.

use crate::drl::DrlConfig;
use crate::error::ConfigError;
use crate::lin::LinConfig;
use crate::scheduler::SchedulerConfig;
use crate::serial::DEFAULT_BAUD;
use crate::transport::{ReassemblyStrategy, TransportConfig};
use crate::websocket::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Physical bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serial device path (e.g. /dev/ttyUSB0, COM3)
    pub device: Option<String>,
    /// FTDI device index, used instead of `device` with the `ftdi` feature
    pub ftdi_index: Option<i32>,
    pub baud_rate: u32,
    #[serde(flatten)]
    pub lin: LinConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: None,
            ftdi_index: None,
            baud_rate: DEFAULT_BAUD,
            lin: LinConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bus: BusConfig,
    pub transport: TransportConfig,
    pub scheduler: SchedulerConfig,
    pub drl: DrlConfig,
    pub websocket: WebSocketConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the stack cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.baud_rate == 0 {
            return Err(ConfigError::invalid("bus.baud_rate", "must be nonzero"));
        }
        // echoed sync + PID, one data byte, checksum
        if self.bus.lin.rx_capacity < 4 {
            return Err(ConfigError::invalid(
                "bus.rx_capacity",
                "must hold at least the echoed header, one data byte and the checksum",
            ));
        }
        if self.transport.max_retries == 0 {
            return Err(ConfigError::invalid("transport.max_retries", "must be at least 1"));
        }
        if let ReassemblyStrategy::FlowControl { st_min, .. } = self.transport.strategy {
            if st_min > 0x7F && !(0xF1..=0xF9).contains(&st_min) {
                return Err(ConfigError::invalid(
                    "transport.strategy.st_min",
                    format!("reserved value 0x{:02X}", st_min),
                ));
            }
        }
        if self.scheduler.env_divisor == 0 {
            return Err(ConfigError::invalid("scheduler.env_divisor", "must be at least 1"));
        }
        if self.scheduler.period_ms == 0 {
            return Err(ConfigError::invalid("scheduler.period_ms", "must be nonzero"));
        }
        if self.scheduler.command.sensitivity > 7 {
            return Err(ConfigError::invalid("scheduler.command.sensitivity", "range is 0..7"));
        }
        if self.drl.bright <= self.drl.dark {
            return Err(ConfigError::invalid(
                "drl.bright",
                format!(
                    "0x{:04X} must be above drl.dark 0x{:04X}",
                    self.drl.bright, self.drl.dark
                ),
            ));
        }
        if self.websocket.max_connections == 0 {
            return Err(ConfigError::invalid("websocket.max_connections", "must be at least 1"));
        }
        Ok(())
    }
}
