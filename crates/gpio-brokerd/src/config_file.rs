//! Configuration file support for gpio-brokerd
//!
//! Loads and validates the daemon configuration from a TOML file.
//! Default location: /etc/gpio-broker/broker.toml

use crate::adapter::SimChipSpec;
use crate::adapter::sim::DEFAULT_SIM_LABEL;
use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gpio-broker/broker.toml";

/// Object bus front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Undelivered signals buffered per subscriber
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
}

/// Which line access adapter to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel GPIO character devices
    #[default]
    Cdev,
    /// Simulated chips from the `[sim]` section
    Sim,
}

/// Chip discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugConfig {
    /// Line access adapter
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory holding the gpiochip device nodes
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,
}

/// Logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable debug output
    #[serde(default)]
    pub debug: bool,
}

/// One simulated chip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimChipConfig {
    /// Device name
    pub name: String,

    /// Chip label
    #[serde(default = "default_sim_label")]
    pub label: String,

    /// Number of lines
    pub num_lines: u32,

    /// Line names keyed by offset
    #[serde(default)]
    pub line_names: BTreeMap<String, String>,
}

/// Simulated backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Chips present at startup
    #[serde(default)]
    pub chips: Vec<SimChipConfig>,
}

/// Complete gpio-brokerd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bus configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Hotplug configuration
    #[serde(default)]
    pub hotplug: HotplugConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated chips
    #[serde(default)]
    pub sim: SimConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7270".to_string()
}

fn default_signal_capacity() -> usize {
    1024
}

fn default_dev_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_sim_label() -> String {
    DEFAULT_SIM_LABEL.to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            signal_capacity: default_signal_capacity(),
        }
    }
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            dev_dir: default_dev_dir(),
        }
    }
}

impl SimChipConfig {
    /// Convert to a simulator chip description
    pub fn to_spec(&self) -> Result<SimChipSpec> {
        let mut spec = SimChipSpec::new(self.name.as_str(), self.num_lines)
            .with_label(self.label.as_str());

        for (key, name) in &self.line_names {
            let offset: u32 = key.parse().map_err(|_| {
                BrokerError::Configuration(format!(
                    "sim chip {}: line name key '{}' is not an offset",
                    self.name, key
                ))
            })?;
            if offset >= self.num_lines {
                return Err(BrokerError::Configuration(format!(
                    "sim chip {}: line name for offset {} out of range",
                    self.name, offset
                )));
            }
            spec = spec.with_line_name(offset, name.as_str());
        }

        Ok(spec)
    }
}

impl BrokerConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                BrokerError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(BrokerError::Io(e)),
        }
    }

    /// Parsed HTTP listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.bus.listen_addr.parse().map_err(|e| {
            BrokerError::Configuration(format!(
                "invalid listen_addr '{}': {}",
                self.bus.listen_addr, e
            ))
        })
    }

    /// Simulated chips as adapter descriptions
    pub fn sim_chips(&self) -> Result<Vec<SimChipSpec>> {
        self.sim.chips.iter().map(SimChipConfig::to_spec).collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bus.signal_capacity == 0 {
            return Err(BrokerError::Configuration(
                "signal_capacity must be > 0".to_string(),
            ));
        }

        self.listen_addr()?;

        let mut names = BTreeSet::new();
        for chip in &self.sim.chips {
            if chip.num_lines == 0 {
                return Err(BrokerError::Configuration(format!(
                    "sim chip {} must have at least one line",
                    chip.name
                )));
            }
            if !names.insert(chip.name.as_str()) {
                return Err(BrokerError::Configuration(format!(
                    "duplicate sim chip {}",
                    chip.name
                )));
            }
        }
        self.sim_chips()?;

        Ok(())
    }
}
