//! Launcher configuration for the `modbus-bridge` binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use modbus_bridge_common::{Error as CommonError, LoggingConfig, load_config};

use crate::bridge::ModbusBridge;
use crate::engine::{DEFAULT_COLLECTION_INTERVAL, DEFAULT_STALE_AFTER, DEFAULT_SYNCHRONISATION_INTERVAL};
use crate::error::ConfigError;
use crate::settings::{ConnectionSettings, Role};

/// Complete launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusBridgeConfig {
    /// Register file, relative paths resolve against the config file
    pub register_file: PathBuf,

    /// Host (Modbus TCP server) settings; the register file may provide them instead
    #[serde(default)]
    pub host: Option<ConnectionSettings>,

    /// Client (field device) settings; the register file may provide them instead
    #[serde(default)]
    pub client: Option<ConnectionSettings>,

    /// Collection loop period in seconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    /// Provisioning loop period in seconds
    #[serde(default = "default_synchronisation_interval")]
    pub synchronisation_interval_secs: u64,

    /// Age in seconds after which a value is reported stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_collection_interval() -> u64 {
    DEFAULT_COLLECTION_INTERVAL.as_secs()
}

fn default_synchronisation_interval() -> u64 {
    DEFAULT_SYNCHRONISATION_INTERVAL.as_secs()
}

fn default_stale_after() -> u64 {
    DEFAULT_STALE_AFTER.as_secs()
}

impl ModbusBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CommonError> {
        let path = path.as_ref();
        let mut config: ModbusBridgeConfig = load_config(path)?;
        config
            .validate()
            .map_err(|e| CommonError::Config(e.to_string()))?;

        if config.register_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.register_file = dir.join(&config.register_file);
            }
        }
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.register_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("register_file"));
        }
        if self.collection_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("collection_interval_secs"));
        }
        if self.synchronisation_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("synchronisation_interval_secs"));
        }
        if self.stale_after_secs == 0 {
            return Err(ConfigError::InvalidInterval("stale_after_secs"));
        }
        if let Some(host) = &self.host {
            host.validate_for(Role::Host)?;
        }
        if let Some(client) = &self.client {
            client.validate_for(Role::Client)?;
        }
        Ok(())
    }

    /// Apply settings and timing to a bridge.
    ///
    /// Settings given here take precedence over the register file's.
    pub fn apply(&self, bridge: &mut ModbusBridge) -> Result<(), ConfigError> {
        if let Some(host) = &self.host {
            bridge.set_connection_settings_host(host.clone())?;
        }
        if let Some(client) = &self.client {
            bridge.set_connection_settings_client(client.clone())?;
        }
        bridge.set_collection_interval(Duration::from_secs(self.collection_interval_secs))?;
        bridge.set_synchronisation_interval(Duration::from_secs(self.synchronisation_interval_secs))?;
        bridge.set_stale_after(Duration::from_secs(self.stale_after_secs))?;
        Ok(())
    }
}
