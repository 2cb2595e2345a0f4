//! Connection settings for the host and client roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Bridge role a set of connection settings applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Exposes registers to external masters (Modbus TCP server).
    #[serde(alias = "master", alias = "HOST", alias = "MASTER")]
    Host,
    /// Polls the downstream field device.
    #[serde(alias = "slave", alias = "CLIENT", alias = "SLAVE")]
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Modbus TCP
    #[serde(alias = "TCP")]
    Tcp,
    /// Modbus RTU over a serial line
    #[serde(alias = "RTU")]
    Rtu,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::Rtu => "rtu",
        }
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Connection settings for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Transport type: "tcp" or "rtu"
    #[serde(rename = "type")]
    pub transport: TransportType,

    /// Modbus unit/slave ID
    pub unit: u8,

    /// IP address or hostname (TCP), serial device path (RTU)
    pub address: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Baud rate, required for RTU
    #[serde(default)]
    pub baudrate: Option<u32>,

    /// Role these settings apply to ("host"/"master" or "client"/"slave")
    pub mode: Role,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity (default: none)
    #[serde(default)]
    pub parity: Parity,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

const REQUIRED_KEYS: [&str; 4] = ["type", "unit", "address", "mode"];

impl ConnectionSettings {
    /// TCP settings with defaults for everything else.
    pub fn tcp(mode: Role, address: impl Into<String>, port: u16, unit: u8) -> Self {
        Self {
            transport: TransportType::Tcp,
            unit,
            address: address.into(),
            port,
            baudrate: None,
            mode,
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// RTU client settings with defaults for everything else.
    pub fn rtu(address: impl Into<String>, baudrate: u32, unit: u8) -> Self {
        Self {
            transport: TransportType::Rtu,
            unit,
            address: address.into(),
            port: default_modbus_port(),
            baudrate: Some(baudrate),
            mode: Role::Client,
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Build settings from a dictionary-like JSON value and validate them.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let Some(map) = value.as_object() else {
            return Err(ConfigError::invalid(
                "connection",
                "settings must be an object",
            ));
        };

        for key in REQUIRED_KEYS {
            if !map.contains_key(key) {
                return Err(ConfigError::MissingField(key));
            }
        }

        let settings: ConnectionSettings = serde_json::from_value(value)
            .map_err(|e| ConfigError::invalid("connection", e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings on their own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid("address", "cannot be empty"));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("timeout_ms", "must be positive"));
        }

        if self.mode == Role::Client && !(1..=247).contains(&self.unit) {
            return Err(ConfigError::invalid(
                "unit",
                format!("{} is not a valid unit id (use 1-247)", self.unit),
            ));
        }

        match self.transport {
            TransportType::Tcp => {
                if self.port == 0 && self.mode == Role::Client {
                    return Err(ConfigError::invalid("port", "cannot be 0"));
                }
            }
            TransportType::Rtu => {
                if self.mode == Role::Host {
                    return Err(ConfigError::invalid(
                        "type",
                        "the host role is served over tcp only",
                    ));
                }
                match self.baudrate {
                    None => return Err(ConfigError::MissingField("baudrate")),
                    Some(0) => return Err(ConfigError::invalid("baudrate", "must be positive")),
                    Some(_) => {}
                }
                if !(5..=8).contains(&self.data_bits) {
                    return Err(ConfigError::invalid(
                        "data_bits",
                        format!("{} (use 5-8)", self.data_bits),
                    ));
                }
                if !matches!(self.stop_bits, 1 | 2) {
                    return Err(ConfigError::invalid(
                        "stop_bits",
                        format!("{} (use 1 or 2)", self.stop_bits),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Validate the settings for a specific role.
    pub fn validate_for(&self, role: Role) -> Result<(), ConfigError> {
        if self.mode != role {
            return Err(ConfigError::RoleMismatch {
                expected: role,
                actual: self.mode,
            });
        }
        self.validate()
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Human-readable endpoint, used in logs and errors.
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportType::Tcp => format!("{}:{}", self.address, self.port),
            TransportType::Rtu => format!(
                "{}@{}",
                self.address,
                self.baudrate.unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rtu_client() {
        let settings = ConnectionSettings::from_value(json!({
            "type": "rtu",
            "unit": 10,
            "address": "/dev/ttyUSB0",
            "baudrate": 19200,
            "mode": "slave",
            "parity": "even"
        }))
        .unwrap();

        assert_eq!(settings.transport, TransportType::Rtu);
        assert_eq!(settings.mode, Role::Client);
        assert_eq!(settings.baudrate, Some(19200));
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
        assert_eq!(settings.timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_tcp_host() {
        let settings = ConnectionSettings::from_value(json!({
            "type": "tcp",
            "unit": 255,
            "address": "0.0.0.0",
            "mode": "master"
        }))
        .unwrap();

        assert_eq!(settings.mode, Role::Host);
        assert_eq!(settings.port, 502); // default
        assert_eq!(settings.endpoint(), "0.0.0.0:502");
    }

    #[test]
    fn test_missing_fields() {
        let result = ConnectionSettings::from_value(json!({
            "type": "tcp",
            "unit": 1,
            "mode": "client"
        }));
        assert_eq!(result, Err(ConfigError::MissingField("address")));

        let result = ConnectionSettings::from_value(json!({
            "type": "rtu",
            "unit": 1,
            "address": "/dev/ttyS0",
            "mode": "client"
        }));
        assert_eq!(result, Err(ConfigError::MissingField("baudrate")));
    }

    #[test]
    fn test_invalid_values() {
        let result = ConnectionSettings::from_value(json!({
            "type": "can",
            "unit": 1,
            "address": "x",
            "mode": "client"
        }));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let result = ConnectionSettings::from_value(json!({
            "type": "tcp",
            "unit": 0,
            "address": "10.0.0.2",
            "mode": "client"
        }));
        assert!(matches!(result, Err(ConfigError::Invalid { field: "unit", .. })));

        let mut settings = ConnectionSettings::rtu("/dev/ttyS0", 9600, 1);
        settings.stop_bits = 3;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid {
                field: "stop_bits",
                ..
            })
        ));
    }

    #[test]
    fn test_rtu_host_rejected() {
        let mut settings = ConnectionSettings::rtu("/dev/ttyS0", 9600, 1);
        settings.mode = Role::Host;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "type", .. })
        ));
    }

    #[test]
    fn test_role_mismatch() {
        let settings = ConnectionSettings::tcp(Role::Host, "0.0.0.0", 502, 1);
        assert_eq!(
            settings.validate_for(Role::Client),
            Err(ConfigError::RoleMismatch {
                expected: Role::Client,
                actual: Role::Host
            })
        );
        assert!(settings.validate_for(Role::Host).is_ok());
    }
}
