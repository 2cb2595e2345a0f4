//! Error types for the Modbus bridge.
//!
//! Catalog, configuration and connection errors are fatal to the operation
//! that raised them. [`ReadError`] and [`WriteError`] describe the failure of a
//! single register and are always recovered inside a pass or bulk operation.

use thiserror::Error;

use crate::catalog::{DataType, RegisterKey};
use crate::codec::RegisterValue;
use crate::settings::Role;

/// Errors raised while loading the register file.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Register file not found: {path}")]
    NotFound { path: String },

    #[error("Failed to read register file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse register file: {0}")]
    Parse(#[from] json5::Error),

    #[error("Unknown register kind '{0}'")]
    UnknownKind(String),

    #[error("Unknown data type '{0}'")]
    UnknownType(String),

    #[error("Register {key}: invalid length {length} for data type '{data_type}'")]
    InvalidLength {
        key: RegisterKey,
        data_type: DataType,
        length: u16,
    },

    #[error("Register {0} exceeds the 16-bit address space")]
    AddressOverflow(RegisterKey),

    #[error("Duplicate register address {0}")]
    DuplicateAddress(RegisterKey),

    #[error("Register {second} overlaps register {first}")]
    Overlap {
        first: RegisterKey,
        second: RegisterKey,
    },

    #[error("Invalid connection settings in register file: {0}")]
    Connection(#[from] ConfigError),
}

/// Errors raised by invalid settings or property values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("Settings are for the {actual} role, expected {expected}")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("Interval '{0}' must be a positive duration")]
    InvalidInterval(&'static str),

    #[error("Periodic activities require a running Tokio runtime")]
    NoRuntime,
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Errors raised while opening a transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No connection settings assigned for the {0} role")]
    MissingSettings(Role),

    #[error("Invalid connection settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to open serial port '{port}': {message}")]
    Serial { port: String, message: String },

    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    #[error("Timed out connecting to {address}")]
    Timeout { address: String },

    #[error("Failed to bind Modbus TCP server on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("The {role} role does not support {transport} transport")]
    Unsupported {
        role: Role,
        transport: &'static str,
    },
}

/// Transport-level failure of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("device returned exception: {0}")]
    Exception(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device unreachable: {0}")]
    Disconnected(String),

    #[error("short response: expected {expected} values, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    #[error("operation not supported for {0} registers")]
    Unsupported(&'static str),
}

/// Failure to convert between raw registers and a typed value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("value {value} does not match data type '{data_type}'")]
    TypeMismatch {
        data_type: DataType,
        value: RegisterValue,
    },

    #[error("value {value} out of range for {length} register(s) of type '{data_type}'")]
    OutOfRange {
        data_type: DataType,
        length: u16,
        value: RegisterValue,
    },

    #[error("expected {expected} raw value(s), got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("raw value kind does not match register kind")]
    KindMismatch,
}

/// Reason a single register access failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccessError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no client connection")]
    NotConnected,

    #[error("register is read-only")]
    ReadOnly,

    #[error("register is not defined in the catalog")]
    UnknownRegister,
}

/// Failure to read one register from the client device.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Failed to read {key}: {reason}")]
pub struct ReadError {
    pub key: RegisterKey,
    #[source]
    pub reason: AccessError,
}

impl ReadError {
    pub fn new(key: RegisterKey, reason: impl Into<AccessError>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Failure to write one register to the client device.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Failed to write {key}: {reason}")]
pub struct WriteError {
    pub key: RegisterKey,
    #[source]
    pub reason: AccessError,
}

impl WriteError {
    pub fn new(key: RegisterKey, reason: impl Into<AccessError>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the bridge facade.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;
