//! Modbus RTU client ⇄ Modbus TCP host bridge.
//!
//! The bridge polls a downstream field device (the *client* role, usually
//! Modbus RTU over a serial line), keeps the values in a shared snapshot, and
//! exposes them through a Modbus TCP server (the *host* role). Writes made by
//! external masters on the host are forwarded to the field device.
//!
//! # Components
//!
//! - [`catalog`] - Register definitions loaded from the register file
//! - [`codec`] - Raw registers ⇄ typed values
//! - [`client`] - Access to the field device
//! - [`host`] - The Modbus TCP server table
//! - [`engine`] - Collection and provisioning passes over the snapshot
//! - [`bridge`] - The [`ModbusBridge`] facade
//!
//! # Register file
//!
//! ```text
//! {
//!   word_order: "big",
//!   registers: [
//!     { name: "temperature", address: 10, kind: "holding", length: 2, type: "float" },
//!     { name: "relay", address: 0, kind: "coil" },
//!   ],
//! }
//! ```

pub mod bridge;
pub mod catalog;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod host;
pub mod settings;
pub mod snapshot;

pub use bridge::ModbusBridge;
pub use catalog::{RegisterCatalog, RegisterDescriptor, RegisterKey, RegisterKind, WordOrder};
pub use codec::RegisterValue;
pub use engine::EngineState;
pub use error::{BridgeError, Result};
pub use settings::{ConnectionSettings, Role};
pub use snapshot::{EntryStatus, SyncResult};
