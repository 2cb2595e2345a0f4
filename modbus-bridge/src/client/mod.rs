//! Client role: access to the downstream field device.
//!
//! [`ClientTransport`] is the raw request seam. [`ClientAdapter`] adds typed
//! values, per-call timeouts and per-register failure isolation on top of it.

pub mod mock;
mod modbus;

pub use mock::MockTransport;
pub use modbus::ModbusClientTransport;

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::catalog::{RegisterBlock, RegisterDescriptor, RegisterKey, RegisterKind, WordOrder};
use crate::codec::{self, RawValue, RegisterValue};
use crate::error::{AccessError, CodecError, ConnectionError, ReadError, TransportError, WriteError};
use crate::settings::{ConnectionSettings, Role};

/// Raw Modbus requests against one downstream device.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Read coils or discrete inputs.
    async fn read_bits(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    /// Read input or holding registers.
    async fn read_words(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), TransportError>;

    async fn write_words(&self, address: u16, words: &[u16]) -> Result<(), TransportError>;
}

/// Typed access to the client device.
#[derive(Clone)]
pub struct ClientAdapter {
    transport: Arc<dyn ClientTransport>,
    word_order: WordOrder,
    timeout: Duration,
}

impl fmt::Debug for ClientAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAdapter")
            .field("word_order", &self.word_order)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ClientAdapter {
    /// Open the transport described by `settings`.
    pub async fn connect(
        settings: &ConnectionSettings,
        word_order: WordOrder,
    ) -> Result<Self, ConnectionError> {
        settings.validate_for(Role::Client)?;
        let transport = ModbusClientTransport::connect(settings).await?;
        Ok(Self::new(Arc::new(transport), word_order, settings.timeout()))
    }

    /// Wrap an already open transport.
    pub fn new(transport: Arc<dyn ClientTransport>, word_order: WordOrder, timeout: Duration) -> Self {
        Self {
            transport,
            word_order,
            timeout,
        }
    }

    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read one descriptor.
    pub async fn read(&self, descriptor: &RegisterDescriptor) -> Result<RegisterValue, ReadError> {
        let key = descriptor.key();
        let raw = self
            .fetch(descriptor.kind, descriptor.address, descriptor.length)
            .await
            .map_err(|e| ReadError::new(key, e))?;
        codec::decode(descriptor, &raw, self.word_order).map_err(|e| ReadError::new(key, e))
    }

    /// Read a contiguous block with one request.
    ///
    /// Returns one result per descriptor. If the bulk request fails, each
    /// descriptor is read on its own so failures stay isolated.
    pub async fn read_block(
        &self,
        block: &RegisterBlock<'_>,
    ) -> Vec<(RegisterKey, Result<RegisterValue, ReadError>)> {
        if let [descriptor] = block.descriptors.as_slice() {
            return vec![(descriptor.key(), self.read(descriptor).await)];
        }

        match self.fetch(block.kind, block.address, block.count).await {
            Ok(raw) => block
                .descriptors
                .iter()
                .map(|descriptor| {
                    let key = descriptor.key();
                    let result = slice(&raw, block.address, descriptor)
                        .and_then(|part| codec::decode(descriptor, &part, self.word_order))
                        .map_err(|e| ReadError::new(key, e));
                    (key, result)
                })
                .collect(),
            Err(e) => {
                debug!(
                    kind = %block.kind,
                    address = block.address,
                    count = block.count,
                    error = %e,
                    "Bulk read failed, reading registers individually"
                );
                let mut results = Vec::with_capacity(block.descriptors.len());
                for descriptor in &block.descriptors {
                    results.push((descriptor.key(), self.read(descriptor).await));
                }
                results
            }
        }
    }

    /// Encode and write a value to one descriptor.
    ///
    /// Returns the value the device now holds, which is `value` narrowed to
    /// the descriptor's type and width (an `f32` float, a signed integer).
    pub async fn write(
        &self,
        descriptor: &RegisterDescriptor,
        value: &RegisterValue,
    ) -> Result<RegisterValue, WriteError> {
        let key = descriptor.key();
        if !descriptor.kind.is_writable() {
            return Err(WriteError::new(key, AccessError::ReadOnly));
        }
        let raw = codec::encode(descriptor, value, self.word_order)
            .map_err(|e| WriteError::new(key, e))?;
        self.write_raw(descriptor, &raw).await?;
        codec::decode(descriptor, &raw, self.word_order).map_err(|e| WriteError::new(key, e))
    }

    /// Write already encoded registers to one descriptor.
    pub async fn write_raw(
        &self,
        descriptor: &RegisterDescriptor,
        raw: &RawValue,
    ) -> Result<(), WriteError> {
        let key = descriptor.key();
        match (descriptor.kind, raw) {
            (RegisterKind::Coil, RawValue::Bits(bits)) => match bits.as_slice() {
                [bit] => self
                    .bounded(self.transport.write_coil(descriptor.address, *bit))
                    .await
                    .map_err(|e| WriteError::new(key, e)),
                _ => Err(WriteError::new(
                    key,
                    CodecError::WrongLength {
                        expected: 1,
                        actual: bits.len(),
                    },
                )),
            },
            (RegisterKind::Holding, RawValue::Words(words)) => {
                if words.len() != descriptor.length as usize {
                    return Err(WriteError::new(
                        key,
                        CodecError::WrongLength {
                            expected: descriptor.length as usize,
                            actual: words.len(),
                        },
                    ));
                }
                self.bounded(self.transport.write_words(descriptor.address, words))
                    .await
                    .map_err(|e| WriteError::new(key, e))
            }
            (RegisterKind::Discrete | RegisterKind::Input, _) => {
                Err(WriteError::new(key, AccessError::ReadOnly))
            }
            _ => Err(WriteError::new(key, CodecError::KindMismatch)),
        }
    }

    async fn fetch(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<RawValue, TransportError> {
        if kind.is_bit() {
            let mut bits = self
                .bounded(self.transport.read_bits(kind, address, count))
                .await?;
            check_len(bits.len(), count)?;
            bits.truncate(count as usize);
            Ok(RawValue::Bits(bits))
        } else {
            let mut words = self
                .bounded(self.transport.read_words(kind, address, count))
                .await?;
            check_len(words.len(), count)?;
            words.truncate(count as usize);
            Ok(RawValue::Words(words))
        }
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

fn check_len(actual: usize, expected: u16) -> Result<(), TransportError> {
    if actual < expected as usize {
        return Err(TransportError::ShortResponse {
            expected: expected as usize,
            actual,
        });
    }
    Ok(())
}

/// Extract a descriptor's part of a block read.
fn slice(
    raw: &RawValue,
    block_address: u16,
    descriptor: &RegisterDescriptor,
) -> Result<RawValue, CodecError> {
    let start = usize::from(descriptor.address - block_address);
    let end = start + usize::from(descriptor.length);
    match raw {
        RawValue::Bits(bits) => bits
            .get(start..end)
            .map(|part| RawValue::Bits(part.to_vec())),
        RawValue::Words(words) => words
            .get(start..end)
            .map(|part| RawValue::Words(part.to_vec())),
    }
    .ok_or(CodecError::WrongLength {
        expected: end,
        actual: match raw {
            RawValue::Bits(bits) => bits.len(),
            RawValue::Words(words) => words.len(),
        },
    })
}
