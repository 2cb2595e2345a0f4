//! Host role: the Modbus TCP server exposed to external masters.
//!
//! The adapter owns an addressable table mirroring every catalog descriptor.
//! The bridge publishes snapshot values into it; writes from external masters
//! land in it and are queued as [`PendingWrite`]s for the client device.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{debug, error, info, warn};

use crate::catalog::{RegisterCatalog, RegisterDescriptor, RegisterKey, RegisterKind};
use crate::codec::RawValue;
use crate::error::{AccessError, CodecError, ConnectionError};
use crate::settings::{ConnectionSettings, Role, TransportType};

/// A write made by an external master, waiting to be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub key: RegisterKey,
    /// Full content of the descriptor at the time of the write.
    pub raw: RawValue,
}

#[derive(Debug, Default)]
struct HostTable {
    bits: HashMap<(RegisterKind, u16), bool>,
    words: HashMap<(RegisterKind, u16), u16>,
    pending: BTreeMap<RegisterKey, RawValue>,
}

impl HostTable {
    fn read_bits(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<bool>, ExceptionCode> {
        addresses(address, count)?
            .map(|addr| {
                self.bits
                    .get(&(kind, addr))
                    .copied()
                    .ok_or(ExceptionCode::IllegalDataAddress)
            })
            .collect()
    }

    fn read_words(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        addresses(address, count)?
            .map(|addr| {
                self.words
                    .get(&(kind, addr))
                    .copied()
                    .ok_or(ExceptionCode::IllegalDataAddress)
            })
            .collect()
    }

    fn descriptor_raw(&self, descriptor: &RegisterDescriptor) -> RawValue {
        let range = descriptor.address..=descriptor.address.saturating_add(descriptor.length - 1);
        if descriptor.kind.is_bit() {
            RawValue::Bits(
                range
                    .map(|addr| self.bits.get(&(descriptor.kind, addr)).copied().unwrap_or_default())
                    .collect(),
            )
        } else {
            RawValue::Words(
                range
                    .map(|addr| self.words.get(&(descriptor.kind, addr)).copied().unwrap_or_default())
                    .collect(),
            )
        }
    }
}

/// Addresses `address..address + count`, rejecting ranges past the address space.
fn addresses(address: u16, count: u16) -> Result<impl Iterator<Item = u16>, ExceptionCode> {
    if count == 0 || u32::from(address) + u32::from(count) > u32::from(u16::MAX) + 1 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok((0..count).map(move |offset| address + offset))
}

/// Register table exposed to external masters.
#[derive(Debug, Clone)]
pub struct HostAdapter {
    table: Arc<Mutex<HostTable>>,
    catalog: Arc<RegisterCatalog>,
}

impl HostAdapter {
    /// Build the table with every descriptor's registers at zero/false.
    pub fn new(catalog: Arc<RegisterCatalog>) -> Self {
        let mut table = HostTable::default();
        for descriptor in catalog.iter() {
            for offset in 0..descriptor.length {
                let addr = descriptor.address + offset;
                if descriptor.kind.is_bit() {
                    table.bits.insert((descriptor.kind, addr), false);
                } else {
                    table.words.insert((descriptor.kind, addr), 0);
                }
            }
        }

        Self {
            table: Arc::new(Mutex::new(table)),
            catalog,
        }
    }

    fn table(&self) -> MutexGuard<'_, HostTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the Modbus TCP server and start serving this table.
    pub async fn expose(&self, settings: &ConnectionSettings) -> Result<ServerHandle, ConnectionError> {
        settings.validate_for(Role::Host)?;
        if settings.transport != TransportType::Tcp {
            return Err(ConnectionError::Unsupported {
                role: Role::Host,
                transport: settings.transport.as_str(),
            });
        }

        let endpoint = settings.endpoint();
        let listener = TcpListener::bind((settings.address.as_str(), settings.port))
            .await
            .map_err(|source| ConnectionError::Bind {
                address: endpoint.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ConnectionError::Bind {
            address: endpoint.clone(),
            source,
        })?;

        let server = Server::new(listener);
        let adapter = self.clone();

        let task = tokio::spawn(async move {
            let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
                let adapter = adapter.clone();
                async move {
                    debug!(peer = %socket_addr, "Modbus master connected");
                    accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                        Ok(Some(HostService::new(adapter.clone())))
                    })
                }
            };
            let on_process_error = |err: std::io::Error| {
                warn!(error = %err, "Modbus TCP connection error");
            };

            if let Err(e) = server.serve(&on_connected, on_process_error).await {
                error!(error = %e, "Modbus TCP server stopped");
            }
        });

        info!(address = %local_addr, "Modbus TCP host listening");

        Ok(ServerHandle { local_addr, task })
    }

    /// Update the externally visible registers of one descriptor.
    pub fn publish(&self, kind: RegisterKind, address: u16, raw: &RawValue) -> Result<(), AccessError> {
        let key = RegisterKey::new(kind, address);
        let descriptor = self.catalog.get(key).ok_or(AccessError::UnknownRegister)?;

        let mut table = self.table();
        match raw {
            RawValue::Bits(bits) if kind.is_bit() => {
                check_len(descriptor, bits.len())?;
                for (offset, bit) in bits.iter().enumerate() {
                    table.bits.insert((kind, address + offset as u16), *bit);
                }
            }
            RawValue::Words(words) if !kind.is_bit() => {
                check_len(descriptor, words.len())?;
                for (offset, word) in words.iter().enumerate() {
                    table.words.insert((kind, address + offset as u16), *word);
                }
            }
            _ => return Err(CodecError::KindMismatch.into()),
        }
        Ok(())
    }

    /// Current table content of one descriptor.
    pub fn read_raw(&self, key: RegisterKey) -> Option<RawValue> {
        let descriptor = self.catalog.get(key)?;
        Some(self.table().descriptor_raw(descriptor))
    }

    /// Apply a write from an external master.
    ///
    /// Either every addressed register is mapped and updated, or nothing
    /// changes. Each affected descriptor is queued for the client device.
    pub fn apply_incoming_write(
        &self,
        kind: RegisterKind,
        address: u16,
        raw: &RawValue,
    ) -> Result<(), ExceptionCode> {
        if !kind.is_writable() {
            return Err(ExceptionCode::IllegalFunction);
        }

        let mut table = self.table();
        let count = match raw {
            RawValue::Bits(bits) if kind.is_bit() => bits.len(),
            RawValue::Words(words) if !kind.is_bit() => words.len(),
            _ => return Err(ExceptionCode::IllegalFunction),
        };
        let count = u16::try_from(count).map_err(|_| ExceptionCode::IllegalDataValue)?;

        let mut affected = BTreeSet::new();
        for addr in addresses(address, count)? {
            let descriptor = self
                .catalog
                .find_covering(kind, addr)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            affected.insert(descriptor.key());
        }

        match raw {
            RawValue::Bits(bits) => {
                for (offset, bit) in bits.iter().enumerate() {
                    table.bits.insert((kind, address + offset as u16), *bit);
                }
            }
            RawValue::Words(words) => {
                for (offset, word) in words.iter().enumerate() {
                    table.words.insert((kind, address + offset as u16), *word);
                }
            }
        }

        for key in affected {
            if let Some(descriptor) = self.catalog.get(key) {
                let content = table.descriptor_raw(descriptor);
                debug!(register = %key, "Queued external write");
                table.pending.insert(key, content);
            }
        }

        Ok(())
    }

    /// Drain all queued external writes.
    pub fn take_pending_writes(&self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.table().pending)
            .into_iter()
            .map(|(key, raw)| PendingWrite { key, raw })
            .collect()
    }

    /// Put back a write that could not be forwarded.
    ///
    /// Ignored if a newer external write for the same key is already queued.
    pub fn requeue(&self, write: PendingWrite) -> bool {
        let mut table = self.table();
        if table.pending.contains_key(&write.key) {
            return false;
        }
        table.pending.insert(write.key, write.raw);
        true
    }

    /// Keys with a queued external write.
    pub fn pending_keys(&self) -> BTreeSet<RegisterKey> {
        self.table().pending.keys().copied().collect()
    }

    fn read_bits(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<bool>, ExceptionCode> {
        self.table().read_bits(kind, address, count)
    }

    fn read_words(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.table().read_words(kind, address, count)
    }
}

fn check_len(descriptor: &RegisterDescriptor, actual: usize) -> Result<(), AccessError> {
    if actual != descriptor.length as usize {
        return Err(CodecError::WrongLength {
            expected: descriptor.length as usize,
            actual,
        }
        .into());
    }
    Ok(())
}

/// Per-connection Modbus service backed by the host table.
struct HostService {
    adapter: HostAdapter,
}

impl HostService {
    fn new(adapter: HostAdapter) -> Self {
        Self { adapter }
    }
}

impl tokio_modbus::server::Service for HostService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let host = &self.adapter;
        let res = match req {
            Request::ReadCoils(addr, cnt) => host
                .read_bits(RegisterKind::Coil, addr, cnt)
                .map(Response::ReadCoils),
            Request::ReadDiscreteInputs(addr, cnt) => host
                .read_bits(RegisterKind::Discrete, addr, cnt)
                .map(Response::ReadDiscreteInputs),
            Request::ReadInputRegisters(addr, cnt) => host
                .read_words(RegisterKind::Input, addr, cnt)
                .map(Response::ReadInputRegisters),
            Request::ReadHoldingRegisters(addr, cnt) => host
                .read_words(RegisterKind::Holding, addr, cnt)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleCoil(addr, value) => host
                .apply_incoming_write(RegisterKind::Coil, addr, &RawValue::Bits(vec![value]))
                .map(|_| Response::WriteSingleCoil(addr, value)),
            Request::WriteMultipleCoils(addr, values) => host
                .apply_incoming_write(RegisterKind::Coil, addr, &RawValue::Bits(values.to_vec()))
                .map(|_| Response::WriteMultipleCoils(addr, values.len() as u16)),
            Request::WriteSingleRegister(addr, value) => host
                .apply_incoming_write(RegisterKind::Holding, addr, &RawValue::Words(vec![value]))
                .map(|_| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => host
                .apply_incoming_write(
                    RegisterKind::Holding,
                    addr,
                    &RawValue::Words(values.to_vec()),
                )
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16)),
            _ => {
                debug!("Unsupported function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

/// Running Modbus TCP server. Dropping the handle stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server and wait for its task to end.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        info!(address = %self.local_addr, "Modbus TCP host stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> HostAdapter {
        let catalog = RegisterCatalog::parse(
            r#"{ registers: [
                { address: 0, kind: "coil" },
                { address: 3, kind: "discrete" },
                { address: 10, kind: "holding", length: 2, type: "float" },
                { address: 12, kind: "holding" },
                { address: 0, kind: "input" },
            ] }"#,
        )
        .unwrap();
        HostAdapter::new(Arc::new(catalog))
    }

    fn key(kind: RegisterKind, address: u16) -> RegisterKey {
        RegisterKey::new(kind, address)
    }

    #[test]
    fn test_table_starts_at_defaults() {
        let host = adapter();
        assert_eq!(
            host.read_raw(key(RegisterKind::Holding, 10)),
            Some(RawValue::Words(vec![0, 0]))
        );
        assert_eq!(
            host.read_raw(key(RegisterKind::Coil, 0)),
            Some(RawValue::Bits(vec![false]))
        );
        assert_eq!(host.read_raw(key(RegisterKind::Holding, 11)), None);
    }

    #[test]
    fn test_publish() {
        let host = adapter();
        host.publish(RegisterKind::Holding, 10, &RawValue::Words(vec![0x4120, 0]))
            .unwrap();
        assert_eq!(
            host.read_words(RegisterKind::Holding, 10, 3),
            Ok(vec![0x4120, 0, 0])
        );

        assert_eq!(
            host.publish(RegisterKind::Holding, 11, &RawValue::Words(vec![1])),
            Err(AccessError::UnknownRegister)
        );
        assert!(matches!(
            host.publish(RegisterKind::Holding, 10, &RawValue::Words(vec![1])),
            Err(AccessError::Codec(CodecError::WrongLength { .. }))
        ));
    }

    #[test]
    fn test_unmapped_reads() {
        let host = adapter();
        assert_eq!(
            host.read_words(RegisterKind::Holding, 12, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            host.read_bits(RegisterKind::Coil, 65535, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(host.read_bits(RegisterKind::Discrete, 3, 1), Ok(vec![false]));
    }

    #[test]
    fn test_incoming_write_queues_descriptors() {
        let host = adapter();

        // Partial write to the float plus the following register
        host.apply_incoming_write(RegisterKind::Holding, 11, &RawValue::Words(vec![5, 6]))
            .unwrap();

        let pending = host.take_pending_writes();
        assert_eq!(
            pending,
            vec![
                PendingWrite {
                    key: key(RegisterKind::Holding, 10),
                    raw: RawValue::Words(vec![0, 5]),
                },
                PendingWrite {
                    key: key(RegisterKind::Holding, 12),
                    raw: RawValue::Words(vec![6]),
                },
            ]
        );
        assert!(host.pending_keys().is_empty());
    }

    #[test]
    fn test_incoming_write_is_all_or_nothing() {
        let host = adapter();

        assert_eq!(
            host.apply_incoming_write(RegisterKind::Holding, 12, &RawValue::Words(vec![1, 2])),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(host.read_words(RegisterKind::Holding, 12, 1), Ok(vec![0]));
        assert!(host.pending_keys().is_empty());

        assert_eq!(
            host.apply_incoming_write(RegisterKind::Input, 0, &RawValue::Words(vec![1])),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn test_requeue_keeps_newer_write() {
        let host = adapter();
        let coil = key(RegisterKind::Coil, 0);

        host.apply_incoming_write(RegisterKind::Coil, 0, &RawValue::Bits(vec![true]))
            .unwrap();
        let old = host.take_pending_writes().remove(0);

        host.apply_incoming_write(RegisterKind::Coil, 0, &RawValue::Bits(vec![false]))
            .unwrap();
        assert!(!host.requeue(old.clone()));

        let pending = host.take_pending_writes();
        assert_eq!(pending[0].raw, RawValue::Bits(vec![false]));

        assert!(host.requeue(old));
        assert_eq!(host.pending_keys(), BTreeSet::from([coil]));
    }
}
