//! tokio-modbus backed client transport (RTU over a serial line, or TCP).

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use super::ClientTransport;
use crate::catalog::RegisterKind;
use crate::error::{ConfigError, ConnectionError, TransportError};
use crate::settings::{ConnectionSettings, Parity, TransportType};

/// A Modbus client context that reopens its link on demand.
///
/// Requests are serialized: one outstanding request per device. The context
/// is checked out for the duration of a request, so a request that fails at
/// the link level, or is cancelled by a timeout, leaves no context behind and
/// the next request reconnects.
#[derive(Debug)]
pub struct ModbusClientTransport {
    settings: ConnectionSettings,
    ctx: Mutex<Option<Context>>,
    endpoint: String,
}

impl ModbusClientTransport {
    /// Open the serial port or TCP connection described by `settings`.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, ConnectionError> {
        let ctx = open(settings).await?;
        let endpoint = settings.endpoint();

        info!(
            transport = settings.transport.as_str(),
            endpoint = %endpoint,
            unit = settings.unit,
            "Connected to Modbus client device"
        );

        Ok(Self {
            settings: settings.clone(),
            ctx: Mutex::new(Some(ctx)),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Take the open context, reconnecting if the last one was dropped.
    async fn checkout(&self, slot: &mut Option<Context>) -> Result<Context, TransportError> {
        if let Some(ctx) = slot.take() {
            return Ok(ctx);
        }
        debug!(endpoint = %self.endpoint, "Reconnecting to Modbus client device");
        let ctx = open(&self.settings)
            .await
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;
        info!(endpoint = %self.endpoint, "Reconnected to Modbus client device");
        Ok(ctx)
    }

    /// Put the context back unless the request broke the link.
    fn checkin<T>(
        &self,
        slot: &mut Option<Context>,
        ctx: Context,
        result: &Result<T, TransportError>,
    ) {
        if let Err(TransportError::Protocol(e)) = result {
            warn!(endpoint = %self.endpoint, error = %e, "Dropping Modbus client link");
            return;
        }
        *slot = Some(ctx);
    }
}

async fn open(settings: &ConnectionSettings) -> Result<Context, ConnectionError> {
    let slave = Slave(settings.unit);
    let endpoint = settings.endpoint();

    let ctx = match settings.transport {
        TransportType::Tcp => {
            let addr = tokio::net::lookup_host((settings.address.as_str(), settings.port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| ConnectionError::InvalidAddress(endpoint.clone()))?;

            tokio::time::timeout(settings.timeout(), tcp::connect_slave(addr, slave))
                .await
                .map_err(|_| ConnectionError::Timeout {
                    address: endpoint.clone(),
                })?
                .map_err(|e| ConnectionError::Connect {
                    address: endpoint.clone(),
                    message: e.to_string(),
                })?
        }
        TransportType::Rtu => {
            let parity = match settings.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            };

            let stop_bits = match settings.stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match settings.data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let baudrate = settings
                .baudrate
                .ok_or(ConfigError::MissingField("baudrate"))?;

            let builder = tokio_serial::new(&settings.address, baudrate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits)
                .timeout(settings.timeout());

            let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                ConnectionError::Serial {
                    port: settings.address.clone(),
                    message: e.to_string(),
                }
            })?;

            rtu::attach_slave(serial, slave)
        }
    };

    Ok(ctx)
}

/// Flatten the nested tokio-modbus result.
fn flatten<T>(
    result: Result<Result<T, ExceptionCode>, tokio_modbus::Error>,
) -> Result<T, TransportError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(TransportError::Exception(format!("{:?}", exception))),
        Err(e) => Err(TransportError::Protocol(e.to_string())),
    }
}

#[async_trait]
impl ClientTransport for ModbusClientTransport {
    async fn read_bits(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        if !kind.is_bit() {
            return Err(TransportError::Unsupported("word"));
        }
        let mut slot = self.ctx.lock().await;
        let mut ctx = self.checkout(&mut slot).await?;
        debug!(endpoint = %self.endpoint, %kind, address, count, "Reading bits");
        let result = match kind {
            RegisterKind::Coil => flatten(ctx.read_coils(address, count).await),
            _ => flatten(ctx.read_discrete_inputs(address, count).await),
        };
        self.checkin(&mut slot, ctx, &result);
        result
    }

    async fn read_words(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if kind.is_bit() {
            return Err(TransportError::Unsupported("bit"));
        }
        let mut slot = self.ctx.lock().await;
        let mut ctx = self.checkout(&mut slot).await?;
        debug!(endpoint = %self.endpoint, %kind, address, count, "Reading registers");
        let result = match kind {
            RegisterKind::Input => flatten(ctx.read_input_registers(address, count).await),
            _ => flatten(ctx.read_holding_registers(address, count).await),
        };
        self.checkin(&mut slot, ctx, &result);
        result
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), TransportError> {
        let mut slot = self.ctx.lock().await;
        let mut ctx = self.checkout(&mut slot).await?;
        let result = flatten(ctx.write_single_coil(address, value).await);
        self.checkin(&mut slot, ctx, &result);
        result
    }

    async fn write_words(&self, address: u16, words: &[u16]) -> Result<(), TransportError> {
        let mut slot = self.ctx.lock().await;
        let mut ctx = self.checkout(&mut slot).await?;
        let result = match words {
            [word] => flatten(ctx.write_single_register(address, *word).await),
            _ => flatten(ctx.write_multiple_registers(address, words).await),
        };
        self.checkin(&mut slot, ctx, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RegisterCatalog;
    use crate::codec::RawValue;
    use crate::host::HostAdapter;
    use crate::settings::Role;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reconnects_after_link_drop() {
        // A peer that accepts the first connection and closes it at once
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = ConnectionSettings::tcp(Role::Client, "127.0.0.1", port, 1);

        let transport = ModbusClientTransport::connect(&settings).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
        drop(listener);

        let first = tokio::time::timeout(
            Duration::from_secs(2),
            transport.read_words(RegisterKind::Holding, 10, 1),
        )
        .await;
        assert!(!matches!(first, Ok(Ok(_))));

        // The device comes back on the same port
        let catalog = RegisterCatalog::parse(
            r#"{ registers: [ { address: 10, kind: "holding" } ] }"#,
        )
        .unwrap();
        let host = HostAdapter::new(Arc::new(catalog));
        host.publish(RegisterKind::Holding, 10, &RawValue::Words(vec![7]))
            .unwrap();
        let server = host
            .expose(&ConnectionSettings::tcp(Role::Host, "127.0.0.1", port, 1))
            .await
            .unwrap();

        assert_eq!(
            transport
                .read_words(RegisterKind::Holding, 10, 1)
                .await
                .unwrap(),
            vec![7]
        );
        assert_eq!(
            transport
                .read_words(RegisterKind::Holding, 10, 1)
                .await
                .unwrap(),
            vec![7]
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_device_reports_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = ConnectionSettings::tcp(Role::Client, "127.0.0.1", port, 1);

        let transport = ModbusClientTransport::connect(&settings).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
        drop(listener);

        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            transport.read_words(RegisterKind::Holding, 0, 1),
        )
        .await;

        // Nothing listens any more, so the reconnect itself fails
        let err = transport
            .read_words(RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
    }
}
