//! The bridge facade: the only object callers need.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{RegisterCatalog, RegisterKey, RegisterKind};
use crate::client::{ClientAdapter, ClientTransport};
use crate::codec::RegisterValue;
use crate::engine::{EngineState, SyncEngine, Timing};
use crate::error::{ConfigError, ConnectionError, Result};
use crate::health::HealthSnapshot;
use crate::host::{HostAdapter, ServerHandle};
use crate::settings::{ConnectionSettings, Role};
use crate::snapshot::{RegisterSnapshot, SnapshotEntry, SyncResult};

/// Per-call timeout used by [`ModbusBridge::attach_client`] when no client
/// settings are assigned.
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(1000);

/// A running periodic activity.
#[derive(Debug)]
struct Activity {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Activity {
    fn spawn<F, Fut>(start: F) -> std::result::Result<Self, ConfigError>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let (stop, stopped) = watch::channel(false);
        let task = runtime.spawn(start(stopped));
        Ok(Self { stop, task })
    }

    /// Signal the loop to stop after its current pass.
    fn stop(self) -> JoinHandle<()> {
        let _ = self.stop.send(true);
        self.task
    }
}

/// The running host server and the settings it was exposed with.
#[derive(Debug)]
struct HostServer {
    settings: ConnectionSettings,
    handle: ServerHandle,
}

/// Modbus RTU client ⇄ Modbus TCP host bridge.
///
/// # Example
///
/// ```ignore
/// let mut bridge = ModbusBridge::new("registers.json")?;
/// bridge.set_connection_settings_client(ConnectionSettings::rtu("/dev/ttyUSB0", 9600, 10))?;
/// bridge.set_connection_settings_host(ConnectionSettings::tcp(Role::Host, "0.0.0.0", 502, 1))?;
/// bridge.setup_connection().await?;
/// bridge.set_collecting_client_data(true)?;
/// bridge.set_provisioning_host_data(true)?;
/// ```
#[derive(Debug)]
pub struct ModbusBridge {
    engine: Arc<SyncEngine>,
    host_settings: Option<ConnectionSettings>,
    client_settings: Option<ConnectionSettings>,
    server: Option<HostServer>,
    collection: Option<Activity>,
    provisioning: Option<Activity>,
}

impl ModbusBridge {
    /// Load the register file and build an idle bridge.
    ///
    /// Connection entries of the register file seed the settings of both roles.
    pub fn new(register_file: impl AsRef<Path>) -> Result<Self> {
        let path = register_file.as_ref();
        let catalog = RegisterCatalog::load(path)?;
        info!(
            path = %path.display(),
            registers = catalog.len(),
            "Loaded register catalog"
        );
        Ok(Self::from_catalog(catalog))
    }

    /// Build an idle bridge around an already loaded catalog.
    pub fn from_catalog(catalog: RegisterCatalog) -> Self {
        let mut host_settings = None;
        let mut client_settings = None;
        for settings in catalog.connections() {
            match settings.mode {
                Role::Host => host_settings = Some(settings.clone()),
                Role::Client => client_settings = Some(settings.clone()),
            }
        }

        Self {
            engine: Arc::new(SyncEngine::new(Arc::new(catalog))),
            host_settings,
            client_settings,
            server: None,
            collection: None,
            provisioning: None,
        }
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        self.engine.catalog()
    }

    pub fn connection_settings_host(&self) -> Option<&ConnectionSettings> {
        self.host_settings.as_ref()
    }

    /// Assign host settings. Applied by the next [`setup_connection`](Self::setup_connection).
    pub fn set_connection_settings_host(
        &mut self,
        settings: ConnectionSettings,
    ) -> std::result::Result<(), ConfigError> {
        settings.validate_for(Role::Host)?;
        self.host_settings = Some(settings);
        Ok(())
    }

    pub fn connection_settings_client(&self) -> Option<&ConnectionSettings> {
        self.client_settings.as_ref()
    }

    /// Assign client settings. Applied by the next [`setup_connection`](Self::setup_connection).
    pub fn set_connection_settings_client(
        &mut self,
        settings: ConnectionSettings,
    ) -> std::result::Result<(), ConfigError> {
        settings.validate_for(Role::Client)?;
        self.client_settings = Some(settings);
        Ok(())
    }

    /// Open the client transport and start the host server.
    ///
    /// Replaces both adapters when called again. A host server whose bind
    /// address did not change keeps running. If either side fails, the bridge
    /// keeps its previous client and host server.
    pub async fn setup_connection(&mut self) -> Result<()> {
        let client_settings = self
            .client_settings
            .clone()
            .ok_or(ConnectionError::MissingSettings(Role::Client))?;
        let host_settings = self
            .host_settings
            .clone()
            .ok_or(ConnectionError::MissingSettings(Role::Host))?;

        let client = ClientAdapter::connect(&client_settings, self.catalog().word_order()).await?;
        self.replace_host_server(host_settings.clone()).await?;
        self.engine.set_client(Some(client));

        info!(
            client = %client_settings.endpoint(),
            host = %host_settings.endpoint(),
            "Bridge connections established"
        );
        Ok(())
    }

    /// Use `transport` as the client device.
    pub fn attach_client(&self, transport: Arc<dyn ClientTransport>) {
        let timeout = self
            .client_settings
            .as_ref()
            .map(ConnectionSettings::timeout)
            .unwrap_or(DEFAULT_CLIENT_TIMEOUT);
        self.engine.set_client(Some(ClientAdapter::new(
            transport,
            self.catalog().word_order(),
            timeout,
        )));
        debug!("Client transport attached");
    }

    /// Start only the host server, without a client transport.
    pub async fn expose_host(&mut self) -> Result<SocketAddr> {
        let host_settings = self
            .host_settings
            .clone()
            .ok_or(ConnectionError::MissingSettings(Role::Host))?;
        self.replace_host_server(host_settings).await
    }

    /// Bind the new server before stopping the old one, so a failed bind
    /// leaves the running server in place.
    async fn replace_host_server(&mut self, settings: ConnectionSettings) -> Result<SocketAddr> {
        // The server answers any unit id, so only the bind address matters
        if let Some(server) = self
            .server
            .as_mut()
            .filter(|s| s.settings.address == settings.address && s.settings.port == settings.port)
        {
            server.settings = settings;
            return Ok(server.handle.local_addr());
        }

        let handle = self.engine.host().expose(&settings).await?;
        let addr = handle.local_addr();
        if let Some(old) = self.server.replace(HostServer { settings, handle }) {
            debug!(address = %old.handle.local_addr(), "Stopping previous host server");
            old.handle.shutdown().await;
        }
        Ok(addr)
    }

    /// Address of the running host server.
    pub fn host_address(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|server| server.handle.local_addr())
    }

    pub fn collecting_client_data(&self) -> bool {
        self.collection.is_some()
    }

    /// Start or stop the periodic collection loop.
    pub fn set_collecting_client_data(&mut self, enabled: bool) -> std::result::Result<(), ConfigError> {
        match (enabled, self.collection.take()) {
            (true, Some(activity)) => self.collection = Some(activity),
            (true, None) => {
                let engine = self.engine.clone();
                self.collection = Some(Activity::spawn(|stop| engine.run_collection(stop))?);
                info!(
                    interval_ms = self.collection_interval().as_millis() as u64,
                    "Collecting client data"
                );
            }
            (false, Some(activity)) => {
                drop(activity.stop());
                info!("Stopped collecting client data");
            }
            (false, None) => {}
        }
        Ok(())
    }

    pub fn provisioning_host_data(&self) -> bool {
        self.provisioning.is_some()
    }

    /// Start or stop the periodic provisioning loop.
    pub fn set_provisioning_host_data(&mut self, enabled: bool) -> std::result::Result<(), ConfigError> {
        match (enabled, self.provisioning.take()) {
            (true, Some(activity)) => self.provisioning = Some(activity),
            (true, None) => {
                let engine = self.engine.clone();
                self.provisioning = Some(Activity::spawn(|stop| engine.run_provisioning(stop))?);
                info!(
                    interval_ms = self.synchronisation_interval().as_millis() as u64,
                    "Provisioning host data"
                );
            }
            (false, Some(activity)) => {
                drop(activity.stop());
                info!("Stopped provisioning host data");
            }
            (false, None) => {}
        }
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_flags(self.collecting_client_data(), self.provisioning_host_data())
    }

    pub fn collection_interval(&self) -> Duration {
        self.engine.timing().collection_interval
    }

    pub fn set_collection_interval(&self, interval: Duration) -> std::result::Result<(), ConfigError> {
        self.set_timing("collection_interval", interval, |timing| {
            timing.collection_interval = interval
        })
    }

    pub fn synchronisation_interval(&self) -> Duration {
        self.engine.timing().synchronisation_interval
    }

    pub fn set_synchronisation_interval(
        &self,
        interval: Duration,
    ) -> std::result::Result<(), ConfigError> {
        self.set_timing("synchronisation_interval", interval, |timing| {
            timing.synchronisation_interval = interval
        })
    }

    pub fn stale_after(&self) -> Duration {
        self.engine.timing().stale_after
    }

    pub fn set_stale_after(&self, age: Duration) -> std::result::Result<(), ConfigError> {
        self.set_timing("stale_after", age, |timing| timing.stale_after = age)
    }

    fn set_timing(
        &self,
        name: &'static str,
        value: Duration,
        update: impl FnOnce(&mut Timing),
    ) -> std::result::Result<(), ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::InvalidInterval(name));
        }
        self.engine.update_timing(update);
        debug!(setting = name, value_ms = value.as_millis() as u64, "Timing updated");
        Ok(())
    }

    /// Read every register from the client device now.
    pub async fn read_all_registers(&self) -> SyncResult {
        self.engine.collect().await
    }

    /// Publish the snapshot and forward external writes now.
    pub async fn provision_host_data(&self) -> SyncResult {
        self.engine.provision().await
    }

    /// Write one register on the client device.
    pub async fn write_register(
        &self,
        kind: RegisterKind,
        address: u16,
        value: impl Into<RegisterValue>,
    ) -> SyncResult {
        self.engine
            .write([(RegisterKey::new(kind, address), value.into())])
            .await
    }

    /// Write several registers on the client device; each succeeds or fails on its own.
    pub async fn write_registers<I>(&self, writes: I) -> SyncResult
    where
        I: IntoIterator<Item = (RegisterKey, RegisterValue)>,
    {
        self.engine.write(writes).await
    }

    /// Copy of the current snapshot.
    pub async fn snapshot(&self) -> RegisterSnapshot {
        self.engine.snapshot().await
    }

    pub async fn entry(&self, kind: RegisterKind, address: u16) -> Option<SnapshotEntry> {
        self.engine.entry(RegisterKey::new(kind, address)).await
    }

    /// Last known value of a register.
    pub async fn value(&self, kind: RegisterKind, address: u16) -> Option<RegisterValue> {
        self.entry(kind, address).await.and_then(|entry| entry.value)
    }

    /// Known client values as a JSON object keyed by register name.
    pub async fn client_data(&self) -> serde_json::Value {
        let snapshot = self.engine.snapshot().await;
        let data: serde_json::Map<String, serde_json::Value> = self
            .catalog()
            .iter()
            .filter_map(|descriptor| {
                let value = snapshot.value(&descriptor.key())?;
                Some((descriptor.label(), serde_json::to_value(value).ok()?))
            })
            .collect();
        serde_json::Value::Object(data)
    }

    pub fn host(&self) -> &HostAdapter {
        self.engine.host()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.engine.health().snapshot()
    }

    /// Stop both activities, wait for in-flight passes and stop the host server.
    pub async fn shutdown(&mut self) {
        let tasks: Vec<JoinHandle<()>> = [self.collection.take(), self.provisioning.take()]
            .into_iter()
            .flatten()
            .map(Activity::stop)
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Bridge activity ended abnormally");
            }
        }

        if let Some(server) = self.server.take() {
            server.handle.shutdown().await;
        }
        self.engine.set_client(None);
        info!("Bridge stopped");
    }
}
