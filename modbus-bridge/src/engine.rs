//! Synchronization engine.
//!
//! Owns the register snapshot and runs the two passes:
//!
//! - collection: client device → snapshot
//! - provisioning: snapshot → host table, and external host writes → client device
//!
//! Every pass and manual operation holds the snapshot lock for its whole
//! duration, so passes of the same kind never overlap.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{RegisterCatalog, RegisterKey};
use crate::client::ClientAdapter;
use crate::codec::{self, RegisterValue};
use crate::error::{AccessError, ReadError, WriteError};
use crate::health::BridgeHealth;
use crate::host::HostAdapter;
use crate::snapshot::{EntryStatus, RegisterSnapshot, SnapshotEntry, SyncResult};

/// Default period of the collection loop.
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Default period of the provisioning loop.
pub const DEFAULT_SYNCHRONISATION_INTERVAL: Duration = Duration::from_secs(10);

/// Default age after which a fresh entry is reported stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Which periodic activities are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    Collecting,
    Provisioning,
    CollectingAndProvisioning,
}

impl EngineState {
    pub fn from_flags(collecting: bool, provisioning: bool) -> Self {
        match (collecting, provisioning) {
            (false, false) => EngineState::Idle,
            (true, false) => EngineState::Collecting,
            (false, true) => EngineState::Provisioning,
            (true, true) => EngineState::CollectingAndProvisioning,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Collecting => write!(f, "collecting"),
            EngineState::Provisioning => write!(f, "provisioning"),
            EngineState::CollectingAndProvisioning => write!(f, "collecting+provisioning"),
        }
    }
}

/// Loop periods and staleness age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub collection_interval: Duration,
    pub synchronisation_interval: Duration,
    pub stale_after: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            collection_interval: DEFAULT_COLLECTION_INTERVAL,
            synchronisation_interval: DEFAULT_SYNCHRONISATION_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Shared state and passes of the bridge.
#[derive(Debug)]
pub struct SyncEngine {
    catalog: Arc<RegisterCatalog>,
    snapshot: Mutex<RegisterSnapshot>,
    client: RwLock<Option<ClientAdapter>>,
    host: HostAdapter,
    health: BridgeHealth,
    timing: RwLock<Timing>,
}

impl SyncEngine {
    pub fn new(catalog: Arc<RegisterCatalog>) -> Self {
        Self {
            snapshot: Mutex::new(RegisterSnapshot::new(&catalog)),
            host: HostAdapter::new(catalog.clone()),
            catalog,
            client: RwLock::new(None),
            health: BridgeHealth::new(),
            timing: RwLock::new(Timing::default()),
        }
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    pub fn host(&self) -> &HostAdapter {
        &self.host
    }

    pub fn health(&self) -> &BridgeHealth {
        &self.health
    }

    pub fn client(&self) -> Option<ClientAdapter> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install or remove the client adapter used by later passes.
    pub fn set_client(&self, client: Option<ClientAdapter>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }

    pub fn timing(&self) -> Timing {
        *self.timing.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update_timing(&self, update: impl FnOnce(&mut Timing)) {
        let mut timing = self.timing.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut *timing);
    }

    /// Copy of the whole snapshot.
    pub async fn snapshot(&self) -> RegisterSnapshot {
        self.snapshot.lock().await.clone()
    }

    pub async fn entry(&self, key: RegisterKey) -> Option<SnapshotEntry> {
        self.snapshot.lock().await.get(&key).cloned()
    }

    /// Read every descriptor from the client device into the snapshot.
    ///
    /// Used by the collection loop and by manual reads.
    pub async fn collect(&self) -> SyncResult {
        let started = Instant::now();
        let mut snapshot = self.snapshot.lock().await;
        let mut result = SyncResult::new();

        match self.client() {
            Some(client) => {
                for block in self.catalog.blocks() {
                    for (key, outcome) in client.read_block(&block).await {
                        apply_read(&mut snapshot, &mut result, key, outcome);
                    }
                }
            }
            None => {
                for descriptor in self.catalog.iter() {
                    let error = ReadError::new(descriptor.key(), AccessError::NotConnected);
                    apply_read(&mut snapshot, &mut result, descriptor.key(), Err(error));
                }
            }
        }
        drop(snapshot);

        let elapsed = started.elapsed();
        self.health.record_collection(&result, elapsed);
        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Collection pass complete"
        );
        result
    }

    /// Publish the snapshot to the host table and forward external writes.
    ///
    /// The result holds the published keys and the outcome of each forwarded
    /// write. Failed forwards stay queued for the next pass.
    pub async fn provision(&self) -> SyncResult {
        let started = Instant::now();
        let mut snapshot = self.snapshot.lock().await;
        let mut result = SyncResult::new();

        let stale_after = self.timing().stale_after;
        let aged: Vec<RegisterKey> = snapshot
            .iter()
            .filter(|(_, entry)| {
                entry.status == EntryStatus::Fresh
                    && entry
                        .updated_at
                        .is_some_and(|at| at.elapsed() >= stale_after)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in aged {
            if let Some(entry) = snapshot.get(&key).map(SnapshotEntry::stale) {
                debug!(register = %key, "Register value is stale");
                snapshot.replace(key, entry);
            }
        }

        let published = self.publish(&snapshot, &mut result);
        let forwarded = self.forward_pending(&mut snapshot).await;
        drop(snapshot);

        result.succeeded.extend(forwarded.succeeded.iter().copied());
        for (key, error) in &forwarded.errors {
            result.record_failure(*key, error);
        }

        let elapsed = started.elapsed();
        self.health.record_provisioning(&forwarded, elapsed);
        info!(
            published,
            forwarded = forwarded.succeeded.len(),
            failed = forwarded.failed.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Provisioning pass complete"
        );
        result
    }

    /// Write fresh and stale values without a pending external write to the host table.
    fn publish(&self, snapshot: &RegisterSnapshot, result: &mut SyncResult) -> usize {
        let pending = self.host.pending_keys();
        let order = self.catalog.word_order();
        let mut published = 0;

        for (key, entry) in snapshot.iter() {
            if !entry.is_publishable() || pending.contains(key) {
                continue;
            }
            let (Some(descriptor), Some(value)) = (self.catalog.get(*key), entry.value) else {
                continue;
            };

            let outcome = codec::encode(descriptor, &value, order)
                .map_err(AccessError::from)
                .and_then(|raw| self.host.publish(key.kind, key.address, &raw));
            match outcome {
                Ok(()) => {
                    published += 1;
                    result.record_success(*key);
                }
                Err(e) => {
                    warn!(register = %key, error = %e, "Failed to publish register");
                    result.record_failure(*key, e);
                }
            }
        }

        published
    }

    async fn forward_pending(&self, snapshot: &mut RegisterSnapshot) -> SyncResult {
        let mut forwarded = SyncResult::new();
        let writes = self.host.take_pending_writes();
        if writes.is_empty() {
            return forwarded;
        }

        let Some(client) = self.client() else {
            debug!(count = writes.len(), "No client connection, keeping external writes queued");
            for write in writes {
                self.host.requeue(write);
            }
            return forwarded;
        };

        let order = self.catalog.word_order();
        for write in writes {
            let key = write.key;
            let Some(descriptor) = self.catalog.get(key) else {
                continue;
            };

            match client.write_raw(descriptor, &write.raw).await {
                Ok(()) => {
                    match codec::decode(descriptor, &write.raw, order) {
                        Ok(value) => snapshot.replace(key, SnapshotEntry::fresh(value)),
                        Err(e) => warn!(register = %key, error = %e, "Forwarded value does not decode"),
                    }
                    debug!(register = %key, "Forwarded external write");
                    forwarded.record_success(key);
                }
                Err(e) => {
                    warn!(register = %key, error = %e, "Failed to forward external write, will retry");
                    forwarded.record_failure(key, &e);
                    if !self.host.requeue(write) {
                        debug!(register = %key, "Newer external write queued, dropping failed one");
                    }
                }
            }
        }

        forwarded
    }

    /// Write values to the client device, one register at a time.
    pub async fn write<I>(&self, writes: I) -> SyncResult
    where
        I: IntoIterator<Item = (RegisterKey, RegisterValue)>,
    {
        let mut snapshot = self.snapshot.lock().await;
        let mut result = SyncResult::new();
        let client = self.client();

        for (key, value) in writes {
            let outcome = match (self.catalog.get(key), client.as_ref()) {
                (None, _) => Err(WriteError::new(key, AccessError::UnknownRegister)),
                (Some(_), None) => Err(WriteError::new(key, AccessError::NotConnected)),
                (Some(descriptor), Some(client)) => client.write(descriptor, &value).await,
            };

            match outcome {
                Ok(written) => {
                    snapshot.replace(key, SnapshotEntry::fresh(written));
                    result.record_success(key);
                }
                Err(e) => {
                    warn!(register = %key, error = %e.reason, "Register write failed");
                    result.record_failure(key, &e);
                }
            }
        }

        result
    }

    /// Run collection passes until `stop` turns true or its sender is dropped.
    pub async fn run_collection(self: Arc<Self>, stop: watch::Receiver<bool>) {
        info!("Collection loop started");
        self.run_periodic(stop, |timing| timing.collection_interval, |engine| async move {
            engine.collect().await;
        })
        .await;
        info!("Collection loop stopped");
    }

    /// Run provisioning passes until `stop` turns true or its sender is dropped.
    pub async fn run_provisioning(self: Arc<Self>, stop: watch::Receiver<bool>) {
        info!("Provisioning loop started");
        self.run_periodic(stop, |timing| timing.synchronisation_interval, |engine| async move {
            engine.provision().await;
        })
        .await;
        info!("Provisioning loop stopped");
    }

    async fn run_periodic<P, F>(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        period: fn(&Timing) -> Duration,
        pass: P,
    ) where
        P: Fn(Arc<Self>) -> F,
        F: std::future::Future<Output = ()>,
    {
        loop {
            if *stop.borrow_and_update() {
                break;
            }

            pass(self.clone()).await;

            // Interval changes apply from the next tick
            let interval = period(&self.timing());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn apply_read(
    snapshot: &mut RegisterSnapshot,
    result: &mut SyncResult,
    key: RegisterKey,
    outcome: Result<RegisterValue, ReadError>,
) {
    match outcome {
        Ok(value) => {
            snapshot.replace(key, SnapshotEntry::fresh(value));
            result.record_success(key);
        }
        Err(e) => {
            warn!(register = %key, error = %e.reason, "Register read failed");
            let entry = snapshot
                .get(&key)
                .map(|previous| previous.failed(&e.reason))
                .unwrap_or_else(|| SnapshotEntry::default().failed(&e.reason));
            snapshot.replace(key, entry);
            result.record_failure(key, &e);
        }
    }
}
