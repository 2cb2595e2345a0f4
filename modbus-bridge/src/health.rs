//! Bridge health tracking.
//!
//! [`BridgeHealth`] counts pass outcomes and follows the availability of the
//! client device. [`HealthSnapshot`] is its serializable view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::snapshot::SyncResult;

/// Consecutive fully failed collection passes before the device is offline.
const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Client device availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Every register answered in the last pass.
    Online,
    /// Not responding for several passes.
    Offline,
    /// Responding, but some registers fail.
    Degraded,
    /// Never polled.
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceState {
    status: DeviceStatus,
    /// Last successful contact (millis since epoch).
    last_seen: i64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Overall health status.
    pub status: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Client device status.
    pub device_status: DeviceStatus,
    /// Last successful contact with the client device (millis since epoch).
    pub last_seen: i64,
    /// Consecutive fully failed collection passes.
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub collection_passes: u64,
    pub provisioning_passes: u64,
    /// Registers read successfully, all passes.
    pub registers_read: u64,
    /// Register reads failed, all passes.
    pub read_errors: u64,
    /// External writes forwarded to the client device.
    pub writes_forwarded: u64,
    /// External writes that failed to forward.
    pub write_errors: u64,
    pub last_collection_duration_ms: u64,
    pub last_provisioning_duration_ms: u64,
}

/// Bridge health metrics.
#[derive(Debug)]
pub struct BridgeHealth {
    start_time: Instant,
    collection_passes: AtomicU64,
    provisioning_passes: AtomicU64,
    registers_read: AtomicU64,
    read_errors: AtomicU64,
    writes_forwarded: AtomicU64,
    write_errors: AtomicU64,
    last_collection_duration_ms: AtomicU64,
    last_provisioning_duration_ms: AtomicU64,
    device: RwLock<DeviceState>,
}

impl Default for BridgeHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            collection_passes: AtomicU64::new(0),
            provisioning_passes: AtomicU64::new(0),
            registers_read: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            writes_forwarded: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            last_collection_duration_ms: AtomicU64::new(0),
            last_provisioning_duration_ms: AtomicU64::new(0),
            device: RwLock::new(DeviceState::default()),
        }
    }

    /// Record the outcome of a collection pass or manual read.
    pub fn record_collection(&self, result: &SyncResult, duration: Duration) {
        self.collection_passes.fetch_add(1, Ordering::SeqCst);
        self.last_collection_duration_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
        self.registers_read
            .fetch_add(result.succeeded.len() as u64, Ordering::SeqCst);
        self.read_errors
            .fetch_add(result.failed.len() as u64, Ordering::SeqCst);

        if result.total() == 0 {
            return;
        }

        let mut device = self.device.write().unwrap_or_else(PoisonError::into_inner);
        if result.failed.is_empty() {
            device.status = DeviceStatus::Online;
            device.consecutive_failures = 0;
            device.last_error = None;
        } else {
            device.last_error = result.errors.values().next().cloned();
            if result.succeeded.is_empty() {
                device.consecutive_failures += 1;
                device.status = if device.consecutive_failures >= OFFLINE_AFTER_FAILURES {
                    DeviceStatus::Offline
                } else {
                    DeviceStatus::Degraded
                };
            } else {
                device.consecutive_failures = 0;
                device.status = DeviceStatus::Degraded;
            }
        }
        if !result.succeeded.is_empty() {
            device.last_seen = chrono::Utc::now().timestamp_millis();
        }
    }

    /// Record the outcome of a provisioning pass or manual write.
    pub fn record_provisioning(&self, forwarded: &SyncResult, duration: Duration) {
        self.provisioning_passes.fetch_add(1, Ordering::SeqCst);
        self.last_provisioning_duration_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
        self.writes_forwarded
            .fetch_add(forwarded.succeeded.len() as u64, Ordering::SeqCst);
        self.write_errors
            .fetch_add(forwarded.failed.len() as u64, Ordering::SeqCst);
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Get a snapshot of current health metrics.
    pub fn snapshot(&self) -> HealthSnapshot {
        let device = self
            .device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let status = match device.status {
            DeviceStatus::Online | DeviceStatus::Unknown => "healthy",
            DeviceStatus::Degraded => "degraded",
            DeviceStatus::Offline => "error",
        };

        HealthSnapshot {
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            device_status: device.status,
            last_seen: device.last_seen,
            consecutive_failures: device.consecutive_failures,
            last_error: device.last_error,
            collection_passes: self.collection_passes.load(Ordering::SeqCst),
            provisioning_passes: self.provisioning_passes.load(Ordering::SeqCst),
            registers_read: self.registers_read.load(Ordering::SeqCst),
            read_errors: self.read_errors.load(Ordering::SeqCst),
            writes_forwarded: self.writes_forwarded.load(Ordering::SeqCst),
            write_errors: self.write_errors.load(Ordering::SeqCst),
            last_collection_duration_ms: self.last_collection_duration_ms.load(Ordering::SeqCst),
            last_provisioning_duration_ms: self
                .last_provisioning_duration_ms
                .load(Ordering::SeqCst),
        }
    }
}
