//! Shared in-memory register snapshot and pass results.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::time::Instant;

use crate::catalog::{RegisterCatalog, RegisterKey};
use crate::codec::RegisterValue;

/// Freshness of a snapshot entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Never read successfully.
    #[default]
    Unread,
    /// Updated by the latest successful read or write.
    Fresh,
    /// Last successful update is older than the staleness age.
    Stale,
    /// Latest access failed; the previous value is retained.
    Failed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Unread => write!(f, "unread"),
            EntryStatus::Fresh => write!(f, "fresh"),
            EntryStatus::Stale => write!(f, "stale"),
            EntryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Last known state of one register.
///
/// Entries are replaced as a whole, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub value: Option<RegisterValue>,
    pub status: EntryStatus,
    /// Monotonic time of the last successful update.
    #[serde(skip)]
    pub updated_at: Option<Instant>,
    /// Wall-clock time of the last successful update (millis since epoch).
    pub timestamp_ms: Option<i64>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SnapshotEntry {
    /// Entry after a successful read or write.
    pub fn fresh(value: RegisterValue) -> Self {
        Self {
            value: Some(value),
            status: EntryStatus::Fresh,
            updated_at: Some(Instant::now()),
            timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Entry after a failed access, keeping the last known good value.
    pub fn failed(&self, error: impl fmt::Display) -> Self {
        Self {
            value: self.value,
            status: EntryStatus::Failed,
            updated_at: self.updated_at,
            timestamp_ms: self.timestamp_ms,
            consecutive_failures: self.consecutive_failures.saturating_add(1),
            last_error: Some(error.to_string()),
        }
    }

    /// Same value, marked stale.
    pub fn stale(&self) -> Self {
        Self {
            status: EntryStatus::Stale,
            ..self.clone()
        }
    }

    /// Whether the value may be published to the host table.
    pub fn is_publishable(&self) -> bool {
        matches!(self.status, EntryStatus::Fresh | EntryStatus::Stale) && self.value.is_some()
    }
}

/// Register values keyed by kind and address.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegisterSnapshot {
    entries: BTreeMap<RegisterKey, SnapshotEntry>,
}

impl RegisterSnapshot {
    /// One unread entry per catalog descriptor.
    pub fn new(catalog: &RegisterCatalog) -> Self {
        Self {
            entries: catalog
                .iter()
                .map(|descriptor| (descriptor.key(), SnapshotEntry::default()))
                .collect(),
        }
    }

    pub fn get(&self, key: &RegisterKey) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &RegisterKey) -> Option<RegisterValue> {
        self.entries.get(key).and_then(|entry| entry.value)
    }

    /// Replace the entry for `key`.
    pub fn replace(&mut self, key: RegisterKey, entry: SnapshotEntry) {
        self.entries.insert(key, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegisterKey, &SnapshotEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries with the given status.
    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }
}

/// Outcome of a pass or bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub succeeded: BTreeSet<RegisterKey>,
    pub failed: BTreeSet<RegisterKey>,
    /// Failure message per failed key.
    pub errors: BTreeMap<RegisterKey, String>,
}

impl SyncResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, key: RegisterKey) {
        self.failed.remove(&key);
        self.errors.remove(&key);
        self.succeeded.insert(key);
    }

    pub fn record_failure(&mut self, key: RegisterKey, error: impl fmt::Display) {
        self.succeeded.remove(&key);
        self.failed.insert(key);
        self.errors.insert(key, error.to_string());
    }

    /// Whether every attempted register succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of registers attempted.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RegisterKind;

    #[test]
    fn test_failed_keeps_last_value() {
        let entry = SnapshotEntry::fresh(RegisterValue::Unsigned(42));
        let failed = entry.failed("request timed out");

        assert_eq!(failed.value, Some(RegisterValue::Unsigned(42)));
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.timestamp_ms, entry.timestamp_ms);
        assert_eq!(failed.consecutive_failures, 1);
        assert_eq!(failed.failed("again").consecutive_failures, 2);
        assert!(!failed.is_publishable());
    }

    #[test]
    fn test_new_snapshot_is_unread() {
        let catalog = RegisterCatalog::parse(
            r#"{ registers: [ { address: 0, kind: "coil" }, { address: 5, kind: "input" } ] }"#,
        )
        .unwrap();
        let snapshot = RegisterSnapshot::new(&catalog);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.count(EntryStatus::Unread), 2);
        assert_eq!(
            snapshot.value(&RegisterKey::new(RegisterKind::Input, 5)),
            None
        );
    }

    #[test]
    fn test_sync_result_last_outcome_wins() {
        let key = RegisterKey::new(RegisterKind::Holding, 1);
        let mut result = SyncResult::new();

        result.record_failure(key, "timeout");
        assert!(!result.is_success());

        result.record_success(key);
        assert!(result.is_success());
        assert!(result.errors.is_empty());
        assert_eq!(result.total(), 1);
    }
}
