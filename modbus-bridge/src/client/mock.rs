//! In-memory client device for tests and dry runs.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::ClientTransport;
use crate::catalog::RegisterKind;
use crate::error::TransportError;

#[derive(Debug, Default)]
struct DeviceState {
    bits: HashMap<(RegisterKind, u16), bool>,
    words: HashMap<(RegisterKind, u16), u16>,
    failing: HashSet<(RegisterKind, u16)>,
    offline: bool,
    latency: Duration,
}

/// Simulated Modbus device.
///
/// Unset addresses read as zero/false. Requests touching a failing address,
/// or any request while offline, fail with [`TransportError::Timeout`].
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<DeviceState>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_bit(&self, kind: RegisterKind, address: u16, value: bool) {
        self.state().bits.insert((kind, address), value);
    }

    pub fn set_word(&self, kind: RegisterKind, address: u16, value: u16) {
        self.state().words.insert((kind, address), value);
    }

    /// Set consecutive words starting at `address`.
    pub fn set_words(&self, kind: RegisterKind, address: u16, values: &[u16]) {
        let mut state = self.state();
        for (offset, value) in values.iter().enumerate() {
            state
                .words
                .insert((kind, address.wrapping_add(offset as u16)), *value);
        }
    }

    pub fn bit(&self, kind: RegisterKind, address: u16) -> bool {
        self.state()
            .bits
            .get(&(kind, address))
            .copied()
            .unwrap_or_default()
    }

    pub fn word(&self, kind: RegisterKind, address: u16) -> u16 {
        self.state()
            .words
            .get(&(kind, address))
            .copied()
            .unwrap_or_default()
    }

    /// Make every request touching `address` fail.
    pub fn fail_address(&self, kind: RegisterKind, address: u16) {
        self.state().failing.insert((kind, address));
    }

    pub fn clear_failure(&self, kind: RegisterKind, address: u16) {
        self.state().failing.remove(&(kind, address));
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Delay applied to every request.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Number of read requests received, including failed ones.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write requests received, including failed ones.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Check a request range and return the latency to apply.
    fn admit(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Duration, TransportError> {
        let state = self.state();
        if state.offline {
            return Err(TransportError::Timeout);
        }
        let end = u32::from(address) + u32::from(count);
        let touches_failing = state
            .failing
            .iter()
            .any(|(k, a)| *k == kind && u32::from(*a) >= u32::from(address) && u32::from(*a) < end);
        if touches_failing {
            return Err(TransportError::Timeout);
        }
        Ok(state.latency)
    }

    async fn delay(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ClientTransport for MockTransport {
    async fn read_bits(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !kind.is_bit() {
            return Err(TransportError::Unsupported("word"));
        }
        let latency = self.admit(kind, address, count)?;
        Self::delay(latency).await;

        let state = self.state();
        Ok((0..count)
            .map(|offset| {
                state
                    .bits
                    .get(&(kind, address.wrapping_add(offset)))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn read_words(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if kind.is_bit() {
            return Err(TransportError::Unsupported("bit"));
        }
        let latency = self.admit(kind, address, count)?;
        Self::delay(latency).await;

        let state = self.state();
        Ok((0..count)
            .map(|offset| {
                state
                    .words
                    .get(&(kind, address.wrapping_add(offset)))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), TransportError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let latency = self.admit(RegisterKind::Coil, address, 1)?;
        Self::delay(latency).await;

        self.set_bit(RegisterKind::Coil, address, value);
        Ok(())
    }

    async fn write_words(&self, address: u16, words: &[u16]) -> Result<(), TransportError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let latency = self.admit(RegisterKind::Holding, address, words.len() as u16)?;
        Self::delay(latency).await;

        self.set_words(RegisterKind::Holding, address, words);
        Ok(())
    }
}
