//! Backing store trait and an in-memory implementation.
//!
//! The store is the only synchronization point between writers. It offers
//! exactly two atomic primitives on a single key: create-if-absent and
//! compare-and-swap against the version a record was read at.

use crate::error::StoreError;
use crate::record::{ChangeRecord, SlotKey, Versioned};
use arbor_core::{Address, Revision};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of a create-if-absent call.
#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome {
    /// The record was stored at this version.
    Created { version: u64 },
    /// The key was already taken by this record.
    Occupied(Versioned<ChangeRecord>),
}

/// Storage for change records, keyed by model and revision.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Atomically store `record` unless `key` already holds one.
    async fn create_if_absent(
        &self,
        key: &SlotKey,
        record: ChangeRecord,
    ) -> Result<CreateOutcome, StoreError>;

    /// Read a record with its current version.
    async fn get(&self, key: &SlotKey) -> Result<Option<Versioned<ChangeRecord>>, StoreError>;

    /// Replace the record at `key` if it is still at `expected_version`,
    /// returning the new version.
    async fn compare_and_swap(
        &self,
        key: &SlotKey,
        expected_version: u64,
        record: ChangeRecord,
    ) -> Result<u64, StoreError>;

    /// Delete every record of `model` above `revision`, returning how many
    /// were removed. Bumps the model's truncation epoch in the same step.
    async fn delete_above(&self, model: &Address, revision: Revision) -> Result<usize, StoreError>;

    /// Number of truncations `model` has gone through. Readers that cache
    /// committed records drop them when this moves.
    async fn truncation_epoch(&self, model: &Address) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    async fn create_if_absent(
        &self,
        key: &SlotKey,
        record: ChangeRecord,
    ) -> Result<CreateOutcome, StoreError> {
        (**self).create_if_absent(key, record).await
    }

    async fn get(&self, key: &SlotKey) -> Result<Option<Versioned<ChangeRecord>>, StoreError> {
        (**self).get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &SlotKey,
        expected_version: u64,
        record: ChangeRecord,
    ) -> Result<u64, StoreError> {
        (**self).compare_and_swap(key, expected_version, record).await
    }

    async fn delete_above(&self, model: &Address, revision: Revision) -> Result<usize, StoreError> {
        (**self).delete_above(model, revision).await
    }

    async fn truncation_epoch(&self, model: &Address) -> Result<u64, StoreError> {
        (**self).truncation_epoch(model).await
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<SlotKey, Versioned<ChangeRecord>>,
    epochs: BTreeMap<Address, u64>,
    next_version: u64,
    /// Number of upcoming creates that fail with contention.
    pending_contention: u32,
    unavailable: bool,
    creates: u64,
    swaps: u64,
}

/// Operation counters of a [`MemoryBackingStore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub creates: u64,
    pub swaps: u64,
}

/// In-memory backing store with fault injection.
///
/// Shared between any number of controllers through an `Arc`, it behaves
/// like a single linearizable key-value store. Tests can make it report
/// contention or unavailability, and can plant records directly to simulate
/// writers that crashed mid-operation.
#[derive(Debug, Default)]
pub struct MemoryBackingStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` create-if-absent calls fail with contention.
    pub fn inject_contention(&self, count: u32) {
        self.inner.lock().pending_contention = count;
    }

    /// Toggle whether every call fails as unavailable.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    /// Store a record without any checks, overwriting what was there.
    pub fn put_unchecked(&self, key: SlotKey, record: ChangeRecord) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_version += 1;
        let version = inner.next_version;
        inner.records.insert(key, Versioned { version, value: record });
        version
    }

    /// All records of `model` in revision order.
    pub fn records_of(&self, model: &Address) -> Vec<(Revision, ChangeRecord)> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|(key, _)| &key.model == model)
            .map(|(key, record)| (key.revision, record.value.clone()))
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            records: inner.records.len(),
            creates: inner.creates,
            swaps: inner.swaps,
        }
    }

    fn check_available(inner: &MemoryInner) -> Result<(), StoreError> {
        if inner.unavailable {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn create_if_absent(
        &self,
        key: &SlotKey,
        record: ChangeRecord,
    ) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner.creates += 1;
        if inner.pending_contention > 0 {
            inner.pending_contention -= 1;
            return Err(StoreError::Contention(key.clone()));
        }
        if let Some(existing) = inner.records.get(key) {
            return Ok(CreateOutcome::Occupied(existing.clone()));
        }
        inner.next_version += 1;
        let version = inner.next_version;
        inner
            .records
            .insert(key.clone(), Versioned { version, value: record });
        Ok(CreateOutcome::Created { version })
    }

    async fn get(&self, key: &SlotKey) -> Result<Option<Versioned<ChangeRecord>>, StoreError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner.records.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &SlotKey,
        expected_version: u64,
        record: ChangeRecord,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner.swaps += 1;
        let actual = inner.records.get(key).map(|r| r.version);
        if actual != Some(expected_version) {
            return Err(StoreError::VersionMismatch {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }
        inner.next_version += 1;
        let version = inner.next_version;
        inner
            .records
            .insert(key.clone(), Versioned { version, value: record });
        Ok(version)
    }

    async fn delete_above(&self, model: &Address, revision: Revision) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let before = inner.records.len();
        inner
            .records
            .retain(|key, _| &key.model != model || key.revision <= revision);
        *inner.epochs.entry(model.clone()).or_insert(0) += 1;
        Ok(before - inner.records.len())
    }

    async fn truncation_epoch(&self, model: &Address) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner.epochs.get(model).copied().unwrap_or(0))
    }
}
