//! Per-model change logs.
//!
//! A change log is the totally ordered sequence of events of one model.
//! Revisions increase strictly; slots whose change failed or was a no-op hold
//! no event, so the revisions of consecutive events may have gaps.

use crate::error::{LogError, Result};
use crate::record::{ChangeRecord, Clock, SlotKey, Versioned};
use crate::store::{BackingStore, CreateOutcome};
use arbor_core::{Address, Event, Revision};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound on slots probed by a single administrative append.
const MAX_APPEND_ATTEMPTS: u32 = 10_000;

#[async_trait]
pub trait ChangeLog: Send + Sync {
    fn model(&self) -> &Address;

    /// Revision the log starts after. Events live strictly above it.
    async fn first_revision(&self) -> Result<Revision>;

    /// Highest revision up to which every slot is committed.
    async fn current_revision(&self) -> Result<Revision>;

    /// Events with a revision strictly greater than `revision`, in order, up
    /// to the current revision.
    async fn events_since(&self, revision: Revision) -> Result<Vec<Event>>;

    async fn event_at(&self, revision: Revision) -> Result<Option<Event>>;

    /// Append an already-executed event, returning the revision it was
    /// committed at.
    async fn append(&self, event: Event) -> Result<Revision>;

    /// Drop everything above `revision`. Refused (returning `false`) when
    /// `revision` lies before the first or after the current revision.
    async fn truncate_to_revision(&self, revision: Revision) -> Result<bool>;
}

fn check_model(model: &Address, event: &Event) -> Result<()> {
    match event.model_address() {
        Some(ref address) if address == model => Ok(()),
        _ => Err(LogError::WrongModel(model.clone())),
    }
}

#[derive(Debug)]
struct MemoryLogInner {
    first: Revision,
    current: Revision,
    events: BTreeMap<Revision, Event>,
}

/// A change log held entirely in memory.
///
/// Events keep the revision they carry, which lets a client replica mirror
/// the server's numbering, gaps included.
#[derive(Debug)]
pub struct MemoryChangeLog {
    model: Address,
    inner: RwLock<MemoryLogInner>,
}

impl MemoryChangeLog {
    pub fn new(model: Address) -> Self {
        Self::starting_at(model, 0)
    }

    /// An empty log whose events start after `first`.
    pub fn starting_at(model: Address, first: Revision) -> Self {
        Self {
            model,
            inner: RwLock::new(MemoryLogInner {
                first,
                current: first,
                events: BTreeMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    /// Advance the current revision past slots that hold no event.
    pub fn skip_to(&self, revision: Revision) {
        let mut inner = self.inner.write();
        if revision > inner.current {
            inner.current = revision;
        }
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    fn model(&self) -> &Address {
        &self.model
    }

    async fn first_revision(&self) -> Result<Revision> {
        Ok(self.inner.read().first)
    }

    async fn current_revision(&self) -> Result<Revision> {
        Ok(self.inner.read().current)
    }

    async fn events_since(&self, revision: Revision) -> Result<Vec<Event>> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .range(revision.saturating_add(1)..)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn event_at(&self, revision: Revision) -> Result<Option<Event>> {
        Ok(self.inner.read().events.get(&revision).cloned())
    }

    async fn append(&self, event: Event) -> Result<Revision> {
        check_model(&self.model, &event)?;
        let mut inner = self.inner.write();
        let revision = event.revision();
        if revision <= inner.current {
            return Err(LogError::OutOfOrder {
                current: inner.current,
                found: revision,
            });
        }
        inner.current = revision;
        inner.events.insert(revision, event);
        Ok(revision)
    }

    async fn truncate_to_revision(&self, revision: Revision) -> Result<bool> {
        let mut inner = self.inner.write();
        if revision < inner.first || revision > inner.current {
            return Ok(false);
        }
        inner.events.retain(|r, _| *r <= revision);
        inner.current = revision;
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct SlotCache {
    /// Committed records; they only change again through truncation.
    committed: BTreeMap<Revision, Versioned<ChangeRecord>>,
    /// Every slot up to here is known to be committed.
    contiguous: Revision,
    /// Truncation epoch of the model when the cache was filled.
    epoch: u64,
}

/// A change log read from the change records a [`BackingStore`] holds for one
/// model.
///
/// Committed records are cached after the first read. The cache is dropped
/// whenever the store reports a new truncation epoch for the model, so a
/// truncation by any process is seen by every reader. Uncommitted slots are
/// always read through to the store.
pub struct StoreChangeLog<S> {
    store: S,
    model: Address,
    first: Revision,
    clock: Arc<dyn Clock>,
    cache: RwLock<SlotCache>,
}

impl<S: BackingStore> StoreChangeLog<S> {
    pub fn new(store: S, model: Address, clock: Arc<dyn Clock>) -> Self {
        Self::starting_at(store, model, 0, clock)
    }

    pub fn starting_at(store: S, model: Address, first: Revision, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            model,
            first,
            clock,
            cache: RwLock::new(SlotCache {
                committed: BTreeMap::new(),
                contiguous: first,
                epoch: 0,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn key(&self, revision: Revision) -> SlotKey {
        SlotKey::new(&self.model, revision)
    }

    /// Drop the cache if the model was truncated since it was filled, and
    /// return the epoch now in force.
    async fn refresh(&self) -> Result<u64> {
        let epoch = self.store.truncation_epoch(&self.model).await?;
        let mut cache = self.cache.write();
        if cache.epoch != epoch {
            debug!(model = %self.model, from = cache.epoch, to = epoch, "Dropping slot cache");
            cache.committed.clear();
            cache.contiguous = self.first;
            cache.epoch = epoch;
        }
        Ok(epoch)
    }

    /// The record at `revision`, served from the cache when it is committed.
    pub async fn slot(&self, revision: Revision) -> Result<Option<Versioned<ChangeRecord>>> {
        let epoch = self.refresh().await?;
        self.read_slot(revision, epoch).await
    }

    async fn read_slot(
        &self,
        revision: Revision,
        epoch: u64,
    ) -> Result<Option<Versioned<ChangeRecord>>> {
        let cached = self.cache.read().committed.get(&revision).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let record = self.store.get(&self.key(revision)).await?;
        if let Some(ref record) = record {
            let mut cache = self.cache.write();
            // A truncation in between makes the read stale.
            if cache.epoch == epoch && record.value.is_committed() {
                cache.committed.insert(revision, record.clone());
            }
        }
        Ok(record)
    }

    /// Cache `record` if it is committed.
    pub fn remember(&self, revision: Revision, record: &Versioned<ChangeRecord>) {
        if record.value.is_committed() {
            self.cache
                .write()
                .committed
                .insert(revision, record.clone());
        }
    }

    /// Highest contiguously committed revision as of `epoch`.
    async fn frontier(&self, epoch: u64) -> Result<Revision> {
        let mut current = self.cache.read().contiguous;
        loop {
            match self.read_slot(current + 1, epoch).await? {
                Some(record) if record.value.is_committed() => current += 1,
                _ => break,
            }
        }
        let mut cache = self.cache.write();
        if cache.epoch == epoch && current > cache.contiguous {
            cache.contiguous = current;
        }
        Ok(current)
    }

    /// Events of every executed slot strictly below `revision`, in order.
    /// Uncommitted slots are skipped.
    pub async fn executed_events_below(&self, revision: Revision) -> Result<Vec<Event>> {
        let epoch = self.refresh().await?;
        let mut events = Vec::new();
        let mut slot = self.first + 1;
        while slot < revision {
            if let Some(record) = self.read_slot(slot, epoch).await? {
                events.extend(record.value.events().iter().cloned());
            }
            slot += 1;
        }
        Ok(events)
    }
}

#[async_trait]
impl<S: BackingStore> ChangeLog for StoreChangeLog<S> {
    fn model(&self) -> &Address {
        &self.model
    }

    async fn first_revision(&self) -> Result<Revision> {
        Ok(self.first)
    }

    async fn current_revision(&self) -> Result<Revision> {
        let epoch = self.refresh().await?;
        self.frontier(epoch).await
    }

    async fn events_since(&self, revision: Revision) -> Result<Vec<Event>> {
        let epoch = self.refresh().await?;
        let current = self.frontier(epoch).await?;
        let mut events = Vec::new();
        let mut slot = revision.max(self.first) + 1;
        while slot <= current {
            if let Some(record) = self.read_slot(slot, epoch).await? {
                events.extend(record.value.events().iter().cloned());
            }
            slot += 1;
        }
        Ok(events)
    }

    async fn event_at(&self, revision: Revision) -> Result<Option<Event>> {
        Ok(self
            .slot(revision)
            .await?
            .and_then(|record| record.value.events().first().cloned()))
    }

    async fn append(&self, event: Event) -> Result<Revision> {
        check_model(&self.model, &event)?;
        let mut revision = self.current_revision().await? + 1;
        for _ in 0..MAX_APPEND_ATTEMPTS {
            let key = self.key(revision);
            let record = ChangeRecord::executed(
                event.actor().clone(),
                vec![event.clone().at_revision(revision)],
                self.clock.now_millis(),
            );
            match self.store.create_if_absent(&key, record.clone()).await {
                Ok(CreateOutcome::Created { version }) => {
                    self.remember(revision, &Versioned { version, value: record });
                    debug!(model = %self.model, revision, "Appended executed event");
                    return Ok(revision);
                }
                Ok(CreateOutcome::Occupied(_)) => revision += 1,
                Err(e) if e.is_transient() => revision += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Err(LogError::NoFreeRevision {
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }

    async fn truncate_to_revision(&self, revision: Revision) -> Result<bool> {
        let current = self.current_revision().await?;
        if revision < self.first || revision > current {
            return Ok(false);
        }
        let removed = self.store.delete_above(&self.model, revision).await?;
        self.refresh().await?;
        info!(model = %self.model, revision, removed, "Truncated change log");
        Ok(true)
    }
}
