//! The persisted unit of work behind each revision slot.
//!
//! A slot record is created when a writer grabs a free revision and is then
//! only ever moved forward through its status machine:
//!
//! ```text
//! Creating ──► Executing(Command) ──► Executing(Events) ──► Executed
//!    │                 │
//!    │                 ├──► FailedPreconditions
//!    │                 └──► SucceededNoChange
//!    └──► FailedTimeout
//! ```
//!
//! Terminal statuses mean the slot is committed: its locks are released and
//! its outcome will never change again.

use arbor_core::{ActorId, Address, Command, Event, Revision};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store key of one revision slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub model: Address,
    pub revision: Revision,
}

impl SlotKey {
    pub fn new(model: &Address, revision: Revision) -> Self {
        Self {
            model: model.clone(),
            revision,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model, self.revision)
    }
}

/// Addresses a pending change claims exclusive rights over.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSet(Vec<Address>);

impl LockSet {
    /// The smallest set of addresses covering `addresses`: any address
    /// contained by another one in the input is dropped.
    pub fn covering<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> Self {
        let mut candidates: Vec<&Address> = addresses.into_iter().collect();
        candidates.sort_by_key(|a| a.depth());
        let mut locks: Vec<Address> = Vec::new();
        for address in candidates {
            if !locks.iter().any(|held| held.contains(address)) {
                locks.push(address.clone());
            }
        }
        locks.sort();
        Self(locks)
    }

    /// Two lock sets conflict if any address of one contains or is
    /// contained by any address of the other.
    pub fn conflicts_with(&self, other: &LockSet) -> bool {
        self.0
            .iter()
            .any(|mine| other.0.iter().any(|theirs| mine.overlaps(theirs)))
    }

    pub fn addresses(&self) -> &[Address] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Creating,
    Executing,
    Executed,
    SucceededNoChange,
    FailedPreconditions,
    FailedTimeout,
}

impl ChangeStatus {
    pub fn is_committed(&self) -> bool {
        !matches!(self, ChangeStatus::Creating | ChangeStatus::Executing)
    }
}

/// What a slot has persisted so far for roll-forward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChangePayload {
    /// Waiting is over; preconditions still have to be checked.
    Command(Command),
    /// Preconditions passed; these events only need committing.
    Events(Vec<Event>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub actor: ActorId,
    pub locks: LockSet,
    pub status: ChangeStatus,
    /// Unix milliseconds of the owner's last sign of life.
    pub last_activity_ms: u64,
    pub payload: Option<ChangePayload>,
}

impl ChangeRecord {
    /// A freshly grabbed slot.
    pub fn creating(actor: ActorId, locks: LockSet, now_ms: u64) -> Self {
        Self {
            actor,
            locks,
            status: ChangeStatus::Creating,
            last_activity_ms: now_ms,
            payload: None,
        }
    }

    /// A slot that is committed from the start, holding `events`.
    pub fn executed(actor: ActorId, events: Vec<Event>, now_ms: u64) -> Self {
        Self {
            actor,
            locks: LockSet::default(),
            status: ChangeStatus::Executed,
            last_activity_ms: now_ms,
            payload: Some(ChangePayload::Events(events)),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status.is_committed()
    }

    /// A stalled record another process can finish on its owner's behalf.
    pub fn is_resumable(&self) -> bool {
        self.status == ChangeStatus::Executing && self.payload.is_some()
    }

    pub fn is_timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) > timeout_ms
    }

    /// Events of an executed slot; empty for every other outcome.
    pub fn events(&self) -> &[Event] {
        match (&self.status, &self.payload) {
            (ChangeStatus::Executed, Some(ChangePayload::Events(events))) => events,
            _ => &[],
        }
    }

    /// The same record with a new status.
    pub fn with_status(&self, status: ChangeStatus, now_ms: u64) -> Self {
        Self {
            status,
            last_activity_ms: now_ms,
            ..self.clone()
        }
    }

    /// The same record, moved to `Executing` with a new payload.
    pub fn executing(&self, payload: ChangePayload, now_ms: u64) -> Self {
        Self {
            status: ChangeStatus::Executing,
            last_activity_ms: now_ms,
            payload: Some(payload),
            ..self.clone()
        }
    }

    /// The same record with a refreshed activity timestamp.
    pub fn touched(&self, now_ms: u64) -> Self {
        Self {
            last_activity_ms: now_ms,
            ..self.clone()
        }
    }
}

/// A value together with the store version it was read at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Source of wall-clock time for activity timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Wall-clock time from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
