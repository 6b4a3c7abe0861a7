//! # arbor-store
//!
//! Persistence for Arbor change logs.
//!
//! Each model's log is a sequence of revision slots. A slot is a
//! [`ChangeRecord`] held in a [`BackingStore`] under a [`SlotKey`]; writers
//! race for slots with create-if-absent and move records forward with
//! compare-and-swap. [`StoreChangeLog`] reads the committed prefix of those
//! slots as an ordered event log, while [`MemoryChangeLog`] serves client
//! replicas that only mirror events.

pub mod error;
pub mod log;
pub mod record;
pub mod store;

pub use error::{LogError, Result, StoreError};
pub use log::{ChangeLog, MemoryChangeLog, StoreChangeLog};
pub use record::{
    ChangePayload, ChangeRecord, ChangeStatus, Clock, LockSet, ManualClock, SlotKey, SystemClock,
    Versioned,
};
pub use store::{BackingStore, CreateOutcome, MemoryBackingStore, StoreStats};
