//! Error types for the store and log layer.

use crate::record::SlotKey;
use arbor_core::{Address, Revision};
use thiserror::Error;

/// Errors reported by a backing store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transient write contention; the same call may succeed if retried.
    #[error("Store contention on {0}")]
    Contention(SlotKey),

    /// The record changed (or vanished) since it was read.
    #[error("Version mismatch on {key}: expected {expected}, found {actual:?}")]
    VersionMismatch {
        key: SlotKey,
        expected: u64,
        actual: Option<u64>,
    },

    /// The store cannot be reached. Fatal for the current operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: SlotKey, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// Errors reported by a change log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Event does not belong to model {0}")]
    WrongModel(Address),

    #[error("Event at revision {found} cannot follow revision {current}")]
    OutOfOrder { current: Revision, found: Revision },

    #[error("Could not find a free revision after {attempts} attempts")]
    NoFreeRevision { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, LogError>;
