//! Errors surfaced to callers of the controller.
//!
//! Contention, lost compare-and-swaps and stalled predecessors are all
//! resolved internally; only conditions the controller cannot recover from
//! reach the caller.

use arbor_core::Address;
use arbor_store::{LogError, SlotKey, StoreError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// The backing store could not be reached. Nothing was committed on the
    /// caller's behalf; a grabbed slot is left for another writer to time out.
    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt change record at {key}: {reason}")]
    CorruptRecord { key: SlotKey, reason: String },

    #[error("No revision slot could be grabbed after {attempts} attempts")]
    GrabExhausted { attempts: u32 },

    #[error("Command does not belong to model {0}")]
    WrongModel(Address),
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { key, reason } => ControllerError::CorruptRecord { key, reason },
            StoreError::Unavailable(reason) => ControllerError::StoreUnavailable(reason),
            // Transient failures that escaped every retry.
            other => ControllerError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<LogError> for ControllerError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Store(store) => store.into(),
            LogError::WrongModel(model) => ControllerError::WrongModel(model),
            LogError::NoFreeRevision { attempts } => ControllerError::GrabExhausted { attempts },
            LogError::OutOfOrder { .. } => ControllerError::StoreUnavailable(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
