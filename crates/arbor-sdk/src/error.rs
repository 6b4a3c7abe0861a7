//! Error types for the Arbor SDK.

use crate::transport::TransportError;
use arbor_concurrency::ControllerError;
use arbor_core::{Address, AddressError, CommandError};
use arbor_store::LogError;
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("Model not opened: {0}")]
    ModelNotOpen(Address),

    #[error("Not a model address: {0}")]
    NotAModel(Address),

    #[error("Command has no model: {0}")]
    NoModel(Address),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SdkError {
    /// True if the server could not be reached and the call may be retried
    /// later without losing anything.
    pub fn is_offline(&self) -> bool {
        matches!(self, SdkError::Transport(TransportError::Offline))
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
