//! # arbor-sync
//!
//! Client-side synchronization for Arbor replicas.
//!
//! A client applies its commands optimistically and queues them in
//! [`PendingChanges`]. On sync it receives the server's events since its last
//! synced revision and [`reconcile`]s them with the queue: confirmed changes
//! are dropped from the queue, unexplained server events are remote changes,
//! and unconfirmed local changes are reported so the caller can decide
//! whether to resubmit them.

pub mod pending;
pub mod reconcile;

pub use pending::{LocalChange, PendingChanges, SeqNo};
pub use reconcile::{
    matches, reconcile, unpack_server_events, MappedChange, ReconciliationResult,
};
