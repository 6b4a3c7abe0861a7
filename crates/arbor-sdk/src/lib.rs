//! # arbor-sdk
//!
//! Server and client facade over the Arbor engine.
//!
//! A [`Server`] owns one [`ConcurrencyController`](arbor_concurrency::ConcurrencyController)
//! per model over a shared backing store and answers sync calls. A [`Client`]
//! keeps local replicas, applies commands to them right away and reconciles
//! with the server whenever it syncs.
//!
//! # Quick Start
//!
//! ```rust
//! use arbor_sdk::prelude::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let server = Arc::new(Server::new(MemoryBackingStore::new(), ControllerConfig::default()));
//! let client = Client::new(MemoryTransport::new(server.clone()), ClientConfig::default());
//!
//! let model: Address = "/notes/todo".parse().unwrap();
//! client.open(&model).unwrap();
//! client
//!     .apply(AtomicCommand::add_entity(model.clone(), Precondition::SafeStateBound).unwrap())
//!     .unwrap();
//!
//! let report = client.sync(&model).await.unwrap();
//! assert_eq!(report.confirmed.len(), 1);
//! assert_eq!(server.current_revision(&model).await.unwrap(), 1);
//! # });
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{
    Client, ClientConfig, ClientConfigBuilder, ClientEvent, LocalOutcome, SyncReport,
};
pub use error::{Result, SdkError};
pub use protocol::{SyncRequest, SyncResponse};
pub use server::Server;
pub use transport::{MemoryTransport, SyncTransport, TransportError};

/// Everything needed to run a server and clients in one process.
pub mod prelude {
    pub use crate::{
        Client, ClientConfig, ClientConfigBuilder, ClientEvent, LocalOutcome, MemoryTransport,
        SdkError, Server, SyncReport, SyncTransport,
    };
    pub use arbor_concurrency::{ControllerConfig, ControllerConfigBuilder, SubmitOutcome};
    pub use arbor_core::{
        ActorId, Address, AtomicCommand, Command, Event, ModelState, Precondition,
        TransactionCommand,
    };
    pub use arbor_store::{ChangeLog, MemoryBackingStore};
}
