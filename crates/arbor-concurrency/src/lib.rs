//! # arbor-concurrency
//!
//! Orders concurrent writers of an Arbor model without any in-process lock.
//!
//! Each command grabs a revision slot in the model's log through the backing
//! store, then waits only for earlier, still uncommitted slots whose address
//! locks overlap its own. Writers that stall are timed out or rolled forward
//! by whoever is waiting on them or reading the log past them, so a crashed
//! process never blocks a model for longer than the activity timeout.
//!
//! ```rust,no_run
//! use arbor_concurrency::{ConcurrencyController, ControllerConfig, SubmitOutcome};
//! use arbor_core::{ActorId, AtomicCommand, Precondition};
//! use arbor_store::MemoryBackingStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let model = "/repo/notes".parse()?;
//! let controller = ConcurrencyController::new(
//!     MemoryBackingStore::new(),
//!     model,
//!     ControllerConfig::default(),
//! );
//!
//! let create = AtomicCommand::add_entity("/repo/notes".parse()?, Precondition::SafeStateBound)?;
//! let outcome = controller.submit(&ActorId::new("alice"), &create.into()).await?;
//! assert_eq!(outcome, SubmitOutcome::Executed(1));
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod locks;

pub use backoff::Backoff;
pub use config::{ControllerConfig, ControllerConfigBuilder};
pub use controller::{ConcurrencyController, SubmitOutcome};
pub use error::{ControllerError, Result};
pub use locks::lock_set;
