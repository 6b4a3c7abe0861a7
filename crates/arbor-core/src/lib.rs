//! # arbor-core
//!
//! The data model of the Arbor tree store: addresses, commands, events and
//! the pure rules that turn a command plus the current state of a model into
//! an event.
//!
//! ```text
//! repository ─► model ─► object ─► field ─► value
//! ```
//!
//! Every change to a model is ordered in that model's change log. This crate
//! knows nothing about logs or stores; it only answers "given this state,
//! what does this command do?".
//!
//! ## Example
//!
//! ```rust
//! use arbor_core::{execute, ActorId, Address, AtomicCommand, Command, Execution, ModelState, Precondition};
//!
//! let model: Address = "/repo/notes".parse().unwrap();
//! let state = ModelState::new(model.clone());
//!
//! let create: Command = AtomicCommand::add_entity(model, Precondition::SafeStateBound)
//!     .unwrap()
//!     .into();
//! let outcome = execute(&create, &state, &ActorId::new("alice"), 1);
//! assert!(matches!(outcome, Execution::Applied(_)));
//! ```

pub mod address;
pub mod command;
pub mod event;
pub mod execute;
pub mod state;

pub use address::{Address, AddressError, AddressKind, Id};
pub use command::{
    AtomicCommand, ChangeType, Command, CommandError, Precondition, Revision, TransactionCommand,
    Value,
};
pub use event::{ActorId, AtomicEvent, Event, TransactionEvent};
pub use execute::{execute, expand_remove, Execution, Rejection};
pub use state::{FieldState, ModelState, ObjectState};
