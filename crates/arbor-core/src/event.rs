//! Events: immutable records of changes that were actually applied.

use crate::address::{Address, AddressKind};
use crate::command::{ChangeType, Revision, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifies who caused a change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("actor-{}", Ulid::new().to_string().to_lowercase()))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single applied change to one address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicEvent {
    pub actor: ActorId,
    pub change_type: ChangeType,
    pub target: Address,
    pub changed: Address,
    /// New value, for value events that add or change a value.
    pub value: Option<Value>,
    pub old_model_revision: Option<Revision>,
    pub old_object_revision: Option<Revision>,
    pub old_field_revision: Option<Revision>,
    /// The log revision this event was committed at.
    pub revision: Revision,
    /// Generated by the removal of an ancestor rather than commanded directly.
    pub implied: bool,
    pub in_transaction: bool,
}

impl AtomicEvent {
    pub fn is_value_event(&self) -> bool {
        self.target == self.changed
    }

    /// Revision of the changed entity just before this event.
    pub fn old_revision_of_changed(&self) -> Option<Revision> {
        match self.changed.kind() {
            AddressKind::Repository => None,
            AddressKind::Model => self.old_model_revision,
            AddressKind::Object => self.old_object_revision,
            AddressKind::Field => self.old_field_revision,
        }
    }
}

/// The combined record of a transaction, or of a cascading remove.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub actor: ActorId,
    pub target: Address,
    pub events: Vec<AtomicEvent>,
    pub revision: Revision,
}

impl TransactionEvent {
    /// True if this is the expansion of a single remove: implied removes of
    /// descendants followed by the explicit remove of the target.
    pub fn is_remove_bundle(&self) -> bool {
        match self.events.split_last() {
            Some((last, implied)) => {
                !implied.is_empty()
                    && !last.implied
                    && last.change_type == ChangeType::Remove
                    && implied
                        .iter()
                        .all(|e| e.implied && e.change_type == ChangeType::Remove)
            }
            None => false,
        }
    }

    /// The events that were commanded directly.
    pub fn explicit_events(&self) -> impl Iterator<Item = &AtomicEvent> {
        self.events.iter().filter(|e| !e.implied)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Atomic(AtomicEvent),
    Transaction(TransactionEvent),
}

impl Event {
    pub fn revision(&self) -> Revision {
        match self {
            Event::Atomic(event) => event.revision,
            Event::Transaction(txn) => txn.revision,
        }
    }

    pub fn actor(&self) -> &ActorId {
        match self {
            Event::Atomic(event) => &event.actor,
            Event::Transaction(txn) => &txn.actor,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            Event::Atomic(event) => event.change_type,
            Event::Transaction(_) => ChangeType::Transaction,
        }
    }

    pub fn target(&self) -> &Address {
        match self {
            Event::Atomic(event) => &event.target,
            Event::Transaction(txn) => &txn.target,
        }
    }

    /// Every atomic event, in application order.
    pub fn atomic_events(&self) -> &[AtomicEvent] {
        match self {
            Event::Atomic(event) => std::slice::from_ref(event),
            Event::Transaction(txn) => &txn.events,
        }
    }

    pub fn model_address(&self) -> Option<Address> {
        self.atomic_events()
            .first()
            .and_then(|e| e.changed.model_address())
    }

    /// The same event committed at `revision` instead.
    pub fn at_revision(self, revision: Revision) -> Self {
        match self {
            Event::Atomic(event) => Event::Atomic(AtomicEvent { revision, ..event }),
            Event::Transaction(mut txn) => {
                txn.revision = revision;
                for event in &mut txn.events {
                    event.revision = revision;
                }
                Event::Transaction(txn)
            }
        }
    }
}
