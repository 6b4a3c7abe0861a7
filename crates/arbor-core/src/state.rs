//! Replayable snapshot of a single model.
//!
//! The state is only ever derived from events: an empty model replayed over
//! its change log yields the current tree, and replaying a prefix yields the
//! tree as of that revision. Revision bookkeeping follows three rules:
//!
//! - every event at revision `r` moves the model to `r`,
//! - an event on an object, or on any field of it, moves the object to `r`,
//! - an event on a field (entity or value) moves the field to `r`.

use crate::address::{Address, AddressKind, Id};
use crate::command::{ChangeType, Revision, Value};
use crate::event::{AtomicEvent, Event};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub revision: Revision,
    pub value: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub revision: Revision,
    pub fields: BTreeMap<Id, FieldState>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    address: Address,
    exists: bool,
    revision: Revision,
    objects: BTreeMap<Id, ObjectState>,
}

impl ModelState {
    /// A model that has never been created.
    pub fn new(address: Address) -> Self {
        debug_assert_eq!(address.kind(), AddressKind::Model);
        Self {
            address,
            exists: false,
            revision: 0,
            objects: BTreeMap::new(),
        }
    }

    pub fn replay<'a>(address: Address, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::new(address);
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn model_exists(&self) -> bool {
        self.exists
    }

    /// Revision of the last event applied, whether or not the model exists.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn objects(&self) -> &BTreeMap<Id, ObjectState> {
        &self.objects
    }

    pub fn object(&self, address: &Address) -> Option<&ObjectState> {
        if !self.exists || address.model_address().as_ref() != Some(&self.address) {
            return None;
        }
        self.objects.get(address.object_id()?)
    }

    pub fn field(&self, address: &Address) -> Option<&FieldState> {
        self.object(address)?.fields.get(address.field_id()?)
    }

    /// Whether the entity at `address` exists. The repository always does.
    pub fn exists(&self, address: &Address) -> bool {
        match address.kind() {
            AddressKind::Repository => self.address.parent().as_ref() == Some(address),
            AddressKind::Model => self.exists && address == &self.address,
            AddressKind::Object => self.object(address).is_some(),
            AddressKind::Field => self.field(address).is_some(),
        }
    }

    /// Current revision of an existing entity, `None` if it does not exist.
    pub fn revision_of(&self, address: &Address) -> Option<Revision> {
        match address.kind() {
            AddressKind::Repository => None,
            AddressKind::Model => self.exists(address).then_some(self.revision),
            AddressKind::Object => self.object(address).map(|o| o.revision),
            AddressKind::Field => self.field(address).map(|f| f.revision),
        }
    }

    pub fn value_of(&self, field: &Address) -> Option<&Value> {
        self.field(field).and_then(|f| f.value.as_ref())
    }

    pub fn apply(&mut self, event: &Event) {
        for atomic in event.atomic_events() {
            self.apply_atomic(atomic);
        }
    }

    pub(crate) fn apply_atomic(&mut self, event: &AtomicEvent) {
        if event.changed.model_address().as_ref() != Some(&self.address) {
            debug_assert!(false, "event for {} applied to {}", event.changed, self.address);
            return;
        }
        let revision = event.revision;
        self.revision = revision;

        if event.is_value_event() {
            if let Some(object) = self.object_mut(&event.changed) {
                object.revision = revision;
                if let Some(field) = event
                    .changed
                    .field_id()
                    .and_then(|id| object.fields.get_mut(id))
                {
                    field.revision = revision;
                    field.value = match event.change_type {
                        ChangeType::Remove => None,
                        _ => event.value.clone(),
                    };
                }
            }
            return;
        }

        let adding = event.change_type == ChangeType::Add;
        match event.changed.kind() {
            AddressKind::Repository => {}
            AddressKind::Model => {
                self.exists = adding;
                self.objects.clear();
            }
            AddressKind::Object => {
                if let Some(id) = event.changed.object_id() {
                    if adding {
                        self.objects.insert(
                            id.clone(),
                            ObjectState {
                                revision,
                                fields: BTreeMap::new(),
                            },
                        );
                    } else {
                        self.objects.remove(id);
                    }
                }
            }
            AddressKind::Field => {
                if let Some(object) = self.object_mut(&event.changed) {
                    object.revision = revision;
                    if let Some(id) = event.changed.field_id() {
                        if adding {
                            object.fields.insert(
                                id.clone(),
                                FieldState {
                                    revision,
                                    value: None,
                                },
                            );
                        } else {
                            object.fields.remove(id);
                        }
                    }
                }
            }
        }
    }

    fn object_mut(&mut self, address: &Address) -> Option<&mut ObjectState> {
        self.objects.get_mut(address.object_id()?)
    }
}
