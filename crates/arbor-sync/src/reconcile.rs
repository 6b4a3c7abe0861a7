//! Alignment of a client's pending changes with the server's event stream.
//!
//! The server's events since the last sync are the truth. Some of them are
//! the confirmation of the client's own pending changes, some are remote
//! changes the client has not seen yet, and some pending changes never made
//! it (they were rejected, or lost). The longest common subsequence of the
//! two sequences, under [`matches`], tells these cases apart.

use crate::pending::LocalChange;
use arbor_core::{AtomicCommand, AtomicEvent, ChangeType, Command, Event, TransactionEvent};
use serde::{Deserialize, Serialize};

/// A pending change and the server event confirming it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappedChange {
    pub local: LocalChange,
    pub server: Event,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// Confirmed pairs, in order.
    pub mapped: Vec<MappedChange>,
    /// Pending changes the server never confirmed.
    pub non_mapped_local_changes: Vec<LocalChange>,
    /// Server events no pending change explains: remote state.
    pub non_mapped_server_events: Vec<Event>,
}

impl ReconciliationResult {
    pub fn is_fully_confirmed(&self) -> bool {
        self.non_mapped_local_changes.is_empty()
    }
}

/// Split remove bundles into their atomic events. A client commands the
/// remove of the root only, so the bundle as a whole never has a
/// client-side counterpart.
pub fn unpack_server_events(events: &[Event]) -> Vec<Event> {
    let mut unpacked = Vec::with_capacity(events.len());
    for event in events {
        match event {
            Event::Transaction(txn) if txn.is_remove_bundle() => {
                unpacked.extend(txn.events.iter().cloned().map(Event::Atomic));
            }
            other => unpacked.push(other.clone()),
        }
    }
    unpacked
}

/// Whether `event` is the server's record of `change`.
pub fn matches(event: &Event, change: &LocalChange) -> bool {
    match (event, &change.command) {
        (Event::Atomic(event), Command::Atomic(command)) => atomic_matches(event, command),
        (Event::Transaction(txn), Command::Transaction(command)) => {
            txn.target == *command.target() && members_match(txn, command.commands())
        }
        _ => false,
    }
}

fn atomic_matches(event: &AtomicEvent, command: &AtomicCommand) -> bool {
    !event.implied
        && change_type_matches(event, command)
        && event.changed == *command.changed()
        && event.target == *command.target()
        && event.value.as_ref() == command.value()
        && precondition_holds(event, command)
}

/// A forced value write emits `Add` or `Change` depending on whether the
/// field held a value, so either confirms it.
fn change_type_matches(event: &AtomicEvent, command: &AtomicCommand) -> bool {
    let forced_write = command.is_value_command()
        && command.precondition().is_forced()
        && matches!(command.change_type(), ChangeType::Add | ChangeType::Change);
    if forced_write {
        matches!(event.change_type, ChangeType::Add | ChangeType::Change)
    } else {
        event.change_type == command.change_type()
    }
}

fn precondition_holds(event: &AtomicEvent, command: &AtomicCommand) -> bool {
    // An absent entity has no revision to bind to.
    if !command.is_value_command() && command.change_type() == ChangeType::Add {
        return true;
    }
    command
        .precondition()
        .is_satisfied_by(event.old_revision_of_changed())
}

/// The explicit events of `txn` must be confirmations of members, in member
/// order. Members that were no-ops on the server emitted nothing.
fn members_match(txn: &TransactionEvent, members: &[AtomicCommand]) -> bool {
    let mut remaining = members.iter();
    txn.explicit_events()
        .all(|event| remaining.any(|member| atomic_matches(event, member)))
}

/// Align pending `local` changes with the `server` events received for the
/// same window.
///
/// Remove bundles are unpacked first. Ties in the alignment are broken by
/// skipping the server event, so an ambiguous local change is matched as
/// late as possible.
pub fn reconcile(local: &[LocalChange], server: &[Event]) -> ReconciliationResult {
    let server = unpack_server_events(server);
    let (n, m) = (server.len(), local.len());

    // lcs[i][j]: length of the alignment of server[i..] with local[j..].
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if matches(&server[i], &local[j]) {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut result = ReconciliationResult::default();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if lcs[i + 1][j] == lcs[i][j] {
            result.non_mapped_server_events.push(server[i].clone());
            i += 1;
        } else if matches(&server[i], &local[j]) {
            result.mapped.push(MappedChange {
                local: local[j].clone(),
                server: server[i].clone(),
            });
            i += 1;
            j += 1;
        } else {
            result.non_mapped_local_changes.push(local[j].clone());
            j += 1;
        }
    }
    result.non_mapped_server_events.extend(server[i..].iter().cloned());
    result
        .non_mapped_local_changes
        .extend(local[j..].iter().cloned());
    result
}
