//! Client-side queue of changes awaiting confirmation.

use arbor_core::{Command, Event};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Position of a change in a client's pending queue.
pub type SeqNo = u64;

/// A command a client submitted, with the tentative event applying it to the
/// local replica produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    pub seq: SeqNo,
    pub command: Command,
    /// `None` when the command was a no-op or rejected locally.
    pub event: Option<Event>,
}

impl LocalChange {
    pub fn new(seq: SeqNo, command: Command, event: Option<Event>) -> Self {
        Self {
            seq,
            command,
            event,
        }
    }
}

/// Local changes in submission order, numbered from 1.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingChanges {
    current_seq: SeqNo,
    changes: VecDeque<LocalChange>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a change, returning its sequence number.
    pub fn push(&mut self, command: Command, event: Option<Event>) -> SeqNo {
        self.current_seq += 1;
        self.changes
            .push_back(LocalChange::new(self.current_seq, command, event));
        self.current_seq
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalChange> {
        self.changes.iter()
    }

    /// The queued commands, as sent to the server.
    pub fn commands(&self) -> Vec<Command> {
        self.changes.iter().map(|c| c.command.clone()).collect()
    }

    /// Tentative events of the queue, in order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.changes.iter().filter_map(|c| c.event.as_ref())
    }

    /// Take every queued change, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<LocalChange> {
        self.changes.drain(..).collect()
    }

    /// Take the `count` oldest changes. Changes queued after them stay.
    pub fn take_front(&mut self, count: usize) -> Vec<LocalChange> {
        let count = count.min(self.changes.len());
        self.changes.drain(..count).collect()
    }

    pub fn current_seq(&self) -> SeqNo {
        self.current_seq
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }
}
