//! Commands: intended changes and the preconditions under which they apply.

use crate::address::{Address, AddressKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a change in a model's log.
pub type Revision = u64;

/// Field values. The engine only ever compares them for equality.
pub type Value = serde_json::Value;

/// Errors raised when a command is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Transaction must contain at least one command")]
    EmptyTransaction,

    #[error("Transaction target must be a model or an object: {0}")]
    InvalidTransactionTarget(Address),

    #[error("Command on {changed} lies outside transaction target {target}")]
    OutsideTransaction { target: Address, changed: Address },

    #[error("Expected a field address, got {0}")]
    NotAField(Address),

    #[error("The repository itself cannot be added or removed: {0}")]
    RepositoryEntity(Address),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Add,
    Remove,
    Change,
    Transaction,
}

/// When a command is allowed to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precondition {
    /// Apply regardless of current state; a no-op if already in the target state.
    Forced,
    /// Apply only if the changed entity's existence matches the change
    /// (Add needs it absent, Remove/Change need it present).
    SafeStateBound,
    /// Apply only if the changed entity is currently at this revision.
    SafeRevisionBound(Revision),
}

impl Precondition {
    /// Whether an entity that was at `old` just before a change satisfies this
    /// precondition.
    pub fn is_satisfied_by(&self, old: Option<Revision>) -> bool {
        match self {
            Precondition::Forced | Precondition::SafeStateBound => true,
            Precondition::SafeRevisionBound(expected) => old == Some(*expected),
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Precondition::Forced)
    }
}

/// A change to exactly one address.
///
/// Entity commands add or remove a model, object or field; their target is the
/// parent of the changed address. Value commands add, change or remove the
/// value of a field; target and changed are both the field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicCommand {
    change_type: ChangeType,
    target: Address,
    changed: Address,
    value: Option<Value>,
    precondition: Precondition,
}

impl AtomicCommand {
    pub fn add_entity(changed: Address, precondition: Precondition) -> Result<Self, CommandError> {
        Self::entity(ChangeType::Add, changed, precondition)
    }

    pub fn remove_entity(
        changed: Address,
        precondition: Precondition,
    ) -> Result<Self, CommandError> {
        Self::entity(ChangeType::Remove, changed, precondition)
    }

    pub fn add_value(
        field: Address,
        value: Value,
        precondition: Precondition,
    ) -> Result<Self, CommandError> {
        Self::value_command(ChangeType::Add, field, Some(value), precondition)
    }

    pub fn change_value(
        field: Address,
        value: Value,
        precondition: Precondition,
    ) -> Result<Self, CommandError> {
        Self::value_command(ChangeType::Change, field, Some(value), precondition)
    }

    pub fn remove_value(field: Address, precondition: Precondition) -> Result<Self, CommandError> {
        Self::value_command(ChangeType::Remove, field, None, precondition)
    }

    fn entity(
        change_type: ChangeType,
        changed: Address,
        precondition: Precondition,
    ) -> Result<Self, CommandError> {
        let target = changed
            .parent()
            .ok_or_else(|| CommandError::RepositoryEntity(changed.clone()))?;
        Ok(Self {
            change_type,
            target,
            changed,
            value: None,
            precondition,
        })
    }

    fn value_command(
        change_type: ChangeType,
        field: Address,
        value: Option<Value>,
        precondition: Precondition,
    ) -> Result<Self, CommandError> {
        if field.kind() != AddressKind::Field {
            return Err(CommandError::NotAField(field));
        }
        Ok(Self {
            change_type,
            target: field.clone(),
            changed: field,
            value,
            precondition,
        })
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn changed(&self) -> &Address {
        &self.changed
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    /// True for commands on a field's value rather than on an entity.
    pub fn is_value_command(&self) -> bool {
        self.target == self.changed
    }
}

/// An ordered, non-empty group of atomic commands applied as a unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionCommand {
    target: Address,
    commands: Vec<AtomicCommand>,
}

impl TransactionCommand {
    pub fn new(target: Address, commands: Vec<AtomicCommand>) -> Result<Self, CommandError> {
        if !matches!(target.kind(), AddressKind::Model | AddressKind::Object) {
            return Err(CommandError::InvalidTransactionTarget(target));
        }
        if commands.is_empty() {
            return Err(CommandError::EmptyTransaction);
        }
        if let Some(outside) = commands
            .iter()
            .find(|c| c.changed() == &target || !target.contains(c.changed()))
        {
            return Err(CommandError::OutsideTransaction {
                target,
                changed: outside.changed().clone(),
            });
        }
        Ok(Self { target, commands })
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn commands(&self) -> &[AtomicCommand] {
        &self.commands
    }
}

/// Any change request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Atomic(AtomicCommand),
    Transaction(TransactionCommand),
}

impl Command {
    pub fn change_type(&self) -> ChangeType {
        match self {
            Command::Atomic(command) => command.change_type(),
            Command::Transaction(_) => ChangeType::Transaction,
        }
    }

    pub fn target(&self) -> &Address {
        match self {
            Command::Atomic(command) => command.target(),
            Command::Transaction(txn) => txn.target(),
        }
    }

    /// The model whose log this command is ordered in.
    pub fn model_address(&self) -> Option<Address> {
        match self {
            Command::Atomic(command) => command.changed().model_address(),
            Command::Transaction(txn) => txn.target().model_address(),
        }
    }

    /// The changed address of every atomic member, in order.
    pub fn changed_addresses(&self) -> Vec<&Address> {
        match self {
            Command::Atomic(command) => vec![command.changed()],
            Command::Transaction(txn) => txn.commands().iter().map(|c| c.changed()).collect(),
        }
    }
}

impl From<AtomicCommand> for Command {
    fn from(command: AtomicCommand) -> Self {
        Command::Atomic(command)
    }
}

impl From<TransactionCommand> for Command {
    fn from(txn: TransactionCommand) -> Self {
        Command::Transaction(txn)
    }
}
