//! Precondition evaluation and event generation.
//!
//! [`execute`] decides, for a command and the state of its model, whether the
//! command is rejected, is a no-op, or applies, and in the last case produces
//! the resulting event. Nothing here touches a log: callers persist the event
//! only after the whole command has been validated.

use crate::address::{Address, AddressKind};
use crate::command::{AtomicCommand, ChangeType, Command, Precondition, Revision, Value};
use crate::event::{ActorId, AtomicEvent, Event, TransactionEvent};
use crate::state::ModelState;
use thiserror::Error;

/// Why a command did not apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Target does not exist: {0}")]
    TargetMissing(Address),

    #[error("Already exists: {0}")]
    AlreadyExists(Address),

    #[error("Does not exist: {0}")]
    Missing(Address),

    #[error("Revision mismatch on {address}: expected {expected}, found {actual:?}")]
    RevisionMismatch {
        address: Address,
        expected: Revision,
        actual: Option<Revision>,
    },

    #[error("Command does not belong to model {0}")]
    WrongModel(Address),

    #[error("Unsupported change on an entity: {0}")]
    Unsupported(Address),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Execution {
    Rejected(Rejection),
    NoChange,
    Applied(Event),
}

enum Step {
    NoChange,
    Events(Vec<AtomicEvent>),
}

/// Evaluate `command` against `state` as if committed at `revision`.
pub fn execute(
    command: &Command,
    state: &ModelState,
    actor: &ActorId,
    revision: Revision,
) -> Execution {
    if command.model_address().as_ref() != Some(state.address()) {
        return Execution::Rejected(Rejection::WrongModel(state.address().clone()));
    }

    match command {
        Command::Atomic(cmd) => match evaluate(cmd, state, actor, revision) {
            Err(rejection) => Execution::Rejected(rejection),
            Ok(Step::NoChange) => Execution::NoChange,
            Ok(Step::Events(mut events)) => {
                if events.len() == 1 {
                    Execution::Applied(Event::Atomic(events.remove(0)))
                } else {
                    for event in &mut events {
                        event.in_transaction = true;
                    }
                    Execution::Applied(Event::Transaction(TransactionEvent {
                        actor: actor.clone(),
                        target: cmd.target().clone(),
                        events,
                        revision,
                    }))
                }
            }
        },
        Command::Transaction(txn) => {
            let mut working = state.clone();
            let mut events = Vec::new();
            for cmd in txn.commands() {
                match evaluate(cmd, &working, actor, revision) {
                    Err(rejection) => return Execution::Rejected(rejection),
                    Ok(Step::NoChange) => {}
                    Ok(Step::Events(produced)) => {
                        for mut event in produced {
                            event.in_transaction = true;
                            working.apply_atomic(&event);
                            events.push(event);
                        }
                    }
                }
            }
            if events.is_empty() {
                Execution::NoChange
            } else {
                Execution::Applied(Event::Transaction(TransactionEvent {
                    actor: actor.clone(),
                    target: txn.target().clone(),
                    events,
                    revision,
                }))
            }
        }
    }
}

fn evaluate(
    cmd: &AtomicCommand,
    state: &ModelState,
    actor: &ActorId,
    revision: Revision,
) -> Result<Step, Rejection> {
    if !state.exists(cmd.target()) {
        return Err(Rejection::TargetMissing(cmd.target().clone()));
    }
    if cmd.is_value_command() {
        evaluate_value(cmd, state, actor, revision)
    } else {
        evaluate_entity(cmd, state, actor, revision)
    }
}

fn evaluate_entity(
    cmd: &AtomicCommand,
    state: &ModelState,
    actor: &ActorId,
    revision: Revision,
) -> Result<Step, Rejection> {
    let changed = cmd.changed();
    let present = state.exists(changed);

    match cmd.change_type() {
        ChangeType::Add => {
            if !present {
                let event = atomic_event(
                    state,
                    actor,
                    ChangeType::Add,
                    cmd.target(),
                    changed,
                    None,
                    revision,
                    false,
                );
                Ok(Step::Events(vec![event]))
            } else if cmd.precondition().is_forced() {
                Ok(Step::NoChange)
            } else {
                Err(Rejection::AlreadyExists(changed.clone()))
            }
        }
        ChangeType::Remove => {
            if !present {
                return if cmd.precondition().is_forced() {
                    Ok(Step::NoChange)
                } else {
                    Err(Rejection::Missing(changed.clone()))
                };
            }
            check_revision(cmd.precondition(), changed, state)?;
            Ok(Step::Events(expand_remove(state, changed, actor, revision)))
        }
        ChangeType::Change | ChangeType::Transaction => Err(Rejection::Unsupported(changed.clone())),
    }
}

fn evaluate_value(
    cmd: &AtomicCommand,
    state: &ModelState,
    actor: &ActorId,
    revision: Revision,
) -> Result<Step, Rejection> {
    let field = cmd.changed();
    check_revision(cmd.precondition(), field, state)?;

    let forced = cmd.precondition().is_forced();
    let current = state.value_of(field);
    let emit = |change_type: ChangeType, value: Option<&Value>| -> Result<Step, Rejection> {
        Ok(Step::Events(vec![atomic_event(
            state,
            actor,
            change_type,
            field,
            field,
            value.cloned(),
            revision,
            false,
        )]))
    };

    match (cmd.change_type(), current) {
        (ChangeType::Add, None) => emit(ChangeType::Add, cmd.value()),
        (ChangeType::Add, Some(existing)) if forced => {
            if Some(existing) == cmd.value() {
                Ok(Step::NoChange)
            } else {
                emit(ChangeType::Change, cmd.value())
            }
        }
        (ChangeType::Add, Some(_)) => Err(Rejection::AlreadyExists(field.clone())),
        (ChangeType::Change, Some(existing)) => {
            if Some(existing) == cmd.value() {
                Ok(Step::NoChange)
            } else {
                emit(ChangeType::Change, cmd.value())
            }
        }
        (ChangeType::Change, None) if forced => emit(ChangeType::Add, cmd.value()),
        (ChangeType::Change, None) => Err(Rejection::Missing(field.clone())),
        (ChangeType::Remove, Some(_)) => emit(ChangeType::Remove, None),
        (ChangeType::Remove, None) if forced => Ok(Step::NoChange),
        (ChangeType::Remove, None) => Err(Rejection::Missing(field.clone())),
        (ChangeType::Transaction, _) => Err(Rejection::Unsupported(field.clone())),
    }
}

fn check_revision(
    precondition: Precondition,
    address: &Address,
    state: &ModelState,
) -> Result<(), Rejection> {
    let actual = state.revision_of(address);
    if precondition.is_satisfied_by(actual) {
        Ok(())
    } else {
        match precondition {
            Precondition::SafeRevisionBound(expected) => Err(Rejection::RevisionMismatch {
                address: address.clone(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

/// The events that removing `changed` produces: implied removes of every
/// descendant, deepest first and object by object, ending with the explicit
/// remove of `changed` itself.
///
/// Old revisions are taken from `state` before any of the removals.
pub fn expand_remove(
    state: &ModelState,
    changed: &Address,
    actor: &ActorId,
    revision: Revision,
) -> Vec<AtomicEvent> {
    let mut events = Vec::new();
    let remove = |target: &Address, address: &Address, implied: bool| {
        atomic_event(
            state,
            actor,
            ChangeType::Remove,
            target,
            address,
            None,
            revision,
            implied,
        )
    };
    let remove_object = |object: &Address, implied: bool, events: &mut Vec<AtomicEvent>| {
        if let Some(fields) = state.object(object).map(|o| o.fields.keys()) {
            for id in fields {
                if let Ok(field) = object.with_field(id.as_str()) {
                    events.push(remove(object, &field, true));
                }
            }
        }
        if let Some(model) = object.parent() {
            events.push(remove(&model, object, implied));
        }
    };

    match changed.kind() {
        AddressKind::Repository => {}
        AddressKind::Field => {
            if let Some(object) = changed.parent() {
                events.push(remove(&object, changed, false));
            }
        }
        AddressKind::Object => remove_object(changed, false, &mut events),
        AddressKind::Model => {
            for id in state.objects().keys() {
                if let Ok(object) = changed.with_object(id.as_str()) {
                    remove_object(&object, true, &mut events);
                }
            }
            if let Some(repository) = changed.parent() {
                events.push(remove(&repository, changed, false));
            }
        }
    }
    events
}

#[allow(clippy::too_many_arguments)]
fn atomic_event(
    state: &ModelState,
    actor: &ActorId,
    change_type: ChangeType,
    target: &Address,
    changed: &Address,
    value: Option<Value>,
    revision: Revision,
    implied: bool,
) -> AtomicEvent {
    let old_object_revision = changed
        .object_address()
        .and_then(|object| state.revision_of(&object));
    let old_field_revision = match changed.kind() {
        AddressKind::Field => state.revision_of(changed),
        _ => None,
    };
    AtomicEvent {
        actor: actor.clone(),
        change_type,
        target: target.clone(),
        changed: changed.clone(),
        value,
        old_model_revision: state.revision_of(state.address()),
        old_object_revision,
        old_field_revision,
        revision,
        implied,
        in_transaction: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TransactionCommand;
    use serde_json::json;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn actor() -> ActorId {
        ActorId::new("tester")
    }

    /// Run commands one after another, committing each applied event.
    fn build(commands: Vec<Command>) -> ModelState {
        let mut state = ModelState::new(addr("/r/m"));
        for (i, command) in commands.iter().enumerate() {
            match execute(command, &state, &actor(), i as u64 + 1) {
                Execution::Applied(event) => state.apply(&event),
                other => panic!("setup command {} did not apply: {:?}", i, other),
            }
        }
        state
    }

    fn add(address: &str) -> Command {
        AtomicCommand::add_entity(addr(address), Precondition::SafeStateBound)
            .unwrap()
            .into()
    }

    fn object_with_two_fields() -> ModelState {
        build(vec![
            add("/r/m"),
            add("/r/m/o"),
            add("/r/m/o/a"),
            add("/r/m/o/b"),
        ])
    }

    #[test]
    fn test_forced_add_twice_is_no_change() {
        let state = build(vec![add("/r/m")]);
        let cmd: Command = AtomicCommand::add_entity(addr("/r/m/o"), Precondition::Forced)
            .unwrap()
            .into();

        let first = execute(&cmd, &state, &actor(), 2);
        let Execution::Applied(event) = first else {
            panic!("expected first add to apply");
        };
        let mut state = state;
        state.apply(&event);

        assert_eq!(execute(&cmd, &state, &actor(), 3), Execution::NoChange);
    }

    #[test]
    fn test_safe_state_bound() {
        let state = build(vec![add("/r/m"), add("/r/m/o")]);
        assert_eq!(
            execute(&add("/r/m/o"), &state, &actor(), 3),
            Execution::Rejected(Rejection::AlreadyExists(addr("/r/m/o")))
        );

        let remove: Command = AtomicCommand::remove_entity(addr("/r/m/x"), Precondition::SafeStateBound)
            .unwrap()
            .into();
        assert_eq!(
            execute(&remove, &state, &actor(), 3),
            Execution::Rejected(Rejection::Missing(addr("/r/m/x")))
        );

        let forced_remove: Command = AtomicCommand::remove_entity(addr("/r/m/x"), Precondition::Forced)
            .unwrap()
            .into();
        assert_eq!(execute(&forced_remove, &state, &actor(), 3), Execution::NoChange);
    }

    #[test]
    fn test_missing_target_rejects_even_when_forced() {
        let state = build(vec![add("/r/m")]);
        let cmd: Command = AtomicCommand::add_entity(addr("/r/m/o/f"), Precondition::Forced)
            .unwrap()
            .into();
        assert_eq!(
            execute(&cmd, &state, &actor(), 2),
            Execution::Rejected(Rejection::TargetMissing(addr("/r/m/o")))
        );
    }

    #[test]
    fn test_revision_bound() {
        let state = build(vec![add("/r/m"), add("/r/m/o"), add("/r/m/o/f")]);
        let field = addr("/r/m/o/f");
        assert_eq!(state.revision_of(&field), Some(3));

        let stale: Command =
            AtomicCommand::add_value(field.clone(), json!(1), Precondition::SafeRevisionBound(2))
                .unwrap()
                .into();
        assert!(matches!(
            execute(&stale, &state, &actor(), 4),
            Execution::Rejected(Rejection::RevisionMismatch { expected: 2, actual: Some(3), .. })
        ));

        let fresh: Command =
            AtomicCommand::add_value(field, json!(1), Precondition::SafeRevisionBound(3))
                .unwrap()
                .into();
        let Execution::Applied(Event::Atomic(event)) = execute(&fresh, &state, &actor(), 4) else {
            panic!("expected an atomic event");
        };
        assert_eq!(event.old_field_revision, Some(3));
        assert_eq!(event.old_object_revision, Some(3));
        assert_eq!(event.old_model_revision, Some(3));
        assert_eq!(event.revision, 4);
    }

    #[test]
    fn test_value_transitions() {
        let state = build(vec![add("/r/m"), add("/r/m/o"), add("/r/m/o/f")]);
        let field = addr("/r/m/o/f");

        let change_empty: Command =
            AtomicCommand::change_value(field.clone(), json!("x"), Precondition::SafeStateBound)
                .unwrap()
                .into();
        assert_eq!(
            execute(&change_empty, &state, &actor(), 4),
            Execution::Rejected(Rejection::Missing(field.clone()))
        );

        let forced_change: Command =
            AtomicCommand::change_value(field.clone(), json!("x"), Precondition::Forced)
                .unwrap()
                .into();
        let Execution::Applied(event) = execute(&forced_change, &state, &actor(), 4) else {
            panic!("forced change should apply");
        };
        assert_eq!(event.change_type(), ChangeType::Add);

        let mut state = state;
        state.apply(&event);
        let same: Command =
            AtomicCommand::change_value(field.clone(), json!("x"), Precondition::SafeStateBound)
                .unwrap()
                .into();
        assert_eq!(execute(&same, &state, &actor(), 5), Execution::NoChange);

        let forced_add: Command =
            AtomicCommand::add_value(field, json!("y"), Precondition::Forced)
                .unwrap()
                .into();
        let Execution::Applied(event) = execute(&forced_add, &state, &actor(), 5) else {
            panic!("forced add onto a different value should apply");
        };
        assert_eq!(event.change_type(), ChangeType::Change);
    }

    #[test]
    fn test_remove_object_with_two_fields_expands() {
        let state = object_with_two_fields();
        let cmd: Command = AtomicCommand::remove_entity(addr("/r/m/o"), Precondition::SafeStateBound)
            .unwrap()
            .into();

        let Execution::Applied(Event::Transaction(txn)) = execute(&cmd, &state, &actor(), 5) else {
            panic!("expected a transaction event");
        };
        assert_eq!(txn.events.len(), 3);
        assert_eq!(txn.events[0].changed, addr("/r/m/o/a"));
        assert_eq!(txn.events[1].changed, addr("/r/m/o/b"));
        assert_eq!(txn.events[2].changed, addr("/r/m/o"));
        assert!(txn.events[0].implied && txn.events[1].implied);
        assert!(!txn.events[2].implied);
        assert!(txn.events.iter().all(|e| e.in_transaction && e.revision == 5));
        assert!(txn.is_remove_bundle());
    }

    #[test]
    fn test_remove_model_expands_deepest_first() {
        let mut state = object_with_two_fields();
        let Execution::Applied(event) = execute(&add("/r/m/p"), &state, &actor(), 5) else {
            panic!("add should apply");
        };
        state.apply(&event);

        let events = expand_remove(&state, &addr("/r/m"), &actor(), 6);
        let changed: Vec<String> = events.iter().map(|e| e.changed.to_string()).collect();
        assert_eq!(
            changed,
            vec!["/r/m/o/a", "/r/m/o/b", "/r/m/o", "/r/m/p", "/r/m"]
        );
        assert_eq!(events.iter().filter(|e| !e.implied).count(), 1);
        assert_eq!(events.last().map(|e| e.target.to_string()), Some("/r".to_string()));
    }

    #[test]
    fn test_remove_leaf_object_is_atomic() {
        let state = build(vec![add("/r/m"), add("/r/m/o")]);
        let cmd: Command = AtomicCommand::remove_entity(addr("/r/m/o"), Precondition::Forced)
            .unwrap()
            .into();
        assert!(matches!(
            execute(&cmd, &state, &actor(), 3),
            Execution::Applied(Event::Atomic(_))
        ));
    }

    #[test]
    fn test_transaction_is_all_or_nothing() {
        let state = build(vec![add("/r/m")]);
        let good = AtomicCommand::add_entity(addr("/r/m/o"), Precondition::SafeStateBound).unwrap();
        let field = AtomicCommand::add_entity(addr("/r/m/o/f"), Precondition::SafeStateBound).unwrap();
        let bad = AtomicCommand::remove_entity(addr("/r/m/x"), Precondition::SafeStateBound).unwrap();

        let ok: Command =
            TransactionCommand::new(addr("/r/m"), vec![good.clone(), field.clone()])
                .unwrap()
                .into();
        let Execution::Applied(Event::Transaction(txn)) = execute(&ok, &state, &actor(), 2) else {
            panic!("transaction should apply");
        };
        assert_eq!(txn.events.len(), 2);
        assert_eq!(txn.events[1].old_object_revision, Some(2));

        let failing: Command = TransactionCommand::new(addr("/r/m"), vec![good, field, bad])
            .unwrap()
            .into();
        assert_eq!(
            execute(&failing, &state, &actor(), 2),
            Execution::Rejected(Rejection::Missing(addr("/r/m/x")))
        );
    }

    #[test]
    fn test_command_for_other_model_is_rejected() {
        let state = build(vec![add("/r/m")]);
        let cmd = add("/r/n/o");
        assert_eq!(
            execute(&cmd, &state, &actor(), 2),
            Execution::Rejected(Rejection::WrongModel(addr("/r/m")))
        );
    }
}
