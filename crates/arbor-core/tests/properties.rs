//! Property-based tests for the address order and command semantics.
//!
//! These check the laws the concurrency layer relies on:
//!  - Containment is reflexive, antisymmetric and transitive
//!  - Overlap is symmetric and follows from containment
//!  - Forced commands are idempotent
//!  - Applied transactions commit at a single revision

use arbor_core::{
    execute, ActorId, Address, AtomicCommand, Command, Execution, ModelState, Precondition,
    TransactionCommand,
};
use proptest::prelude::*;

/// Addresses drawn from a small id alphabet so that relations actually occur.
fn address_strategy() -> impl Strategy<Value = Address> {
    (
        prop::sample::select(vec!["r", "s"]),
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..=3),
    )
        .prop_map(|(repo, path)| {
            let mut address = Address::repository(repo).unwrap();
            for (depth, id) in path.iter().enumerate() {
                address = match depth {
                    0 => address.with_model(id).unwrap(),
                    1 => address.with_object(id).unwrap(),
                    _ => address.with_field(id).unwrap(),
                };
            }
            address
        })
}

/// Entity additions inside model `/r/m`, possibly referencing missing parents.
fn entity_strategy() -> impl Strategy<Value = Address> {
    (
        prop::sample::select(vec!["o1", "o2", "o3"]),
        prop::option::of(prop::sample::select(vec!["f1", "f2"])),
    )
        .prop_map(|(object, field)| {
            let object = Address::object("r", "m", object).unwrap();
            match field {
                Some(field) => object.with_field(field).unwrap(),
                None => object,
            }
        })
}

fn seeded_state(entities: &[Address]) -> ModelState {
    let model = Address::model("r", "m").unwrap();
    let actor = ActorId::new("seed");
    let mut state = ModelState::new(model.clone());
    let mut commands: Vec<Command> =
        vec![AtomicCommand::add_entity(model, Precondition::Forced).unwrap().into()];
    commands.extend(
        entities
            .iter()
            .map(|a| AtomicCommand::add_entity(a.clone(), Precondition::Forced).unwrap().into()),
    );
    for command in commands {
        if let Execution::Applied(event) = execute(&command, &state, &actor, state.revision() + 1) {
            state.apply(&event);
        }
    }
    state
}

proptest! {
    #[test]
    fn contains_is_reflexive(a in address_strategy()) {
        prop_assert!(a.contains(&a));
    }

    #[test]
    fn contains_is_antisymmetric(a in address_strategy(), b in address_strategy()) {
        if a.contains(&b) && b.contains(&a) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn contains_is_transitive(
        a in address_strategy(),
        b in address_strategy(),
        c in address_strategy(),
    ) {
        if a.contains(&b) && b.contains(&c) {
            prop_assert!(a.contains(&c));
        }
    }

    #[test]
    fn overlap_is_symmetric(a in address_strategy(), b in address_strategy()) {
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
    }

    #[test]
    fn parent_contains_child(a in address_strategy()) {
        if let Some(parent) = a.parent() {
            prop_assert!(parent.contains(&a));
            prop_assert!(!a.contains(&parent));
        }
    }

    #[test]
    fn display_parse_roundtrip(a in address_strategy()) {
        let parsed: Address = a.to_string().parse().unwrap();
        prop_assert_eq!(parsed, a);
    }

    #[test]
    fn forced_add_is_idempotent(
        seed in prop::collection::vec(entity_strategy(), 0..6),
        target in entity_strategy(),
    ) {
        let mut state = seeded_state(&seed);
        let actor = ActorId::new("p");
        let command: Command = AtomicCommand::add_entity(target, Precondition::Forced).unwrap().into();

        if let Execution::Applied(event) = execute(&command, &state, &actor, state.revision() + 1) {
            state.apply(&event);
        }
        let again = execute(&command, &state, &actor, state.revision() + 1);
        prop_assert!(!matches!(again, Execution::Applied(_)));
    }

    #[test]
    fn applied_transactions_share_one_revision(
        seed in prop::collection::vec(entity_strategy(), 0..6),
        adds in prop::collection::vec(entity_strategy(), 1..5),
    ) {
        let state = seeded_state(&seed);
        let actor = ActorId::new("p");
        let commands: Vec<AtomicCommand> = adds
            .into_iter()
            .map(|a| AtomicCommand::add_entity(a, Precondition::SafeStateBound).unwrap())
            .collect();
        let txn: Command = TransactionCommand::new(Address::model("r", "m").unwrap(), commands)
            .unwrap()
            .into();

        let revision = state.revision() + 1;
        if let Execution::Applied(event) = execute(&txn, &state, &actor, revision) {
            prop_assert!(!event.atomic_events().is_empty());
            for atomic in event.atomic_events() {
                prop_assert_eq!(atomic.revision, revision);
                prop_assert!(atomic.in_transaction);
            }
        }
    }
}
