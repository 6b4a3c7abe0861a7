//! End-to-end tests of the revision-granting protocol over a shared
//! in-memory store.

use arbor_concurrency::{
    ConcurrencyController, ControllerConfig, ControllerConfigBuilder, ControllerError,
    SubmitOutcome,
};
use arbor_core::{
    execute, ActorId, Address, AtomicCommand, ChangeType, Command, Event, Execution, ModelState,
    Precondition,
};
use arbor_store::{
    BackingStore, ChangeLog, ChangePayload, ChangeRecord, ChangeStatus, Clock, CreateOutcome,
    LockSet, ManualClock, MemoryBackingStore, SlotKey, SystemClock,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type Controller = ConcurrencyController<Arc<MemoryBackingStore>>;

const NOW: u64 = 1_000_000;

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn model() -> Address {
    addr("/r/m")
}

fn add(address: &str, precondition: Precondition) -> Command {
    AtomicCommand::add_entity(addr(address), precondition)
        .unwrap()
        .into()
}

fn fast_config() -> ControllerConfig {
    ControllerConfigBuilder::new()
        .activity_timeout(10_000)
        .initial_backoff(1)
        .max_backoff(8)
        .build()
}

fn new_controller(store: &Arc<MemoryBackingStore>, clock: &Arc<ManualClock>) -> Controller {
    ConcurrencyController::with_clock(store.clone(), model(), fast_config(), clock.clone())
}

/// A store holding the executed creation of `/r/m` and `/r/m/o` at
/// revisions 1 and 2.
async fn seeded() -> (Arc<MemoryBackingStore>, Arc<ManualClock>, Controller) {
    let store = MemoryBackingStore::new();
    let clock = Arc::new(ManualClock::new(NOW));
    let controller = new_controller(&store, &clock);
    let actor = ActorId::new("seed");
    for address in ["/r/m", "/r/m/o"] {
        let outcome = controller
            .submit(&actor, &add(address, Precondition::SafeStateBound))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Executed(_)));
    }
    (store, clock, controller)
}

fn key(revision: u64) -> SlotKey {
    SlotKey::new(&model(), revision)
}

fn stalled(owner: &str, locks: &[Address], last_activity_ms: u64) -> ChangeRecord {
    ChangeRecord::creating(ActorId::new(owner), LockSet::covering(locks), last_activity_ms)
}

async fn state_of(controller: &Controller) -> ModelState {
    let events: Vec<Event> = controller.events_since(0).await.unwrap();
    ModelState::replay(model(), &events)
}

#[tokio::test]
async fn test_outcomes_and_revisions() {
    let (_store, _clock, controller) = seeded().await;
    let actor = ActorId::new("a");

    let dup = controller
        .submit(&actor, &add("/r/m/o", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(dup, SubmitOutcome::Failed);

    let forced = controller
        .submit(&actor, &add("/r/m/o", Precondition::Forced))
        .await
        .unwrap();
    assert_eq!(forced, SubmitOutcome::NoChange);

    let field = controller
        .submit(&actor, &add("/r/m/o/f", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(field, SubmitOutcome::Executed(5));

    assert_eq!(controller.current_revision().await.unwrap(), 5);
    let events = controller.events_since(2).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].revision(), 5);
    assert_eq!(events[0].actor(), &actor);
}

#[tokio::test]
async fn test_command_for_other_model_is_refused() {
    let (_store, _clock, controller) = seeded().await;
    let err = controller
        .submit(&ActorId::new("a"), &add("/r/other/o", Precondition::Forced))
        .await
        .unwrap_err();
    assert_eq!(err, ControllerError::WrongModel(model()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_winner_across_controllers() {
    let (store, clock, _controller) = seeded().await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let controller = new_controller(&store, &clock);
            tokio::spawn(async move {
                controller
                    .submit(
                        &ActorId::new(format!("writer-{}", i)),
                        &add("/r/m/race", Precondition::SafeStateBound),
                    )
                    .await
            })
        })
        .collect();

    let outcomes: Vec<SubmitOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::Executed(_)))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == SubmitOutcome::Failed)
            .count(),
        7
    );

    let reader = new_controller(&store, &clock);
    assert_eq!(reader.current_revision().await.unwrap(), 10);
    let adds = reader
        .events_since(2)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.change_type() == ChangeType::Add)
        .count();
    assert_eq!(adds, 1);
}

#[tokio::test]
async fn test_forced_commands_are_idempotent_under_interleaving() {
    let (_store, _clock, controller) = seeded().await;
    let field = addr("/r/m/o/f");
    controller
        .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
        .await
        .unwrap();

    let set: Command = AtomicCommand::change_value(field.clone(), json!("v"), Precondition::Forced)
        .unwrap()
        .into();
    let outcomes = join_all((0..4).map(|i| {
        let actor = ActorId::new(format!("w{}", i));
        let controller = &controller;
        let set = set.clone();
        async move { controller.submit(&actor, &set).await.unwrap() }
    }))
    .await;

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, SubmitOutcome::Executed(_)))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == SubmitOutcome::NoChange)
            .count(),
        3
    );
    assert_eq!(state_of(&controller).await.value_of(&field), Some(&json!("v")));
}

#[tokio::test]
async fn test_non_conflicting_pending_slot_does_not_block() {
    let (store, _clock, controller) = seeded().await;
    store.put_unchecked(key(3), stalled("other", &[addr("/r/m/x")], NOW));

    let outcome = controller
        .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Executed(4));

    // Slot 3 is still in flight, so the committed prefix ends at 2.
    assert_eq!(controller.current_revision().await.unwrap(), 2);
    let pending = controller.log().slot(3).await.unwrap().unwrap();
    assert_eq!(pending.value.status, ChangeStatus::Creating);
}

#[tokio::test]
async fn test_waits_for_conflicting_predecessor() {
    let (store, clock, controller) = seeded().await;
    let planted = stalled("slow", &[addr("/r/m/o")], NOW);
    store.put_unchecked(key(3), planted.clone());

    let waiter = {
        let controller = new_controller(&store, &clock);
        tokio::spawn(async move {
            controller
                .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    store.put_unchecked(
        key(3),
        planted.with_status(ChangeStatus::FailedPreconditions, NOW),
    );
    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome, SubmitOutcome::Executed(4));
    assert_eq!(controller.current_revision().await.unwrap(), 4);
}

#[tokio::test]
async fn test_stalled_creating_slot_times_out() {
    let (store, clock, controller) = seeded().await;
    store.put_unchecked(key(3), stalled("crashed", &[addr("/r/m/o")], NOW));
    clock.advance(60_000);

    let outcome = controller
        .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Executed(4));

    let timed_out = controller.log().slot(3).await.unwrap().unwrap();
    assert_eq!(timed_out.value.status, ChangeStatus::FailedTimeout);
    assert!(timed_out.value.events().is_empty());
}

#[tokio::test]
async fn test_stalled_command_is_rolled_forward() {
    let (store, clock, controller) = seeded().await;
    let command = add("/r/m/o/title", Precondition::SafeStateBound);
    let record = stalled("crashed", &[addr("/r/m/o/title")], NOW)
        .executing(ChangePayload::Command(command), NOW);
    store.put_unchecked(key(3), record);
    clock.advance(60_000);

    let value: Command =
        AtomicCommand::add_value(addr("/r/m/o/title"), json!("hi"), Precondition::SafeStateBound)
            .unwrap()
            .into();
    let outcome = controller.submit(&ActorId::new("a"), &value).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Executed(4));

    let rolled = controller.log().event_at(3).await.unwrap().unwrap();
    assert_eq!(rolled.actor(), &ActorId::new("crashed"));
    assert_eq!(rolled.revision(), 3);
    let state = state_of(&controller).await;
    assert_eq!(state.value_of(&addr("/r/m/o/title")), Some(&json!("hi")));
}

#[tokio::test]
async fn test_stalled_events_are_committed_as_persisted() {
    let (store, clock, controller) = seeded().await;
    let before = state_of(&controller).await;
    let Execution::Applied(event) = execute(
        &add("/r/m/o/f", Precondition::SafeStateBound),
        &before,
        &ActorId::new("crashed"),
        3,
    ) else {
        panic!("add should apply");
    };
    let record = stalled("crashed", &[addr("/r/m/o/f")], NOW)
        .executing(ChangePayload::Events(vec![event.clone()]), NOW);
    store.put_unchecked(key(3), record);
    clock.advance(60_000);

    let outcome = controller
        .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Failed);
    assert_eq!(controller.log().event_at(3).await.unwrap(), Some(event));
}

#[tokio::test]
async fn test_own_slot_timed_out_by_another_writer_reports_failure() {
    let (store, clock, controller) = seeded().await;
    store.put_unchecked(key(3), stalled("slow", &[addr("/r/m/o")], NOW));

    let waiter = {
        let controller = new_controller(&store, &clock);
        tokio::spawn(async move {
            controller
                .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Another process decides slot 4 has stalled and fails it.
    let own = store.records_of(&model())[3].1.clone();
    assert_eq!(own.status, ChangeStatus::Creating);
    store.put_unchecked(key(4), own.with_status(ChangeStatus::FailedTimeout, NOW));
    clock.advance(60_000);

    assert_eq!(waiter.await.unwrap().unwrap(), SubmitOutcome::Failed);
}

#[tokio::test]
async fn test_contention_moves_on_and_closes_gaps() {
    let (store, _clock, controller) = seeded().await;
    store.inject_contention(2);

    let outcome = controller
        .submit(&ActorId::new("a"), &add("/r/m/o/f", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Executed(5));

    for gap in [3, 4] {
        let filler = controller.log().slot(gap).await.unwrap().unwrap();
        assert!(filler.value.is_committed());
        assert!(filler.value.events().is_empty());
    }
    assert_eq!(controller.current_revision().await.unwrap(), 5);
}

#[tokio::test]
async fn test_unavailable_store_aborts() {
    let (store, _clock, controller) = seeded().await;
    store.set_available(false);

    let err = controller
        .submit(&ActorId::new("a"), &add("/r/m/p", Precondition::SafeStateBound))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::StoreUnavailable(_)));

    store.set_available(true);
    assert_eq!(controller.current_revision().await.unwrap(), 2);
}

#[tokio::test]
async fn test_grab_attempts_are_bounded() {
    let store = MemoryBackingStore::new();
    let clock = Arc::new(ManualClock::new(NOW));
    let config = ControllerConfigBuilder::new().max_grab_attempts(3).build();
    let controller =
        ConcurrencyController::with_clock(store.clone(), model(), config, clock.clone());
    for revision in 1..=3 {
        store.put_unchecked(key(revision), stalled("other", &[addr("/r/m/x")], NOW));
    }

    let err = controller
        .submit(&ActorId::new("a"), &add("/r/m", Precondition::Forced))
        .await
        .unwrap_err();
    assert_eq!(err, ControllerError::GrabExhausted { attempts: 3 });
}

#[tokio::test]
async fn test_truncate_rolls_back_committed_changes() {
    let (_store, _clock, controller) = seeded().await;
    let before = state_of(&controller).await;
    controller
        .submit(&ActorId::new("a"), &add("/r/m/p", Precondition::SafeStateBound))
        .await
        .unwrap();

    assert!(controller.truncate_to_revision(2).await.unwrap());
    assert_eq!(state_of(&controller).await, before);
    assert!(!controller.truncate_to_revision(9).await.unwrap());

    let again = controller
        .submit(&ActorId::new("a"), &add("/r/m/p", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(again, SubmitOutcome::Executed(3));
}

#[tokio::test]
async fn test_stalled_slot_outside_every_lock_is_reclaimed_by_readers() {
    let (store, clock, controller) = seeded().await;
    store.put_unchecked(key(3), stalled("crashed", &[addr("/r/m/x")], NOW));

    for (i, address) in ["/r/m/a", "/r/m/b", "/r/m/c"].iter().enumerate() {
        let outcome = controller
            .submit(&ActorId::new("a"), &add(address, Precondition::SafeStateBound))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Executed(i as u64 + 4));
    }
    assert_eq!(controller.current_revision().await.unwrap(), 2);

    clock.advance(60 * 60 * 1000);
    let reader = new_controller(&store, &clock);
    assert_eq!(reader.current_revision().await.unwrap(), 6);
    assert_eq!(reader.events_since(0).await.unwrap().len(), 5);

    let reclaimed = reader.log().slot(3).await.unwrap().unwrap();
    assert_eq!(reclaimed.value.status, ChangeStatus::FailedTimeout);
}

#[tokio::test]
async fn test_truncate_is_seen_by_other_controllers() {
    let (store, clock, first) = seeded().await;
    let second = new_controller(&store, &clock);
    assert_eq!(second.current_revision().await.unwrap(), 2);
    assert_eq!(second.events_since(0).await.unwrap().len(), 2);

    assert!(first.truncate_to_revision(1).await.unwrap());

    assert_eq!(second.current_revision().await.unwrap(), 1);
    assert_eq!(second.events_since(0).await.unwrap().len(), 1);
    let again = second
        .submit(&ActorId::new("b"), &add("/r/m/o", Precondition::SafeStateBound))
        .await
        .unwrap();
    assert_eq!(again, SubmitOutcome::Executed(2));

    let events = first.events_since(1).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor(), &ActorId::new("b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiting_owner_is_not_timed_out_while_blocked() {
    let store = MemoryBackingStore::new();
    // Short activity timeout next to the default one-second backoff cap.
    let config = ControllerConfigBuilder::new().activity_timeout(200).build();
    let controller = ConcurrencyController::new(store.clone(), model(), config.clone());
    for address in ["/r/m", "/r/m/o"] {
        controller
            .submit(&ActorId::new("seed"), &add(address, Precondition::SafeStateBound))
            .await
            .unwrap();
    }

    // A live writer holds `/r/m/o` at slot 3 for three times the timeout.
    let holder = stalled("slow", &[addr("/r/m/o")], SystemClock.now_millis());
    let CreateOutcome::Created { version } = store.create_if_absent(&key(3), holder).await.unwrap()
    else {
        panic!("slot 3 should be free");
    };
    let keeper = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut version = version;
            for _ in 0..12 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let record = store.get(&key(3)).await.unwrap().unwrap();
                let touched = record.value.touched(SystemClock.now_millis());
                version = store.compare_and_swap(&key(3), version, touched).await.unwrap();
            }
            let record = store.get(&key(3)).await.unwrap().unwrap();
            let done = record
                .value
                .with_status(ChangeStatus::FailedPreconditions, SystemClock.now_millis());
            store.compare_and_swap(&key(3), version, done).await.unwrap();
        })
    };

    let waiter = {
        let controller = ConcurrencyController::new(store.clone(), model(), config.clone());
        tokio::spawn(async move {
            controller
                .submit(&ActorId::new("waiter"), &add("/r/m/o/f", Precondition::SafeStateBound))
                .await
        })
    };

    // A third writer on the same field arrives while the waiter is blocked
    // and would reap its slot if it looked stalled.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let third = ConcurrencyController::new(store.clone(), model(), config);
    let late = third
        .submit(&ActorId::new("late"), &add("/r/m/o/f", Precondition::Forced))
        .await
        .unwrap();

    keeper.await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), SubmitOutcome::Executed(4));
    assert_eq!(late, SubmitOutcome::NoChange);
    let own = third.log().slot(4).await.unwrap().unwrap();
    assert_eq!(own.value.status, ChangeStatus::Executed);
}
