//! The revision-granting protocol.
//!
//! A writer serializes against every other writer of the same model using
//! nothing but the backing store's create-if-absent and compare-and-swap:
//!
//! 1. compute the lock set of its command,
//! 2. grab the first free revision slot above the committed prefix, noting
//!    every uncommitted slot below it whose locks conflict,
//! 3. wait for those predecessors, timing out or rolling forward stalled ones,
//! 4. evaluate the command against the state derived from the executed events
//!    below its slot, and commit the outcome.
//!
//! Every write to a slot is a CAS on the version the writer last saw. Losing a
//! CAS means another process took the slot over; the writer then re-reads the
//! slot and reports whatever outcome it ends up with.

use crate::backoff::Backoff;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::locks::lock_set;
use arbor_core::{execute, ActorId, Address, Command, Event, Execution, ModelState, Revision};
use arbor_store::{
    BackingStore, ChangeLog, ChangePayload, ChangeRecord, ChangeStatus, Clock, CreateOutcome,
    LockSet, StoreChangeLog, StoreError, SystemClock, Versioned,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// What became of a submitted command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Preconditions did not hold, or the slot timed out.
    Failed,
    /// The command held but changed nothing.
    NoChange,
    /// The command's event was committed at this revision.
    Executed(Revision),
}

impl SubmitOutcome {
    /// The outcome a committed status stands for, `None` while in flight.
    fn of(revision: Revision, status: ChangeStatus) -> Option<Self> {
        match status {
            ChangeStatus::Executed => Some(SubmitOutcome::Executed(revision)),
            ChangeStatus::SucceededNoChange => Some(SubmitOutcome::NoChange),
            ChangeStatus::FailedPreconditions | ChangeStatus::FailedTimeout => {
                Some(SubmitOutcome::Failed)
            }
            ChangeStatus::Creating | ChangeStatus::Executing => None,
        }
    }

    pub fn revision(&self) -> Option<Revision> {
        match self {
            SubmitOutcome::Executed(revision) => Some(*revision),
            _ => None,
        }
    }
}

/// Result of a write that may lose its CAS.
enum Step<T> {
    Done(T),
    Lost,
}

impl<T> Step<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Done(value) => Step::Done(f(value)),
            Step::Lost => Step::Lost,
        }
    }
}

/// A slot held by this writer and the version it last wrote.
struct Owned {
    revision: Revision,
    record: Versioned<ChangeRecord>,
}

/// Serializes the writers of one model.
///
/// Any number of controllers, in any number of processes, may share a store;
/// they coordinate only through it.
pub struct ConcurrencyController<S> {
    log: StoreChangeLog<S>,
    config: ControllerConfig,
}

impl<S: BackingStore> ConcurrencyController<S> {
    pub fn new(store: S, model: Address, config: ControllerConfig) -> Self {
        Self::with_clock(store, model, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: S,
        model: Address,
        config: ControllerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            log: StoreChangeLog::new(store, model, clock),
            config,
        }
    }

    pub fn model(&self) -> &Address {
        self.log.model()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The store-backed change log this controller writes.
    pub fn log(&self) -> &StoreChangeLog<S> {
        &self.log
    }

    /// Highest revision up to which every slot is committed.
    ///
    /// A stalled slot sitting right above the committed prefix is recovered
    /// first, even if no writer conflicts with it, so that a crashed writer
    /// cannot hold readers back.
    pub async fn current_revision(&self) -> Result<Revision> {
        loop {
            let current = self.log.current_revision().await?;
            let next = current + 1;
            let Some(record) = self.log.slot(next).await? else {
                return Ok(current);
            };
            if record.value.is_committed() {
                continue;
            }
            if !record
                .value
                .is_timed_out(self.now(), self.config.activity_timeout_ms)
            {
                return Ok(current);
            }
            // Everything below `next` is committed, so it can be finished here.
            if let Step::Lost = self.recover(next, record).await? {
                debug!(model = %self.model(), revision = next, "Stalled slot recovered elsewhere");
            }
        }
    }

    pub async fn events_since(&self, revision: Revision) -> Result<Vec<Event>> {
        self.current_revision().await?;
        Ok(self.log.events_since(revision).await?)
    }

    pub async fn truncate_to_revision(&self, revision: Revision) -> Result<bool> {
        self.current_revision().await?;
        Ok(self.log.truncate_to_revision(revision).await?)
    }

    /// Order `command` in the model's log and execute it.
    pub async fn submit(&self, actor: &ActorId, command: &Command) -> Result<SubmitOutcome> {
        if command.model_address().as_ref() != Some(self.model()) {
            return Err(ControllerError::WrongModel(self.model().clone()));
        }

        let locks = lock_set(command);
        let (mut owned, predecessors) = self.grab(actor, &locks).await?;
        debug!(
            model = %self.model(),
            revision = owned.revision,
            %actor,
            locks = locks.len(),
            predecessors = predecessors.len(),
            "Grabbed revision slot"
        );

        for predecessor in predecessors {
            if let Step::Lost = self.wait_for(predecessor, &mut owned).await? {
                return self.settle(owned.revision).await;
            }
        }

        match self.run_command(owned.revision, owned.record, command).await? {
            Step::Done(outcome) => Ok(outcome),
            Step::Lost => self.settle(owned.revision).await,
        }
    }

    fn now(&self) -> u64 {
        self.log.clock().now_millis()
    }

    fn blocks(record: &ChangeRecord, locks: &LockSet) -> bool {
        !record.is_committed() && record.locks.conflicts_with(locks)
    }

    fn corrupt(&self, revision: Revision, reason: &str) -> ControllerError {
        ControllerError::CorruptRecord {
            key: self.log.key(revision),
            reason: reason.to_string(),
        }
    }

    /// Claim the first free slot above the committed prefix.
    async fn grab(&self, actor: &ActorId, locks: &LockSet) -> Result<(Owned, Vec<Revision>)> {
        let mut revision = self.current_revision().await? + 1;
        let mut predecessors = Vec::new();
        let mut skipped = Vec::new();

        for _ in 0..self.config.max_grab_attempts {
            let record = ChangeRecord::creating(actor.clone(), locks.clone(), self.now());
            let key = self.log.key(revision);
            match self.log.store().create_if_absent(&key, record.clone()).await {
                Ok(CreateOutcome::Created { version }) => {
                    for gap in skipped {
                        if self.close_gap(gap, actor, locks).await? {
                            predecessors.push(gap);
                        }
                    }
                    predecessors.sort_unstable();
                    let owned = Owned {
                        revision,
                        record: Versioned {
                            version,
                            value: record,
                        },
                    };
                    return Ok((owned, predecessors));
                }
                Ok(CreateOutcome::Occupied(existing)) => {
                    if Self::blocks(&existing.value, locks) {
                        predecessors.push(revision);
                    } else {
                        self.log.remember(revision, &existing);
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(model = %self.model(), revision, "Contention while grabbing, moving on");
                    skipped.push(revision);
                }
                Err(err) => return Err(err.into()),
            }
            revision += 1;
        }

        Err(ControllerError::GrabExhausted {
            attempts: self.config.max_grab_attempts,
        })
    }

    /// Fill a slot skipped because of contention with an empty committed
    /// record, so that no later writer can grab it beneath us. Returns true if
    /// the slot turned out to hold a conflicting change to wait for.
    async fn close_gap(&self, revision: Revision, actor: &ActorId, locks: &LockSet) -> Result<bool> {
        let key = self.log.key(revision);
        let mut backoff = Backoff::from_config(&self.config);
        for _ in 0..self.config.max_grab_attempts {
            let now = self.now();
            let filler = ChangeRecord::creating(actor.clone(), LockSet::default(), now)
                .with_status(ChangeStatus::FailedTimeout, now);
            match self.log.store().create_if_absent(&key, filler.clone()).await {
                Ok(CreateOutcome::Created { version }) => {
                    self.log.remember(revision, &Versioned { version, value: filler });
                    debug!(model = %self.model(), revision, "Closed skipped slot");
                    return Ok(false);
                }
                Ok(CreateOutcome::Occupied(existing)) => {
                    self.log.remember(revision, &existing);
                    return Ok(Self::blocks(&existing.value, locks));
                }
                Err(err) if err.is_transient() => backoff.wait().await,
                Err(err) => return Err(err.into()),
            }
        }
        Err(ControllerError::GrabExhausted {
            attempts: self.config.max_grab_attempts,
        })
    }

    /// Poll `predecessor` until it is committed, recovering it once stalled.
    /// Returns `Lost` if our own slot was taken over meanwhile.
    async fn wait_for(&self, predecessor: Revision, owned: &mut Owned) -> Result<Step<()>> {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            let Some(record) = self.log.slot(predecessor).await? else {
                return Ok(Step::Done(()));
            };
            if record.value.is_committed() {
                return Ok(Step::Done(()));
            }
            if record
                .value
                .is_timed_out(self.now(), self.config.activity_timeout_ms)
            {
                if let Step::Done(_) = self.recover(predecessor, record).await? {
                    return Ok(Step::Done(()));
                }
            }
            if let Step::Lost = self.heartbeat(owned).await? {
                return Ok(Step::Lost);
            }
            backoff.wait().await;
        }
    }

    /// Refresh our own slot's activity timestamp when it is getting old.
    async fn heartbeat(&self, owned: &mut Owned) -> Result<Step<()>> {
        let now = self.now();
        let age = now.saturating_sub(owned.record.value.last_activity_ms);
        if age < self.config.heartbeat_interval_ms() {
            return Ok(Step::Done(()));
        }
        let touched = owned.record.value.touched(now);
        Ok(self
            .write(owned.revision, owned.record.version, touched)
            .await?
            .map(|record| owned.record = record))
    }

    /// Finish a stalled slot on its owner's behalf.
    async fn recover(
        &self,
        revision: Revision,
        observed: Versioned<ChangeRecord>,
    ) -> Result<Step<SubmitOutcome>> {
        if let Some(outcome) = SubmitOutcome::of(revision, observed.value.status) {
            return Ok(Step::Done(outcome));
        }
        let now = self.now();
        match (&observed.value.status, &observed.value.payload) {
            (ChangeStatus::Executing, Some(_)) => {
                warn!(
                    model = %self.model(),
                    revision,
                    owner = %observed.value.actor,
                    "Rolling forward stalled change"
                );
                let claim = observed.value.touched(now);
                match self.write(revision, observed.version, claim).await? {
                    Step::Done(claimed) => self.roll_forward(revision, claimed).await,
                    Step::Lost => Ok(Step::Lost),
                }
            }
            (ChangeStatus::Executing, None) => Err(self.corrupt(revision, "executing without payload")),
            _ => {
                warn!(
                    model = %self.model(),
                    revision,
                    owner = %observed.value.actor,
                    "Stalled slot timed out"
                );
                let failed = observed.value.with_status(ChangeStatus::FailedTimeout, now);
                Ok(self
                    .write(revision, observed.version, failed)
                    .await?
                    .map(|_| SubmitOutcome::Failed))
            }
        }
    }

    /// Resume an executing slot from its persisted payload.
    async fn roll_forward(
        &self,
        revision: Revision,
        claimed: Versioned<ChangeRecord>,
    ) -> Result<Step<SubmitOutcome>> {
        match claimed.value.payload.clone() {
            Some(ChangePayload::Command(command)) => {
                self.run_command(revision, claimed, &command).await
            }
            Some(ChangePayload::Events(_)) => self.commit(revision, claimed).await,
            None => Err(self.corrupt(revision, "executing without payload")),
        }
    }

    /// Check preconditions and commit the outcome of `command` at `revision`.
    async fn run_command(
        &self,
        revision: Revision,
        record: Versioned<ChangeRecord>,
        command: &Command,
    ) -> Result<Step<SubmitOutcome>> {
        let checking = record
            .value
            .executing(ChangePayload::Command(command.clone()), self.now());
        let record = match self.write(revision, record.version, checking).await? {
            Step::Done(record) => record,
            Step::Lost => return Ok(Step::Lost),
        };

        let below = self.log.executed_events_below(revision).await?;
        let state = ModelState::replay(self.model().clone(), &below);

        match execute(command, &state, &record.value.actor, revision) {
            Execution::Rejected(reason) => {
                debug!(model = %self.model(), revision, %reason, "Preconditions failed");
                self.finish(revision, record, ChangeStatus::FailedPreconditions)
                    .await
            }
            Execution::NoChange => {
                self.finish(revision, record, ChangeStatus::SucceededNoChange)
                    .await
            }
            Execution::Applied(event) => {
                let applied = record
                    .value
                    .executing(ChangePayload::Events(vec![event]), self.now());
                match self.write(revision, record.version, applied).await? {
                    Step::Done(record) => self.commit(revision, record).await,
                    Step::Lost => Ok(Step::Lost),
                }
            }
        }
    }

    async fn commit(
        &self,
        revision: Revision,
        record: Versioned<ChangeRecord>,
    ) -> Result<Step<SubmitOutcome>> {
        let outcome = self.finish(revision, record, ChangeStatus::Executed).await?;
        if let Step::Done(_) = outcome {
            debug!(model = %self.model(), revision, "Committed change");
        }
        Ok(outcome)
    }

    async fn finish(
        &self,
        revision: Revision,
        record: Versioned<ChangeRecord>,
        status: ChangeStatus,
    ) -> Result<Step<SubmitOutcome>> {
        let done = record.value.with_status(status, self.now());
        Ok(self.write(revision, record.version, done).await?.map(|record| {
            SubmitOutcome::of(revision, record.value.status).unwrap_or(SubmitOutcome::Failed)
        }))
    }

    /// CAS `record` into the slot, expecting it still at `expected`.
    async fn write(
        &self,
        revision: Revision,
        expected: u64,
        record: ChangeRecord,
    ) -> Result<Step<Versioned<ChangeRecord>>> {
        let key = self.log.key(revision);
        match self
            .log
            .store()
            .compare_and_swap(&key, expected, record.clone())
            .await
        {
            Ok(version) => {
                let written = Versioned {
                    version,
                    value: record,
                };
                self.log.remember(revision, &written);
                Ok(Step::Done(written))
            }
            Err(StoreError::VersionMismatch { .. }) | Err(StoreError::Contention(_)) => {
                debug!(model = %self.model(), revision, "Lost slot to another writer");
                Ok(Step::Lost)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Outcome of our own slot after someone else took it over.
    async fn settle(&self, revision: Revision) -> Result<SubmitOutcome> {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            let Some(record) = self.log.slot(revision).await? else {
                // Truncated away before it committed.
                return Ok(SubmitOutcome::Failed);
            };
            if let Some(outcome) = SubmitOutcome::of(revision, record.value.status) {
                return Ok(outcome);
            }
            if record
                .value
                .is_timed_out(self.now(), self.config.activity_timeout_ms)
            {
                if let Step::Done(outcome) = self.recover(revision, record).await? {
                    return Ok(outcome);
                }
            }
            backoff.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_of_status() {
        assert_eq!(
            SubmitOutcome::of(4, ChangeStatus::Executed),
            Some(SubmitOutcome::Executed(4))
        );
        assert_eq!(
            SubmitOutcome::of(4, ChangeStatus::SucceededNoChange),
            Some(SubmitOutcome::NoChange)
        );
        assert_eq!(
            SubmitOutcome::of(4, ChangeStatus::FailedTimeout),
            Some(SubmitOutcome::Failed)
        );
        assert_eq!(SubmitOutcome::of(4, ChangeStatus::Executing), None);
        assert_eq!(SubmitOutcome::Executed(7).revision(), Some(7));
        assert_eq!(SubmitOutcome::NoChange.revision(), None);
    }
}
