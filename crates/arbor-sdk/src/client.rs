//! Offline-capable client replica.

use crate::error::{Result, SdkError};
use crate::protocol::SyncRequest;
use crate::transport::{SyncTransport, TransportError};
use arbor_core::{
    execute, ActorId, Address, AddressKind, Command, Event, Execution, ModelState, Rejection,
    Revision,
};
use arbor_store::{ChangeLog, MemoryChangeLog};
use arbor_sync::{reconcile, LocalChange, MappedChange, PendingChanges, SeqNo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Configuration for a client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Actor recorded on every change this client submits.
    pub actor: ActorId,
    /// Queue unconfirmed changes again after a sync instead of only
    /// reporting them.
    pub replay_lost_changes: bool,
    /// Capacity of the client event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            actor: ActorId::generate(),
            replay_lost_changes: false,
            event_capacity: 100,
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.config.actor = ActorId::new(actor);
        self
    }

    pub fn replay_lost_changes(mut self, enabled: bool) -> Self {
        self.config.replay_lost_changes = enabled;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of applying a command to the local replica.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalOutcome {
    /// Applied locally and queued for the server.
    Queued(SeqNo),
    /// Nothing to do; not queued.
    NoChange,
    /// Preconditions fail against the local replica; not queued.
    Rejected(Rejection),
}

/// What a sync found out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    pub revision: Revision,
    /// Sent changes the server confirmed.
    pub confirmed: Vec<MappedChange>,
    /// Server events that were not the client's own.
    pub remote_events: Vec<Event>,
    /// Changes that did not make it. Requeued ones are not listed.
    pub lost: Vec<LocalChange>,
}

/// Events emitted by a client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Applied {
        model: Address,
        seq: SeqNo,
    },
    Synced {
        model: Address,
        revision: Revision,
        confirmed: usize,
        remote: usize,
        lost: usize,
    },
    Offline {
        model: Address,
    },
}

struct Replica {
    /// The model as of `synced_revision`.
    base: ModelState,
    /// Mirror of the server's events, with the server's revisions.
    history: Arc<MemoryChangeLog>,
    synced_revision: Revision,
    pending: PendingChanges,
    /// `base` with the pending changes applied on top.
    local: ModelState,
    /// Serializes syncs of this model only.
    sync_lock: Arc<Mutex<()>>,
}

impl Replica {
    fn new(model: Address) -> Self {
        Self {
            base: ModelState::new(model.clone()),
            history: Arc::new(MemoryChangeLog::new(model.clone())),
            synced_revision: 0,
            pending: PendingChanges::new(),
            local: ModelState::new(model),
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Execute `command` against the local state and apply it if it changes
    /// anything.
    fn try_local(&mut self, command: &Command, actor: &ActorId) -> Execution {
        let revision = self.local.revision() + 1;
        let execution = execute(command, &self.local, actor, revision);
        if let Execution::Applied(event) = &execution {
            self.local.apply(event);
        }
        execution
    }
}

/// A client holding local replicas of any number of models.
///
/// Commands apply to the local replica immediately and are queued; `sync`
/// sends the queue and brings the replica up to the server's revision.
pub struct Client<T> {
    config: ClientConfig,
    transport: T,
    replicas: RwLock<HashMap<Address, Replica>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl<T: SyncTransport> Client<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            transport,
            replicas: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.config.actor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start tracking `model`. The replica is empty until the first sync.
    pub fn open(&self, model: &Address) -> Result<()> {
        if model.kind() != AddressKind::Model {
            return Err(SdkError::NotAModel(model.clone()));
        }
        self.replicas
            .write()
            .entry(model.clone())
            .or_insert_with(|| Replica::new(model.clone()));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Apply `command` to the local replica and queue it for the server.
    pub fn apply(&self, command: impl Into<Command>) -> Result<LocalOutcome> {
        let command = command.into();
        let model = command
            .model_address()
            .ok_or_else(|| SdkError::NoModel(command.target().clone()))?;

        let mut replicas = self.replicas.write();
        let replica = replicas
            .get_mut(&model)
            .ok_or_else(|| SdkError::ModelNotOpen(model.clone()))?;

        let outcome = match replica.try_local(&command, &self.config.actor) {
            Execution::Rejected(rejection) => LocalOutcome::Rejected(rejection),
            Execution::NoChange => LocalOutcome::NoChange,
            Execution::Applied(event) => {
                LocalOutcome::Queued(replica.pending.push(command, Some(event)))
            }
        };
        drop(replicas);

        if let LocalOutcome::Queued(seq) = outcome {
            let _ = self.event_tx.send(ClientEvent::Applied { model, seq });
        }
        Ok(outcome)
    }

    /// Send the pending changes of `model` and catch up with the server.
    ///
    /// When offline, the queue is left untouched and the error is returned;
    /// the same changes go out on the next successful sync. Syncs of other
    /// models run independently.
    pub async fn sync(&self, model: &Address) -> Result<SyncReport> {
        let sync_lock = self.with_replica(model, |r| r.sync_lock.clone())?;
        let _guard = sync_lock.lock().await;

        let (request, sent) = {
            let replicas = self.replicas.read();
            let replica = replicas
                .get(model)
                .ok_or_else(|| SdkError::ModelNotOpen(model.clone()))?;
            let request = SyncRequest {
                model: model.clone(),
                actor: self.config.actor.clone(),
                last_synced_revision: replica.synced_revision,
                local_changes: replica.pending.commands(),
            };
            (request, replica.pending.len())
        };

        debug!(%model, sent, since = request.last_synced_revision, "Syncing");
        let response = match self.transport.sync(request).await {
            Ok(response) => response,
            Err(TransportError::Offline) => {
                warn!(%model, pending = sent, "Server unreachable, keeping local changes");
                let _ = self.event_tx.send(ClientEvent::Offline {
                    model: model.clone(),
                });
                return Err(TransportError::Offline.into());
            }
            Err(err) => return Err(err.into()),
        };

        let history = self.history(model)?;
        for event in &response.events {
            history.append(event.clone()).await?;
        }

        let report = {
            let mut replicas = self.replicas.write();
            let replica = replicas
                .get_mut(model)
                .ok_or_else(|| SdkError::ModelNotOpen(model.clone()))?;
            self.catch_up(replica, sent, &response.events, response.current_revision)
        };
        history.skip_to(report.revision);

        if !report.lost.is_empty() {
            warn!(%model, lost = report.lost.len(), "Local changes were not confirmed");
        }
        info!(
            %model,
            revision = report.revision,
            confirmed = report.confirmed.len(),
            remote = report.remote_events.len(),
            lost = report.lost.len(),
            "Synced"
        );
        let _ = self.event_tx.send(ClientEvent::Synced {
            model: model.clone(),
            revision: report.revision,
            confirmed: report.confirmed.len(),
            remote: report.remote_events.len(),
            lost: report.lost.len(),
        });
        Ok(report)
    }

    /// Fold the server's answer into `replica`.
    fn catch_up(
        &self,
        replica: &mut Replica,
        sent: usize,
        events: &[Event],
        current_revision: Revision,
    ) -> SyncReport {
        let sent_changes = replica.pending.take_front(sent);
        let unsent = replica.pending.drain();
        let result = reconcile(&sent_changes, events);

        for event in events {
            replica.base.apply(event);
        }
        // The log may have moved on between the server's two reads.
        let last_event = events.last().map(Event::revision).unwrap_or(0);
        replica.synced_revision = replica
            .synced_revision
            .max(current_revision)
            .max(last_event);

        // Rebuild the local state from the new base.
        replica.local = replica.base.clone();
        let mut lost = Vec::new();
        let mut retry = Vec::new();
        if self.config.replay_lost_changes {
            retry.extend(result.non_mapped_local_changes.iter().cloned());
        } else {
            lost.extend(result.non_mapped_local_changes.iter().cloned());
        }
        retry.extend(unsent);

        for change in retry {
            match replica.try_local(&change.command, &self.config.actor) {
                Execution::Applied(event) => {
                    replica.pending.push(change.command, Some(event));
                }
                Execution::NoChange | Execution::Rejected(_) => lost.push(change),
            }
        }

        SyncReport {
            revision: replica.synced_revision,
            confirmed: result.mapped,
            remote_events: result.non_mapped_server_events,
            lost,
        }
    }

    /// Current local view of `model`, pending changes included.
    pub fn state(&self, model: &Address) -> Result<ModelState> {
        self.with_replica(model, |r| r.local.clone())
    }

    /// `model` as last confirmed by the server.
    pub fn confirmed_state(&self, model: &Address) -> Result<ModelState> {
        self.with_replica(model, |r| r.base.clone())
    }

    pub fn pending(&self, model: &Address) -> Result<Vec<LocalChange>> {
        self.with_replica(model, |r| r.pending.iter().cloned().collect())
    }

    pub fn pending_len(&self, model: &Address) -> Result<usize> {
        self.with_replica(model, |r| r.pending.len())
    }

    pub fn synced_revision(&self, model: &Address) -> Result<Revision> {
        self.with_replica(model, |r| r.synced_revision)
    }

    /// The server events this client has received for `model`.
    pub fn history(&self, model: &Address) -> Result<Arc<MemoryChangeLog>> {
        self.with_replica(model, |r| r.history.clone())
    }

    fn with_replica<R>(&self, model: &Address, f: impl FnOnce(&Replica) -> R) -> Result<R> {
        self.replicas
            .read()
            .get(model)
            .map(f)
            .ok_or_else(|| SdkError::ModelNotOpen(model.clone()))
    }
}
