//! Server side: one concurrency controller per model over a shared store.

use crate::error::{Result, SdkError};
use crate::protocol::{SyncRequest, SyncResponse};
use arbor_concurrency::{ConcurrencyController, ControllerConfig, SubmitOutcome};
use arbor_core::{ActorId, Address, AddressKind, Command, Event, ModelState, Revision};
use arbor_store::{BackingStore, Clock, SystemClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for writers and syncing clients.
///
/// Controllers are created on first use of a model and kept for the lifetime
/// of the server. Servers sharing a store coordinate through it, just like
/// controllers in separate processes would.
pub struct Server<S> {
    store: S,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    controllers: RwLock<HashMap<Address, Arc<ConcurrencyController<S>>>>,
}

impl<S: BackingStore + Clone> Server<S> {
    pub fn new(store: S, config: ControllerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: ControllerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            controllers: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The controller of `model`, created if this server has not used it yet.
    pub fn controller(&self, model: &Address) -> Result<Arc<ConcurrencyController<S>>> {
        if model.kind() != AddressKind::Model {
            return Err(SdkError::NotAModel(model.clone()));
        }
        if let Some(controller) = self.controllers.read().get(model) {
            return Ok(controller.clone());
        }
        let mut controllers = self.controllers.write();
        let controller = controllers.entry(model.clone()).or_insert_with(|| {
            debug!(%model, "Opening model controller");
            Arc::new(ConcurrencyController::with_clock(
                self.store.clone(),
                model.clone(),
                self.config.clone(),
                self.clock.clone(),
            ))
        });
        Ok(controller.clone())
    }

    /// Models this server has opened.
    pub fn models(&self) -> Vec<Address> {
        let mut models: Vec<Address> = self.controllers.read().keys().cloned().collect();
        models.sort();
        models
    }

    pub async fn submit(&self, actor: &ActorId, command: &Command) -> Result<SubmitOutcome> {
        let model = command
            .model_address()
            .ok_or_else(|| SdkError::NoModel(command.target().clone()))?;
        let controller = self.controller(&model)?;
        Ok(controller.submit(actor, command).await?)
    }

    pub async fn events_since(&self, model: &Address, revision: Revision) -> Result<Vec<Event>> {
        Ok(self.controller(model)?.events_since(revision).await?)
    }

    pub async fn current_revision(&self, model: &Address) -> Result<Revision> {
        Ok(self.controller(model)?.current_revision().await?)
    }

    /// The model as of its current revision, replayed from the start.
    pub async fn snapshot(&self, model: &Address) -> Result<ModelState> {
        let events = self.events_since(model, 0).await?;
        Ok(ModelState::replay(model.clone(), &events))
    }

    /// Roll `model` back to `revision`. Administrative: callers must make
    /// sure no writer is active on the model.
    pub async fn truncate_to_revision(&self, model: &Address, revision: Revision) -> Result<bool> {
        let truncated = self.controller(model)?.truncate_to_revision(revision).await?;
        info!(%model, revision, truncated, "Truncate requested");
        Ok(truncated)
    }

    /// Submit a client's pending commands in order, then answer with every
    /// event after its last synced revision.
    pub async fn handle_sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        let controller = self.controller(&request.model)?;
        let mut executed = 0;
        for command in &request.local_changes {
            if command.model_address().as_ref() != Some(&request.model) {
                debug!(model = %request.model, "Skipping command for another model");
                continue;
            }
            if let SubmitOutcome::Executed(_) = controller.submit(&request.actor, command).await? {
                executed += 1;
            }
        }

        let current_revision = controller.current_revision().await?;
        let events = controller
            .events_since(request.last_synced_revision)
            .await?;
        info!(
            model = %request.model,
            actor = %request.actor,
            submitted = request.local_changes.len(),
            executed,
            returned = events.len(),
            current_revision,
            "Handled sync"
        );
        Ok(SyncResponse {
            model: request.model,
            events,
            current_revision,
        })
    }
}
