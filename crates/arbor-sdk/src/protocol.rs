//! Messages of the client/server synchronization call.

use arbor_core::{ActorId, Address, Command, Event, Revision};
use serde::{Deserialize, Serialize};

/// A client's pending commands for one model, and where its replica stands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub model: Address,
    pub actor: ActorId,
    pub last_synced_revision: Revision,
    pub local_changes: Vec<Command>,
}

/// Every event of the model after the client's last synced revision, the
/// client's own submissions included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub model: Address,
    pub events: Vec<Event>,
    pub current_revision: Revision,
}
