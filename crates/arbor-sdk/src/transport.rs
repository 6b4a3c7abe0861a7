//! Transport abstraction between a client and the server.

use crate::protocol::{SyncRequest, SyncResponse};
use crate::server::Server;
use arbor_store::BackingStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server is unreachable. Nothing was submitted.
    #[error("Offline")]
    Offline,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server error: {0}")]
    Server(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// One request/response exchange with the server.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, TransportError>;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        (**self).sync(request).await
    }
}

/// In-process transport for tests and simulation.
///
/// Both messages go through a JSON round trip so that whatever a client
/// sees has survived the wire format. The link can be taken down to
/// simulate a client going offline.
pub struct MemoryTransport<S> {
    server: Arc<Server<S>>,
    online: AtomicBool,
}

impl<S: BackingStore + Clone> MemoryTransport<S> {
    pub fn new(server: Arc<Server<S>>) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    pub fn server(&self) -> &Arc<Server<S>> {
        &self.server
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: BackingStore + Clone> SyncTransport for MemoryTransport<S> {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Offline);
        }
        let request: SyncRequest = serde_json::from_str(&serde_json::to_string(&request)?)?;
        let response = self
            .server
            .handle_sync(request)
            .await
            .map_err(|e| TransportError::Server(e.to_string()))?;
        Ok(serde_json::from_str(&serde_json::to_string(&response)?)?)
    }
}
