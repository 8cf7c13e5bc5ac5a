#![forbid(unsafe_code)]

use std::sync::Arc;

use buzzer_contracts::pitch::{Pitch, PitchId};
use buzzer_engines::registry_client::{RegistryClient, RegistryClientError};
use buzzer_storage::{PitchStore, StorageError};
use chrono::Utc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no pitch with id {0} found")]
    NotFound(String),

    #[error("pitch with id {0} already released")]
    AlreadyReleased(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry error: {0}")]
    Other(String),
}

/// What the release controller needs from the pitch registry. Calls block;
/// the controller runs on its own thread.
pub trait ReleaseRegistry: Send {
    fn lookup(&self, id: &PitchId) -> Result<Pitch, RegistryError>;

    fn release(&self, id: &PitchId) -> Result<Pitch, RegistryError>;
}

/// Registry living in the same process.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    store: Arc<PitchStore>,
}

impl LocalRegistry {
    pub fn new(store: Arc<PitchStore>) -> Self {
        Self { store }
    }
}

impl ReleaseRegistry for LocalRegistry {
    fn lookup(&self, id: &PitchId) -> Result<Pitch, RegistryError> {
        self.store.get(id).map_err(from_storage)
    }

    fn release(&self, id: &PitchId) -> Result<Pitch, RegistryError> {
        self.store.release(id, Utc::now()).map_err(from_storage)
    }
}

/// Registry reached over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteRegistry {
    client: RegistryClient,
}

impl RemoteRegistry {
    pub fn new(client: RegistryClient) -> Self {
        Self { client }
    }
}

impl ReleaseRegistry for RemoteRegistry {
    fn lookup(&self, id: &PitchId) -> Result<Pitch, RegistryError> {
        self.client.lookup_pitch(id).map_err(|err| from_client(id, err))
    }

    fn release(&self, id: &PitchId) -> Result<Pitch, RegistryError> {
        self.client.release_pitch(id).map_err(|err| from_client(id, err))
    }
}

fn from_storage(err: StorageError) -> RegistryError {
    match err {
        StorageError::NotFound { id } => RegistryError::NotFound(id),
        StorageError::AlreadyReleased { id } => RegistryError::AlreadyReleased(id),
        other => RegistryError::Other(other.to_string()),
    }
}

fn from_client(id: &PitchId, err: RegistryClientError) -> RegistryError {
    match err {
        RegistryClientError::NotFound(_) => RegistryError::NotFound(id.to_string()),
        RegistryClientError::AlreadyReleased(_) => RegistryError::AlreadyReleased(id.to_string()),
        RegistryClientError::Transport(msg) => RegistryError::Unavailable(msg),
        other => RegistryError::Other(other.to_string()),
    }
}
