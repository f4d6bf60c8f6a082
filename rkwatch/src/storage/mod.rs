pub mod dc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sync queue is closed")]
    QueueClosed,
    #[error("storage is already running")]
    AlreadyRunning,
    #[error("no storage address available")]
    NoAddress,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Update,
    Delete,
}

/// One resource change to be written to the backend storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncData {
    pub data_type: String,
    pub action: SyncAction,
    pub name: String,
    pub item: Option<serde_json::Value>,
}

impl SyncData {
    pub fn describe(&self) -> String {
        format!("{:?} {}/{}", self.action, self.data_type, self.name)
    }
}

/// Client of the backend storage service.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Replaces the known storage addresses.
    fn set_dc_address(&self, addrs: Vec<String>);

    /// Current storage addresses; empty means the storage is not ready.
    fn get_dc_address(&self) -> Vec<String>;

    /// Queues a change for the run loop, waiting while the queue is full.
    async fn sync(&self, data: SyncData) -> Result<(), StorageError>;

    /// Starts the background writers and returns immediately.
    async fn run(&self, token: CancellationToken) -> Result<(), StorageError>;
}
