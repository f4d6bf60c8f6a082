pub mod xline;

use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::protocol::config::WatchConfig;
use crate::storage::Storage;

/// The only status treated as healthy.
pub const STATUS_RUNNING: &str = "running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Init,
    Running,
    Degraded,
    Stopped,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Init => "init",
            ClusterStatus::Running => STATUS_RUNNING,
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Engine that mirrors the live cluster state into the backend storage.
///
/// Only the master runs one. `stop` is synchronous, idempotent, and safe
/// to call before or after the run token is cancelled.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Drives the engine until it is stopped, `token` is cancelled or the
    /// engine fails.
    async fn run(&self, token: CancellationToken);

    fn stop(&self);

    fn get_cluster_status(&self) -> String;
}

#[async_trait]
pub trait ClusterFactory: Send + Sync {
    async fn new_cluster(
        &self,
        cfg: &WatchConfig,
        storage: Arc<dyn Storage>,
    ) -> anyhow::Result<Arc<dyn Cluster>>;
}
