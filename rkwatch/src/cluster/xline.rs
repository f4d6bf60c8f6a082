use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, WatchOptions, WatchResponse};
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use log::{error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Cluster, ClusterFactory, ClusterStatus};
use crate::protocol::config::WatchConfig;
use crate::storage::{Storage, SyncAction, SyncData};

type TaggedWatch = BoxStream<'static, (String, Result<WatchResponse, etcd_client::Error>)>;

/// like etcd, k:/registry/<kind>/<name> v:yaml of the object
pub fn resource_prefix(kind: &str) -> String {
    format!("/registry/{kind}/")
}

/// Mirrors `/registry/<kind>/` of the cluster store into the backend storage:
/// a full snapshot first, then every change from the snapshot revision on.
pub struct XlineCluster {
    client: Client,
    resources: Vec<String>,
    storage: Arc<dyn Storage>,
    status: RwLock<ClusterStatus>,
    stop_token: CancellationToken,
}

impl XlineCluster {
    pub fn new(client: Client, resources: Vec<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            client,
            resources,
            storage,
            status: RwLock::new(ClusterStatus::Init),
            stop_token: CancellationToken::new(),
        }
    }

    // stopped is terminal
    fn set_status(&self, status: ClusterStatus) {
        let mut current = self.status.write();
        if *current != ClusterStatus::Stopped {
            *current = status;
        }
    }

    async fn push(&self, data: SyncData) {
        if let Err(e) = self.storage.sync(data).await {
            warn!("cluster engine: {e}");
        }
    }

    /// Lists every kind at one revision, the one the first listing saw.
    async fn snapshot(&self, client: &mut Client) -> Result<i64> {
        let mut revision = None;
        for kind in &self.resources {
            let prefix = resource_prefix(kind);
            let mut opts = GetOptions::new().with_prefix();
            if let Some(rev) = revision {
                opts = opts.with_revision(rev);
            }
            let resp = client
                .get(prefix.clone(), Some(opts))
                .await
                .with_context(|| format!("list {prefix}"))?;
            if revision.is_none() {
                revision = Some(resp.header().map_or(0, |h| h.revision()));
            }
            info!("cluster engine: {} {kind} in snapshot", resp.kvs().len());
            for kv in resp.kvs() {
                if let Some(data) = sync_data_from_kv(kind, kv.key(), Some(kv.value())) {
                    self.push(data).await;
                }
            }
        }
        Ok(revision.unwrap_or(0))
    }

    async fn mirror(&self) -> Result<()> {
        let mut client = self.client.clone();
        let revision = self.snapshot(&mut client).await?;

        let mut watchers = Vec::with_capacity(self.resources.len());
        let mut streams: Vec<TaggedWatch> = Vec::with_capacity(self.resources.len());
        for kind in &self.resources {
            let opts = WatchOptions::new()
                .with_prefix()
                .with_start_revision(revision + 1);
            let (watcher, watch_stream) = client
                .watch(resource_prefix(kind), Some(opts))
                .await
                .with_context(|| format!("watch {kind}"))?;
            watchers.push(watcher);
            let kind = kind.clone();
            streams.push(watch_stream.map(move |r| (kind.clone(), r)).boxed());
        }
        let mut merged = stream::select_all(streams);

        while let Some((kind, resp)) = merged.next().await {
            let resp = resp.with_context(|| format!("watch stream of {kind}"))?;
            if resp.canceled() {
                bail!("watch of {kind} canceled by server");
            }
            for ev in resp.events() {
                let Some(kv) = ev.kv() else {
                    continue;
                };
                let value = match ev.event_type() {
                    EventType::Put => Some(kv.value()),
                    EventType::Delete => None,
                };
                if let Some(data) = sync_data_from_kv(&kind, kv.key(), value) {
                    self.push(data).await;
                }
            }
        }
        drop(watchers);
        bail!("all watch streams closed")
    }
}

#[async_trait]
impl Cluster for XlineCluster {
    async fn run(&self, token: CancellationToken) {
        if self.stop_token.is_cancelled() {
            return;
        }
        self.set_status(ClusterStatus::Running);
        info!("cluster engine running for {:?}", self.resources);

        // a pending push is dropped with the mirror when either token fires
        tokio::select! {
            _ = token.cancelled() => {
                self.set_status(ClusterStatus::Stopped);
                info!("cluster engine exited");
            }
            _ = self.stop_token.cancelled() => info!("cluster engine stopped"),
            res = self.mirror() => {
                if let Err(e) = res {
                    error!("cluster engine failed: {e:?}");
                    self.set_status(ClusterStatus::Degraded);
                }
            }
        }
    }

    fn stop(&self) {
        self.stop_token.cancel();
        *self.status.write() = ClusterStatus::Stopped;
    }

    fn get_cluster_status(&self) -> String {
        self.status.read().to_string()
    }
}

/// Converts a stored object into a storage change; `None` value means deleted.
pub fn sync_data_from_kv(kind: &str, key: &[u8], value: Option<&[u8]>) -> Option<SyncData> {
    let key = String::from_utf8_lossy(key);
    let name = key.strip_prefix(&resource_prefix(kind))?;
    if name.is_empty() {
        return None;
    }
    let (action, item) = match value {
        None => (SyncAction::Delete, None),
        Some(raw) => match serde_yaml::from_slice::<serde_json::Value>(raw) {
            Ok(item) => (SyncAction::Update, Some(item)),
            Err(e) => {
                warn!("skip {key}: not a valid object: {e}");
                return None;
            }
        },
    };
    Some(SyncData {
        data_type: kind.to_string(),
        action,
        name: name.to_string(),
        item,
    })
}

pub struct XlineClusterFactory;

#[async_trait]
impl ClusterFactory for XlineClusterFactory {
    async fn new_cluster(
        &self,
        cfg: &WatchConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<dyn Cluster>> {
        let cluster_cfg = &cfg.cluster_config;
        if cluster_cfg.endpoints.is_empty() {
            bail!("no store endpoints configured for cluster {}", cfg.cluster_id);
        }
        if cluster_cfg.resources.is_empty() {
            bail!("no resources configured for cluster {}", cfg.cluster_id);
        }

        let opts = match (&cluster_cfg.username, &cluster_cfg.password) {
            (Some(user), Some(pass)) => {
                Some(ConnectOptions::default().with_user(user.clone(), pass.clone()))
            }
            _ => None,
        };
        let client = Client::connect(cluster_cfg.endpoints.clone(), opts)
            .await
            .with_context(|| format!("connect cluster store {:?}", cluster_cfg.endpoints))?;

        Ok(Arc::new(XlineCluster::new(
            client,
            cluster_cfg.resources.clone(),
            storage,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::config::test_config;
    use crate::storage::dc::DataCenterStorage;

    #[test]
    fn test_put_becomes_update() {
        let data = sync_data_from_kv(
            "pods",
            b"/registry/pods/nginx",
            Some(b"apiVersion: v1\nkind: Pod\nmetadata:\n  name: nginx\n"),
        )
        .unwrap();
        assert_eq!(data.action, SyncAction::Update);
        assert_eq!(data.data_type, "pods");
        assert_eq!(data.name, "nginx");
        assert_eq!(data.item.unwrap()["kind"], "Pod");
    }

    #[test]
    fn test_delete_has_no_item() {
        let data = sync_data_from_kv("nodes", b"/registry/nodes/node-1", None).unwrap();
        assert_eq!(data.action, SyncAction::Delete);
        assert_eq!(data.name, "node-1");
        assert!(data.item.is_none());
    }

    #[test]
    fn test_foreign_or_broken_keys_are_skipped() {
        assert!(sync_data_from_kv("pods", b"/registry/nodes/node-1", None).is_none());
        assert!(sync_data_from_kv("pods", b"/registry/pods/", None).is_none());
        assert!(sync_data_from_kv("pods", b"/registry/pods/bad", Some(b"a: [1")).is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ClusterStatus::Running.to_string(), crate::cluster::STATUS_RUNNING);
        assert_eq!(ClusterStatus::Degraded.to_string(), "degraded");
    }

    #[tokio::test]
    async fn test_factory_rejects_missing_endpoints() {
        let cfg = test_config();
        let storage: Arc<dyn Storage> = Arc::new(DataCenterStorage::new(&cfg).unwrap());
        let err = XlineClusterFactory
            .new_cluster(&cfg, storage)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no store endpoints"));
    }
}
