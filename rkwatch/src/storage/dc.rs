use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::config::WatchConfig;
use crate::storage::{Storage, StorageError, SyncAction, SyncData};

/// HTTP client of the data center storage.
///
/// Changes are queued by the engine and written by a single background loop,
/// trying the known storage addresses in order until one accepts the write.
pub struct DataCenterStorage {
    cluster_id: String,
    addrs: Arc<RwLock<Vec<String>>>,
    tx: mpsc::Sender<SyncData>,
    rx: Mutex<Option<mpsc::Receiver<SyncData>>>,
    http: reqwest::Client,
}

impl DataCenterStorage {
    pub fn new(cfg: &WatchConfig) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.storage_timeout_secs))
            .build()?;
        let (tx, rx) = mpsc::channel(cfg.storage_queue_size.max(1));
        Ok(Self {
            cluster_id: cfg.cluster_id.clone(),
            addrs: Arc::new(RwLock::new(Vec::new())),
            tx,
            rx: Mutex::new(Some(rx)),
            http,
        })
    }
}

#[async_trait]
impl Storage for DataCenterStorage {
    fn set_dc_address(&self, addrs: Vec<String>) {
        info!("storage addresses set to {addrs:?}");
        *self.addrs.write() = addrs;
    }

    fn get_dc_address(&self) -> Vec<String> {
        self.addrs.read().clone()
    }

    async fn sync(&self, data: SyncData) -> Result<(), StorageError> {
        self.tx
            .send(data)
            .await
            .map_err(|_| StorageError::QueueClosed)
    }

    async fn run(&self, token: CancellationToken) -> Result<(), StorageError> {
        let mut rx = self.rx.lock().take().ok_or(StorageError::AlreadyRunning)?;
        let addrs = self.addrs.clone();
        let http = self.http.clone();
        let cluster_id = self.cluster_id.clone();

        tokio::spawn(async move {
            info!("storage sync loop started for cluster {cluster_id}");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("storage sync loop asked to exit");
                        return;
                    }
                    data = rx.recv() => {
                        let Some(data) = data else {
                            return;
                        };
                        let targets = addrs.read().clone();
                        if let Err(e) = write_through(&http, &targets, &cluster_id, &data).await {
                            error!("failed to sync {}: {e}", data.describe());
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

fn resource_url(addr: &str, cluster_id: &str, data: &SyncData) -> String {
    format!(
        "{}/rk8sstorage/v1/dynamic/clusters/{}/{}/{}",
        addr.trim_end_matches('/'),
        cluster_id,
        data.data_type,
        data.name
    )
}

async fn write_through(
    http: &reqwest::Client,
    addrs: &[String],
    cluster_id: &str,
    data: &SyncData,
) -> Result<(), StorageError> {
    let mut last = StorageError::NoAddress;
    for addr in addrs {
        let url = resource_url(addr, cluster_id, data);
        let req = match data.action {
            SyncAction::Update => http.put(&url).json(&serde_json::json!({ "data": data.item })),
            SyncAction::Delete => http.delete(&url),
        };
        match req.send().await.and_then(|resp| resp.error_for_status()) {
            Ok(_) => {
                debug!("synced {} to {addr}", data.describe());
                return Ok(());
            }
            Err(e) => {
                warn!("write {} to {addr} failed: {e}", data.describe());
                last = e.into();
            }
        }
    }
    Err(last)
}
