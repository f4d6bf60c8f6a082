#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use rkwatch::api::discovery::{
    DiscoveryError, DiscoveryEvent, RegDiscoverFactory, RegisterDiscover,
};
use rkwatch::cluster::{Cluster, ClusterFactory, STATUS_RUNNING};
use rkwatch::protocol::config::{ClusterConfig, WatchConfig, XlineConfig};
use rkwatch::storage::{Storage, StorageError, SyncData};

pub const CLUSTER_ID: &str = "rk8s-10001";
pub const BASE: &str = "/rk8s/services/endpoints";

pub fn watch_config() -> WatchConfig {
    WatchConfig {
        cluster_id: CLUSTER_ID.to_string(),
        address: "10.0.0.5".to_string(),
        metric_port: 0,
        metric_tls: None,
        server_scheme: "http".to_string(),
        xline_config: XlineConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: BASE.to_string(),
            username: None,
            password: None,
            lease_ttl: 10,
            tls: None,
        },
        cluster_config: ClusterConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            resources: vec!["pods".to_string()],
        },
        storage_ready_timeout_secs: None,
        storage_timeout_secs: 2,
        storage_queue_size: 16,
        application_thread_num: 1,
        taskgroup_thread_num: 1,
        exportservice_thread_num: 1,
    }
}

/// Polls `cond` on the (usually paused) tokio clock.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..2000 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// In-memory register/discover backend shared by every client of a factory.
#[derive(Default)]
pub struct RegState {
    pub fail_start: AtomicBool,
    /// Starts numbered from this one on fail.
    pub fail_start_from: Mutex<Option<usize>>,
    pub fail_register: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub registered: Mutex<Vec<(String, String)>>,
    pub discovers: Mutex<Vec<(String, Instant)>>,
    servers: Mutex<HashMap<String, Vec<String>>>,
    senders: Mutex<HashMap<String, Vec<(usize, mpsc::Sender<DiscoveryEvent>)>>>,
    next_id: AtomicUsize,
}

impl RegState {
    /// Replaces the list under `path` and pushes it to every subscriber.
    pub fn publish(&self, path: &str, servers: Vec<String>) {
        self.servers.lock().insert(path.to_string(), servers.clone());
        if let Some(senders) = self.senders.lock().get(path) {
            for (_, tx) in senders {
                let _ = tx.try_send(DiscoveryEvent::servers(path, servers.clone()));
            }
        }
    }

    pub fn publish_error(&self, path: &str) {
        if let Some(senders) = self.senders.lock().get(path) {
            for (_, tx) in senders {
                let _ = tx.try_send(DiscoveryEvent::error(
                    path,
                    DiscoveryError::WatchCanceled(path.to_string()),
                ));
            }
        }
    }

    /// Drops every subscription of `path`, closing the channels.
    pub fn close(&self, path: &str) {
        self.senders.lock().remove(path);
    }

    pub fn subscribers(&self, path: &str) -> usize {
        self.senders.lock().get(path).map_or(0, |s| s.len())
    }

    pub fn discovers_of(&self, path: &str) -> Vec<Instant> {
        self.discovers
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, at)| *at)
            .collect()
    }
}

pub struct MockRegDiscover {
    id: usize,
    state: Arc<RegState>,
}

#[async_trait]
impl RegisterDiscover for MockRegDiscover {
    async fn start(&mut self) -> Result<(), DiscoveryError> {
        let n = self.state.starts.fetch_add(1, Ordering::SeqCst);
        let from = *self.state.fail_start_from.lock();
        if self.state.fail_start.load(Ordering::SeqCst) || from.is_some_and(|from| n >= from) {
            return Err(DiscoveryError::Io(std::io::Error::other("connection refused")));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        for senders in self.state.senders.lock().values_mut() {
            senders.retain(|(id, _)| *id != self.id);
        }
    }

    async fn register_service(&mut self, key: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        if self.state.fail_register.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Io(std::io::Error::other("lease grant failed")));
        }
        self.state
            .registered
            .lock()
            .push((key.to_string(), String::from_utf8_lossy(data).into_owned()));
        Ok(())
    }

    async fn discover_service(
        &mut self,
        path: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .discovers
            .lock()
            .push((path.to_string(), Instant::now()));
        if let Some(servers) = self.state.servers.lock().get(path) {
            let _ = tx.try_send(DiscoveryEvent::servers(path, servers.clone()));
        }
        self.state
            .senders
            .lock()
            .entry(path.to_string())
            .or_default()
            .push((self.id, tx));
        Ok(rx)
    }
}

#[derive(Default)]
pub struct MockRegFactory {
    pub state: Arc<RegState>,
}

impl RegDiscoverFactory for MockRegFactory {
    fn new_reg_discover(&self) -> Box<dyn RegisterDiscover> {
        Box::new(MockRegDiscover {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
        })
    }
}

pub struct MockCluster {
    status: Mutex<String>,
    pub runs: AtomicUsize,
    pub stops: AtomicUsize,
    /// Set once the run token is cancelled.
    pub finished: AtomicBool,
}

impl MockCluster {
    pub fn set_status(&self, status: &str) {
        *self.status.lock() = status.to_string();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn run(&self, token: CancellationToken) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        token.cancelled().await;
        self.finished.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn get_cluster_status(&self) -> String {
        self.status.lock().clone()
    }
}

#[derive(Default)]
pub struct MockClusterFactory {
    pub fail: AtomicBool,
    pub created: Mutex<Vec<Arc<MockCluster>>>,
}

impl MockClusterFactory {
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockCluster>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl ClusterFactory for MockClusterFactory {
    async fn new_cluster(
        &self,
        _cfg: &WatchConfig,
        _storage: Arc<dyn Storage>,
    ) -> anyhow::Result<Arc<dyn Cluster>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("cluster store unreachable");
        }
        let cluster = Arc::new(MockCluster {
            status: Mutex::new(STATUS_RUNNING.to_string()),
            runs: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        });
        self.created.lock().push(cluster.clone());
        Ok(cluster)
    }
}

#[derive(Default)]
pub struct MockStorage {
    addrs: RwLock<Vec<String>>,
    pub runs: AtomicUsize,
    pub synced: Mutex<Vec<SyncData>>,
}

#[async_trait]
impl Storage for MockStorage {
    fn set_dc_address(&self, addrs: Vec<String>) {
        *self.addrs.write() = addrs;
    }

    fn get_dc_address(&self) -> Vec<String> {
        self.addrs.read().clone()
    }

    async fn sync(&self, data: SyncData) -> Result<(), StorageError> {
        self.synced.lock().push(data);
        Ok(())
    }

    async fn run(&self, _token: CancellationToken) -> Result<(), StorageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn storage_payload(scheme: &str, address: &str, port: u32) -> String {
    serde_json::json!({
        "serverInfo": { "scheme": scheme, "address": address, "port": port }
    })
    .to_string()
}
