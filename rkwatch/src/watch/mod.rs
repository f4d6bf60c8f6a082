pub mod election;
pub mod refresh;
pub mod signal;

use anyhow::Context;
use futures::future::join_all;
use log::{error, info, warn};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::api::discovery::{DiscoveryError, RegDiscoverFactory};
use crate::api::xlinediscovery::XlineRegDiscoverFactory;
use crate::cluster::ClusterFactory;
use crate::cluster::xline::XlineClusterFactory;
use crate::protocol::config::WatchConfig;
use crate::servermetric::server::run_metric;
use crate::servermetric::{MetricSink, ServerMetric};
use crate::storage::dc::DataCenterStorage;
use crate::storage::{Storage, StorageError};
use election::{Election, Outcome};
use refresh::DcHostRefresher;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("data watcher cluster unknown")]
    ClusterUnknown,
    #[error("register-discover: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("encode registration payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("role resolution failed: self not among {0} discovered watchers")]
    RoleNotFound(usize),
    #[error("create cluster: {0:#}")]
    ClusterCreate(anyhow::Error),
    #[error("storage not ready after {0:?}")]
    StorageNotReady(Duration),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("operation canceled")]
    Cancelled,
}

/// Intervals of the supervisor and its tasks.
#[derive(Debug, Clone)]
pub struct Timing {
    pub storage_poll: Duration,
    pub retry_backoff: Duration,
    pub signal_grace: Duration,
    pub health_tick: Duration,
    pub refresh_heartbeat: Duration,
    pub refresh_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            storage_poll: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(3),
            signal_grace: Duration::from_secs(2),
            health_tick: Duration::from_secs(60),
            refresh_heartbeat: Duration::from_secs(120),
            refresh_backoff: Duration::from_secs(3),
        }
    }
}

pub fn check_config(cfg: &WatchConfig) -> Result<(), WatchError> {
    if cfg.cluster_id.is_empty() {
        error!("data watcher cluster unknown");
        return Err(WatchError::ClusterUnknown);
    }
    Ok(())
}

/// Blocks until the storage knows at least one address.
pub async fn wait_for_storage(
    storage: &dyn Storage,
    poll: Duration,
    max_wait: Option<Duration>,
    token: &CancellationToken,
) -> Result<(), WatchError> {
    let started = Instant::now();
    loop {
        if !storage.get_dc_address().is_empty() {
            return Ok(());
        }
        if let Some(max) = max_wait
            && started.elapsed() >= max
        {
            return Err(WatchError::StorageNotReady(max));
        }
        warn!("storage address is empty, data watcher cannot run yet");
        tokio::select! {
            _ = token.cancelled() => return Err(WatchError::Cancelled),
            _ = sleep(poll) => {}
        }
    }
}

/// Owns the process lifetime: signal handling, the health endpoint, the
/// storage address refresher and the retried election.
pub struct Supervisor {
    cfg: Arc<WatchConfig>,
    metric: Arc<dyn MetricSink>,
    storage: Arc<dyn Storage>,
    reg_factory: Arc<dyn RegDiscoverFactory>,
    cluster_factory: Arc<dyn ClusterFactory>,
    timing: Timing,
}

impl Supervisor {
    pub fn new(
        cfg: Arc<WatchConfig>,
        metric: Arc<dyn MetricSink>,
        storage: Arc<dyn Storage>,
        reg_factory: Arc<dyn RegDiscoverFactory>,
        cluster_factory: Arc<dyn ClusterFactory>,
    ) -> Self {
        Self {
            cfg,
            metric,
            storage,
            reg_factory,
            cluster_factory,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Runs until `signal` resolves or the election fails fatally.
    pub async fn run<S>(&self, signal: S) -> Result<(), WatchError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        check_config(&self.cfg)?;
        info!("data watcher run for cluster {}", self.cfg.cluster_id);

        let root = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(signal::handle_sys_signal(
            signal,
            root.child_token(),
            root.clone(),
            self.timing.signal_grace,
        )));

        if self.cfg.metric_port != 0 {
            let addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.metric_port));
            let metric = self.metric.clone();
            let token = root.child_token();
            let tls = self.cfg.metric_tls.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_metric(addr, metric, tls, token).await {
                    error!("run metric fail: {e:?}");
                }
            }));
        }

        self.storage.set_dc_address(Vec::new());
        self.metric.set_dc_status(false);
        let storage_token = root.child_token();
        let refresher = DcHostRefresher::new(
            &self.cfg.xline_config.prefix,
            self.reg_factory.clone(),
            self.storage.clone(),
            self.metric.clone(),
        )
        .with_intervals(self.timing.refresh_heartbeat, self.timing.refresh_backoff);
        tasks.push(tokio::spawn(refresher.run(storage_token.clone())));

        let result = self.serve(&root, storage_token).await;
        info!("to cancel root after run server returned");
        root.cancel();
        if timeout(self.timing.signal_grace, join_all(tasks)).await.is_err() {
            warn!("background tasks still running after {:?}", self.timing.signal_grace);
        }
        result
    }

    async fn serve(
        &self,
        root: &CancellationToken,
        storage_token: CancellationToken,
    ) -> Result<(), WatchError> {
        match wait_for_storage(
            self.storage.as_ref(),
            self.timing.storage_poll,
            self.cfg.storage_ready_timeout(),
            root,
        )
        .await
        {
            Ok(()) => {}
            Err(WatchError::Cancelled) => return Ok(()),
            Err(e) => {
                error!("{e}");
                return Err(e);
            }
        }
        self.storage.run(storage_token).await?;
        info!("after storage created, to run server...");

        let election = Election::new(
            self.cfg.clone(),
            self.storage.clone(),
            self.metric.clone(),
            self.reg_factory.clone(),
            self.cluster_factory.clone(),
        )
        .with_health_interval(self.timing.health_tick);
        let token = root.child_token();
        loop {
            match election.run_server(&token).await {
                Outcome::Shutdown => return Ok(()),
                Outcome::Fatal(e) => {
                    error!("run server err: {e}");
                    return Err(e);
                }
                Outcome::Retry(err) => {
                    if let Some(e) = err {
                        error!("run server err: {e}");
                    }
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = sleep(self.timing.retry_backoff) => info!("retry run server..."),
                    }
                }
            }
        }
    }
}

/// Wires the production collaborators and runs until SIGINT or SIGTERM.
pub async fn run(cfg: WatchConfig) -> anyhow::Result<()> {
    check_config(&cfg)?;
    let metric: Arc<dyn MetricSink> = Arc::new(ServerMetric::new());
    let storage: Arc<dyn Storage> =
        Arc::new(DataCenterStorage::new(&cfg).context("create storage client")?);
    let reg_factory: Arc<dyn RegDiscoverFactory> =
        Arc::new(XlineRegDiscoverFactory::new(cfg.xline_config.clone()));
    let cluster_factory: Arc<dyn ClusterFactory> = Arc::new(XlineClusterFactory);

    Supervisor::new(Arc::new(cfg), metric, storage, reg_factory, cluster_factory)
        .run(signal::shutdown_signal())
        .await?;
    info!("data watcher exited");
    Ok(())
}
