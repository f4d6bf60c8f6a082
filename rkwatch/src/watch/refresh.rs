use common::{StorageServInfo, storage_discovery_path};
use log::{debug, error, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;

use crate::api::discovery::{RegDiscoverFactory, RegisterDiscover};
use crate::servermetric::MetricSink;
use crate::storage::Storage;

/// Turns discovered storage payloads into `scheme://address:port` endpoints,
/// skipping entries that do not decode.
pub fn build_dc_hosts(servers: &[String]) -> Vec<String> {
    servers
        .iter()
        .enumerate()
        .filter_map(|(i, server)| match serde_json::from_str::<StorageServInfo>(server) {
            Ok(info) => {
                let host = info.endpoint();
                info!("get DCHost[{i}]: {host}");
                Some(host)
            }
            Err(e) => {
                error!("fail to unmarshal DCHost({server}), err: {e}");
                None
            }
        })
        .collect()
}

/// Keeps the storage address list in sync with the storage servers
/// registered under the discovery base path.
pub struct DcHostRefresher {
    path: String,
    reg_factory: Arc<dyn RegDiscoverFactory>,
    storage: Arc<dyn Storage>,
    metric: Arc<dyn MetricSink>,
    heartbeat: Duration,
    backoff: Duration,
}

impl DcHostRefresher {
    pub fn new(
        base_path: &str,
        reg_factory: Arc<dyn RegDiscoverFactory>,
        storage: Arc<dyn Storage>,
        metric: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            path: storage_discovery_path(base_path),
            reg_factory,
            storage,
            metric,
            heartbeat: Duration::from_secs(120),
            backoff: Duration::from_secs(3),
        }
    }

    pub fn with_intervals(mut self, heartbeat: Duration, backoff: Duration) -> Self {
        self.heartbeat = heartbeat;
        self.backoff = backoff;
        self
    }

    pub async fn run(self, token: CancellationToken) {
        info!("data watcher to refresh DCHost of {}", self.path);
        loop {
            let mut reg = self.reg_factory.new_reg_discover();
            let exit = self.follow(reg.as_mut(), &token).await;
            reg.stop().await;
            if exit {
                debug!("refresh DCHost asked to exit");
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(self.backoff) => info!("refresh DCHost: rediscover {}", self.path),
            }
        }
    }

    /// Returns true once `token` is cancelled, false when discovery has to be
    /// set up again.
    async fn follow(&self, reg: &mut dyn RegisterDiscover, token: &CancellationToken) -> bool {
        if let Err(e) = reg.start().await {
            error!("refresh DCHost: register-discover start error: {e}");
            return false;
        }
        let mut events = match reg.discover_service(&self.path).await {
            Ok(events) => events,
            Err(e) => {
                error!("refresh DCHost: DiscoverService({}) error: {e}", self.path);
                return false;
            }
        };

        let mut tick = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        loop {
            tokio::select! {
                _ = token.cancelled() => return true,
                _ = tick.tick() => info!("refresh DCHost is running"),
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("refresh DCHost: discover channel of {} closed", self.path);
                        return false;
                    };
                    if let Some(err) = event.err {
                        error!("DCHost discover err: {err}");
                        continue;
                    }
                    info!("get DCHost node num({})", event.servers.len());
                    let hosts = build_dc_hosts(&event.servers);
                    let ready = !hosts.is_empty();
                    self.storage.set_dc_address(hosts);
                    self.metric.set_dc_status(ready);
                }
            }
        }
    }
}
