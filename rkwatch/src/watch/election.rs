use common::{WatchServInfo, watch_discovery_path, watch_register_key};
use log::{debug, error, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use crate::api::discovery::{DiscoveryError, RegDiscoverFactory, RegisterDiscover};
use crate::cluster::{Cluster, ClusterFactory, STATUS_RUNNING};
use crate::protocol::config::WatchConfig;
use crate::servermetric::{MetricSink, Role};
use crate::storage::Storage;
use crate::watch::WatchError;

/// How one election attempt ended.
#[derive(Debug)]
pub enum Outcome {
    /// The owning token was cancelled.
    Shutdown,
    /// Tear down finished, start over after a backoff.
    Retry(Option<WatchError>),
    /// Retrying cannot help.
    Fatal(WatchError),
}

impl Outcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::Retry(_))
    }
}

/// Position of our own payload decides the role: first is master.
pub fn resolve_role(servers: &[String], own: &str) -> Option<Role> {
    servers
        .iter()
        .position(|server| server == own)
        .map(|idx| if idx == 0 { Role::Master } else { Role::Slave })
}

enum EngineSlot {
    Idle,
    Running {
        cluster: Arc<dyn Cluster>,
        cancel: CancellationToken,
    },
}

impl EngineSlot {
    fn status(&self) -> Option<String> {
        match self {
            EngineSlot::Idle => None,
            EngineSlot::Running { cluster, .. } => Some(cluster.get_cluster_status()),
        }
    }

    fn start(&mut self, cluster: Arc<dyn Cluster>, cancel: CancellationToken) {
        self.shutdown();
        let runner = cluster.clone();
        let token = cancel.clone();
        tokio::spawn(async move { runner.run(token).await });
        *self = EngineSlot::Running { cluster, cancel };
    }

    fn shutdown(&mut self) {
        if let EngineSlot::Running { cluster, cancel } = std::mem::replace(self, EngineSlot::Idle) {
            cluster.stop();
            cancel.cancel();
        }
    }
}

struct Session {
    reg: Box<dyn RegisterDiscover>,
    engine: EngineSlot,
}

impl Session {
    async fn teardown(&mut self) {
        self.reg.stop().await;
        self.engine.shutdown();
    }
}

/// Registers this watcher, follows its sibling watchers and runs the cluster
/// engine while it is the master.
pub struct Election {
    cfg: Arc<WatchConfig>,
    storage: Arc<dyn Storage>,
    metric: Arc<dyn MetricSink>,
    reg_factory: Arc<dyn RegDiscoverFactory>,
    cluster_factory: Arc<dyn ClusterFactory>,
    health_interval: Duration,
}

impl Election {
    pub fn new(
        cfg: Arc<WatchConfig>,
        storage: Arc<dyn Storage>,
        metric: Arc<dyn MetricSink>,
        reg_factory: Arc<dyn RegDiscoverFactory>,
        cluster_factory: Arc<dyn ClusterFactory>,
    ) -> Self {
        Self {
            cfg,
            storage,
            metric,
            reg_factory,
            cluster_factory,
            health_interval: Duration::from_secs(60),
        }
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// The payload this watcher registers and looks for among its peers.
    pub fn payload(&self) -> Result<String, WatchError> {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| {
                error!("data watcher get hostname failed");
                "UNKNOWN".to_string()
            });
        let info = WatchServInfo {
            cluster_id: self.cfg.cluster_id.clone(),
            address: self.cfg.address.clone(),
            port: 0,
            metrics_port: self.cfg.metric_port,
            hostname,
            scheme: self.cfg.server_scheme.clone(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        Ok(info.to_payload()?)
    }

    /// One registration lifetime. Every exit path stops the registration and
    /// the engine it started.
    pub async fn run_server(&self, token: &CancellationToken) -> Outcome {
        self.metric.set_cluster_status(false, "begin run server");
        self.metric.set_role(Role::Slave);

        let mut reg = self.reg_factory.new_reg_discover();
        if let Err(e) = reg.start().await {
            error!("register-discover start error: {e}");
            self.metric
                .set_cluster_status(false, &format!("register error: {e}"));
            return Outcome::Fatal(e.into());
        }
        info!("register-discover start succ");
        info!(
            "ApplicationThreadNum: {}, TaskgroupThreadNum: {}, ExportserviceThreadNum: {}",
            self.cfg.application_thread_num,
            self.cfg.taskgroup_thread_num,
            self.cfg.exportservice_thread_num
        );

        let payload = match self.payload() {
            Ok(payload) => payload,
            Err(e) => {
                reg.stop().await;
                self.metric
                    .set_cluster_status(false, &format!("register error: {e}"));
                return Outcome::Fatal(e);
            }
        };
        let base = &self.cfg.xline_config.prefix;
        let key = watch_register_key(base, &self.cfg.cluster_id, &self.cfg.address);
        let path = watch_discovery_path(base, &self.cfg.cluster_id);

        if let Err(e) = reg.register_service(&key, payload.as_bytes()).await {
            error!("RegisterService({key}) error: {e}");
            self.metric
                .set_cluster_status(false, &format!("register error: {e}"));
            reg.stop().await;
            return Outcome::Retry(Some(e.into()));
        }
        info!("RegisterService({key}:{payload}) succ");

        let mut events = match reg.discover_service(&path).await {
            Ok(events) => events,
            Err(e) => {
                error!("DiscoverService({path}) error: {e}");
                self.metric
                    .set_cluster_status(false, &format!("discover error: {e}"));
                reg.stop().await;
                return Outcome::Retry(Some(e.into()));
            }
        };
        info!("DiscoverService({path}) succ");

        let mut session = Session {
            reg,
            engine: EngineSlot::Idle,
        };
        let mut held = Role::Unassigned;
        let mut tick = interval_at(Instant::now() + self.health_interval, self.health_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("run_server asked to exit");
                    session.teardown().await;
                    return Outcome::Shutdown;
                }
                _ = tick.tick() => {
                    debug!("tick: run_server is alive as {held}");
                    if let Some(status) = session.engine.status()
                        && status != STATUS_RUNNING
                    {
                        warn!("tick: current cluster status({status}), to rebuild cluster");
                        self.metric.set_cluster_status(false, "cluster status not running");
                        session.teardown().await;
                        return Outcome::Retry(None);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        let err = DiscoveryError::ChannelClosed(path.clone());
                        error!("get discover event err: {err}");
                        self.metric.set_cluster_status(false, &format!("discover error: {err}"));
                        session.teardown().await;
                        return Outcome::Retry(Some(err.into()));
                    };
                    if let Some(err) = event.err {
                        error!("get discover event err: {err}");
                        self.metric.set_cluster_status(false, &format!("discover error: {err}"));
                        session.teardown().await;
                        return Outcome::Retry(Some(err.into()));
                    }
                    for (i, server) in event.servers.iter().enumerate() {
                        debug!("get discover event: server[{i}]: {} {server}", event.key);
                    }

                    let Some(role) = resolve_role(&event.servers, &payload) else {
                        info!(
                            "get discover event, server list len({}), but cannot find myself",
                            event.servers.len()
                        );
                        session.teardown().await;
                        self.metric.set_cluster_status(false, "role error");
                        return Outcome::Retry(Some(WatchError::RoleNotFound(event.servers.len())));
                    };
                    self.metric.set_role(role);
                    self.metric.set_cluster_status(true, &format!("{role} run ok"));
                    info!("get discover event, curr role: {role}");

                    if role == held {
                        continue;
                    }
                    info!("role changed: from {held} to {role}");
                    if role == Role::Master {
                        info!("become master: to new and run cluster...");
                        let cluster = match self
                            .cluster_factory
                            .new_cluster(&self.cfg, self.storage.clone())
                            .await
                        {
                            Ok(cluster) => cluster,
                            Err(e) => {
                                error!("create cluster error: {e:?}");
                                session.teardown().await;
                                self.metric.set_cluster_status(false, "master create cluster error");
                                return Outcome::Retry(Some(WatchError::ClusterCreate(e)));
                            }
                        };
                        session.engine.start(cluster, token.child_token());
                    } else {
                        info!("become {role}: to stop cluster...");
                        session.engine.shutdown();
                    }
                    held = role;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_is_master() {
        assert_eq!(resolve_role(&servers(&["P"]), "P"), Some(Role::Master));
        assert_eq!(resolve_role(&servers(&["P", "Q", "R"]), "P"), Some(Role::Master));
    }

    #[test]
    fn test_later_is_slave() {
        assert_eq!(resolve_role(&servers(&["Q", "P"]), "P"), Some(Role::Slave));
        assert_eq!(resolve_role(&servers(&["Q", "R", "P"]), "P"), Some(Role::Slave));
    }

    #[test]
    fn test_absent_is_unresolved() {
        assert_eq!(resolve_role(&servers(&["Q", "R"]), "P"), None);
        assert_eq!(resolve_role(&[], "P"), None);
    }

    #[test]
    fn test_payload_matches_by_bytes() {
        let own = r#"{"clusterId":"c1","address":"10.0.0.5"}"#;
        let spaced = r#"{"clusterId": "c1","address":"10.0.0.5"}"#;
        assert_eq!(resolve_role(&servers(&[spaced, own]), own), Some(Role::Slave));
    }

    #[test]
    fn test_outcome_retry_flag() {
        assert!(Outcome::Retry(None).is_retry());
        assert!(!Outcome::Shutdown.is_retry());
        assert!(!Outcome::Fatal(WatchError::ClusterUnknown).is_retry());
    }
}
