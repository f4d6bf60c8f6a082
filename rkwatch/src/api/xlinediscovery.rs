use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, GetOptions, Identity, PutOptions, SortOrder, SortTarget,
    TlsOptions, WatchOptions,
};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::discovery::{DiscoveryError, DiscoveryEvent, RegDiscoverFactory, RegisterDiscover};
use crate::protocol::config::XlineConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_SIZE: usize = 16;

/// Register/discover client backed by xline (etcd v3 API).
///
/// A registration is a key bound to a lease that is kept alive until `stop`.
/// Discovery lists the path sorted by creation revision, so the longest-lived
/// registration is always reported first, and republishes the whole list on
/// every change below the path.
pub struct XlineRegDiscover {
    cfg: XlineConfig,
    client: Option<Client>,
    leases: Vec<i64>,
    token: CancellationToken,
}

impl XlineRegDiscover {
    pub fn new(cfg: XlineConfig) -> Self {
        Self {
            cfg,
            client: None,
            leases: Vec::new(),
            token: CancellationToken::new(),
        }
    }

    fn connect_options(cfg: &XlineConfig) -> Result<ConnectOptions, DiscoveryError> {
        let mut opts = ConnectOptions::default().with_connect_timeout(CONNECT_TIMEOUT);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts = opts.with_user(user.clone(), pass.clone());
        }
        if let Some(tls) = &cfg.tls {
            let ca = std::fs::read(&tls.ca_file)?;
            let mut tls_opts = TlsOptions::new().ca_certificate(Certificate::from_pem(ca));
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                let identity = Identity::from_pem(std::fs::read(cert)?, std::fs::read(key)?);
                tls_opts = tls_opts.identity(identity);
            }
            opts = opts.with_tls(tls_opts);
        }
        Ok(opts)
    }

    fn client(&self) -> Result<Client, DiscoveryError> {
        self.client.clone().ok_or(DiscoveryError::NotStarted)
    }
}

#[async_trait]
impl RegisterDiscover for XlineRegDiscover {
    async fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.client.is_some() {
            return Ok(());
        }
        let opts = Self::connect_options(&self.cfg)?;
        let client = Client::connect(self.cfg.endpoints.clone(), Some(opts)).await?;
        info!("register-discover connected to {:?}", self.cfg.endpoints);
        self.client = Some(client);
        Ok(())
    }

    async fn stop(&mut self) {
        self.token.cancel();
        if let Some(mut client) = self.client.take() {
            for lease_id in self.leases.drain(..) {
                if let Err(e) = client.lease_revoke(lease_id).await {
                    warn!("failed to revoke lease {lease_id}, it will expire by ttl: {e}");
                }
            }
            info!("register-discover stopped");
        }
    }

    async fn register_service(&mut self, key: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let mut client = self.client()?;
        let lease_id = client.lease_grant(self.cfg.lease_ttl, None).await?.id();

        if let Err(e) = client
            .put(key, data, Some(PutOptions::new().with_lease(lease_id)))
            .await
        {
            let _ = client.lease_revoke(lease_id).await;
            return Err(e.into());
        }
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(e.into());
            }
        };
        self.leases.push(lease_id);

        let token = self.token.clone();
        let key = key.to_string();
        let period = Duration::from_secs((self.cfg.lease_ttl / 3).max(1) as u64);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("keep alive of {key} asked to exit");
                        return;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            error!("keep alive of {key} failed: {e}");
                            return;
                        }
                        match stream.message().await {
                            Ok(Some(resp)) if resp.ttl() <= 0 => {
                                warn!("{}", DiscoveryError::LeaseExpired(lease_id));
                                return;
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                warn!("keep alive stream of {key} closed");
                                return;
                            }
                            Err(e) => {
                                error!("keep alive stream of {key} failed: {e}");
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn discover_service(
        &mut self,
        path: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let mut client = self.client()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let (mut watcher, mut stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let token = self.token.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            if !publish(&tx, &path, list_servers(&mut client, &prefix).await).await {
                return;
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = watcher.cancel().await;
                        debug!("discover of {path} asked to exit");
                        return;
                    }
                    msg = stream.message() => {
                        let err = match msg {
                            Ok(Some(resp)) if resp.canceled() => {
                                DiscoveryError::WatchCanceled(path.clone())
                            }
                            Ok(Some(resp)) => {
                                if resp.events().is_empty() {
                                    continue;
                                }
                                let snapshot = list_servers(&mut client, &prefix).await;
                                if publish(&tx, &path, snapshot).await {
                                    continue;
                                }
                                return;
                            }
                            Ok(None) => DiscoveryError::ChannelClosed(path.clone()),
                            Err(e) => e.into(),
                        };
                        error!("discover of {path} ended: {err}");
                        let _ = tx.send(DiscoveryEvent::error(&path, err)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Sends one snapshot; false once the discovery should end.
async fn publish(
    tx: &mpsc::Sender<DiscoveryEvent>,
    path: &str,
    snapshot: Result<Vec<String>, DiscoveryError>,
) -> bool {
    let (event, keep_going) = match snapshot {
        Ok(servers) => (DiscoveryEvent::servers(path, servers), true),
        Err(e) => (DiscoveryEvent::error(path, e), false),
    };
    tx.send(event).await.is_ok() && keep_going
}

async fn list_servers(client: &mut Client, prefix: &str) -> Result<Vec<String>, DiscoveryError> {
    let opts = GetOptions::new()
        .with_prefix()
        .with_sort(SortTarget::Create, SortOrder::Ascend);
    let resp = client.get(prefix, Some(opts)).await?;
    Ok(resp
        .kvs()
        .iter()
        .map(|kv| String::from_utf8_lossy(kv.value()).to_string())
        .collect())
}

#[derive(Clone)]
pub struct XlineRegDiscoverFactory {
    cfg: XlineConfig,
}

impl XlineRegDiscoverFactory {
    pub fn new(cfg: XlineConfig) -> Self {
        Self { cfg }
    }
}

impl RegDiscoverFactory for XlineRegDiscoverFactory {
    fn new_reg_discover(&self) -> Box<dyn RegisterDiscover> {
        Box::new(XlineRegDiscover::new(self.cfg.clone()))
    }
}
