use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("register-discover client is not started")]
    NotStarted,
    #[error("discover channel of {0} closed")]
    ChannelClosed(String),
    #[error("watch of {0} canceled by server")]
    WatchCanceled(String),
    #[error("lease {0} expired")]
    LeaseExpired(i64),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(e: etcd_client::Error) -> Self {
        DiscoveryError::Xline(Box::new(e))
    }
}

/// Ordered snapshot of every payload registered below a discovery path.
///
/// The position in `servers` is decided by the backend and is the only
/// ordering the election relies on.
#[derive(Debug)]
pub struct DiscoveryEvent {
    pub key: String,
    pub servers: Vec<String>,
    pub err: Option<DiscoveryError>,
}

impl DiscoveryEvent {
    pub fn servers(key: impl Into<String>, servers: Vec<String>) -> Self {
        Self {
            key: key.into(),
            servers,
            err: None,
        }
    }

    pub fn error(key: impl Into<String>, err: DiscoveryError) -> Self {
        Self {
            key: key.into(),
            servers: Vec::new(),
            err: Some(err),
        }
    }
}

/// Client of the service register/discover backend.
///
/// A client is started once, used for any number of registrations and
/// discoveries, and stopped once. `stop` must release every registration
/// and close every discovery channel handed out.
#[async_trait]
pub trait RegisterDiscover: Send {
    async fn start(&mut self) -> Result<(), DiscoveryError>;

    async fn stop(&mut self);

    async fn register_service(&mut self, key: &str, data: &[u8]) -> Result<(), DiscoveryError>;

    async fn discover_service(
        &mut self,
        path: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;
}

/// Builds a fresh, unstarted client for every registration lifetime.
pub trait RegDiscoverFactory: Send + Sync {
    fn new_reg_discover(&self) -> Box<dyn RegisterDiscover>;
}
