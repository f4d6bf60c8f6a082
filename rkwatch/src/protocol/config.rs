use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    // cluster this watcher is responsible for
    #[serde(default)]
    pub cluster_id: String,
    // ip advertised to the other watchers
    pub address: String,
    #[serde(default)]
    pub metric_port: u16,
    // serve the health endpoint over https when set
    #[serde(default)]
    pub metric_tls: Option<ServerTlsConfig>,
    #[serde(default = "default_scheme")]
    pub server_scheme: String,
    // register/discover backend
    pub xline_config: XlineConfig,
    // store the watched cluster state is read from
    pub cluster_config: ClusterConfig,
    #[serde(default)]
    pub storage_ready_timeout_secs: Option<u64>,
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_secs: u64,
    #[serde(default = "default_queue_size")]
    pub storage_queue_size: usize,
    #[serde(default = "default_thread_num")]
    pub application_thread_num: usize,
    #[serde(default = "default_thread_num")]
    pub taskgroup_thread_num: usize,
    #[serde(default = "default_thread_num")]
    pub exportservice_thread_num: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: i64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub ca_file: String,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,
}

impl WatchConfig {
    pub fn storage_ready_timeout(&self) -> Option<Duration> {
        self.storage_ready_timeout_secs.map(Duration::from_secs)
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_prefix() -> String {
    common::SERV_BASEPATH.to_string()
}

fn default_lease_ttl() -> i64 {
    10
}

fn default_storage_timeout() -> u64 {
    10
}

fn default_queue_size() -> usize {
    1024
}

fn default_thread_num() -> usize {
    100
}

fn default_resources() -> Vec<String> {
    vec!["pods".to_string(), "nodes".to_string()]
}

pub fn load_config(path: impl AsRef<Path>) -> Result<WatchConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: WatchConfig = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
pub(crate) fn test_config() -> WatchConfig {
    WatchConfig {
        cluster_id: "rk8s-10001".to_string(),
        address: "127.0.0.1".to_string(),
        metric_port: 0,
        metric_tls: None,
        server_scheme: default_scheme(),
        xline_config: XlineConfig {
            endpoints: vec![],
            prefix: default_prefix(),
            username: None,
            password: None,
            lease_ttl: default_lease_ttl(),
            tls: None,
        },
        cluster_config: ClusterConfig {
            endpoints: vec![],
            username: None,
            password: None,
            resources: default_resources(),
        },
        storage_ready_timeout_secs: None,
        storage_timeout_secs: 2,
        storage_queue_size: default_queue_size(),
        application_thread_num: 1,
        taskgroup_thread_num: 1,
        exportservice_thread_num: 1,
    }
}
