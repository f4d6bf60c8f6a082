use serde::{Deserialize, Serialize};

/// Root of every service registration in the discovery store.
pub const SERV_BASEPATH: &str = "/rk8s/services/endpoints";
/// Module name the data watchers register under.
pub const MODULE_DATAWATCH: &str = "datawatch";
/// Module name of the backend storage service.
pub const MODULE_STORAGE: &str = "storage";

/// Registration a data watcher publishes for itself.
///
/// Peers compare these payloads byte for byte, so the field order below is
/// part of the wire contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchServInfo {
    pub cluster_id: String,
    pub address: String,
    pub port: u32,
    pub metrics_port: u16,
    pub hostname: String,
    pub scheme: String,
    pub pid: u32,
    pub version: String,
}

impl WatchServInfo {
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerInfo {
    pub scheme: String,
    pub address: String,
    pub port: u32,
}

/// Registration published by a backend storage instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServInfo {
    #[serde(rename = "serverInfo")]
    pub server_info: StorageServerInfo,
}

impl StorageServInfo {
    /// Connection address in `scheme://address:port` form.
    pub fn endpoint(&self) -> String {
        let info = &self.server_info;
        format!("{}://{}:{}", info.scheme, info.address, info.port)
    }
}

/// `{base}/{watch module}/{cluster}/{address}`
pub fn watch_register_key(base: &str, cluster_id: &str, address: &str) -> String {
    format!("{base}/{MODULE_DATAWATCH}/{cluster_id}/{address}")
}

/// `{base}/{watch module}/{cluster}`
pub fn watch_discovery_path(base: &str, cluster_id: &str) -> String {
    format!("{base}/{MODULE_DATAWATCH}/{cluster_id}")
}

/// `{base}/{storage module}`
pub fn storage_discovery_path(base: &str) -> String {
    format!("{base}/{MODULE_STORAGE}")
}
