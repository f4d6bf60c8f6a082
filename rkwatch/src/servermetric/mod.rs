pub mod server;

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Unassigned,
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Unassigned => "unassigned",
            Role::Master => "master",
            Role::Slave => "slave",
        };
        f.write_str(s)
    }
}

/// Answer of the health query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthMeta {
    pub current_role: Role,
    pub is_healthy: bool,
    pub message: String,
}

/// Sink every component reports its role and health to.
pub trait MetricSink: Send + Sync {
    fn set_role(&self, role: Role);

    fn get_role(&self) -> Role;

    fn set_cluster_status(&self, healthy: bool, message: &str);

    /// Health of the backend storage the watcher writes to.
    fn set_dc_status(&self, healthy: bool);

    fn health(&self) -> HealthMeta;
}

struct MetricState {
    role: Role,
    cluster_ok: bool,
    cluster_msg: String,
    dc_ok: bool,
}

pub struct ServerMetric {
    state: RwLock<MetricState>,
}

impl Default for ServerMetric {
    fn default() -> Self {
        Self {
            state: RwLock::new(MetricState {
                role: Role::Unassigned,
                cluster_ok: false,
                cluster_msg: String::new(),
                dc_ok: false,
            }),
        }
    }
}

impl ServerMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_status(&self) -> (bool, String) {
        let state = self.state.read();
        (state.cluster_ok, state.cluster_msg.clone())
    }

    pub fn dc_status(&self) -> bool {
        self.state.read().dc_ok
    }
}

impl MetricSink for ServerMetric {
    fn set_role(&self, role: Role) {
        self.state.write().role = role;
    }

    fn get_role(&self) -> Role {
        self.state.read().role
    }

    fn set_cluster_status(&self, healthy: bool, message: &str) {
        let mut state = self.state.write();
        state.cluster_ok = healthy;
        state.cluster_msg = message.to_string();
    }

    fn set_dc_status(&self, healthy: bool) {
        self.state.write().dc_ok = healthy;
    }

    fn health(&self) -> HealthMeta {
        let state = self.state.read();
        let (is_healthy, message) = match (state.cluster_ok, state.dc_ok) {
            (true, true) => (true, state.cluster_msg.clone()),
            (true, false) => (false, "storage unavailable".to_string()),
            (false, _) => (false, state.cluster_msg.clone()),
        };
        HealthMeta {
            current_role: state.role,
            is_healthy,
            message,
        }
    }
}
