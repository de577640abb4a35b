use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Identity of the requester node that owns the scheduled tasks.
///
/// These fields are stamped onto every task header at registration so that
/// providers know where to send results.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Public key id of this node. Offers coming from this id are refused.
    pub key_id: String,
    /// Human readable node name
    pub node_name: String,
    /// Address providers should return results to
    pub address: IpAddr,
    pub port: u16,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            key_id: "requester".to_string(),
            node_name: "taskmesh".to_string(),
            address: IpAddr::from([127, 0, 0, 1]),
            port: 40102,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub node: NodeIdentity,
    /// Root directory under which per-task scratch directories are created
    pub scratch_root: PathBuf,
    /// How often the deadline sweep runs
    pub sweep_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node: NodeIdentity::default(),
            scratch_root: std::env::temp_dir().join("taskmesh"),
            sweep_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn new(node: NodeIdentity, scratch_root: PathBuf) -> Self {
        Self {
            node,
            scratch_root,
            ..Default::default()
        }
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
