//! Nimbus core types – shared by every controller crate.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod cidr;
pub mod keys;
pub mod labels;
pub mod provider;
pub mod stack;
pub mod taints;

pub use stack::StackType;

/// Label carried by tenant-scoped objects; its value names the tenant.
pub const TENANCY_LABEL: &str = "tenancy/provider-config";

/// Node label holding the subnet the node pool was created in.
pub const SUBNET_LABEL: &str = "cloud.google.com/gke-node-pool-subnet";

pub const INSTANCE_ID_ANNOTATION: &str = "container.googleapis.com/instance_id";
pub const LAST_APPLIED_LABELS_ANNOTATION: &str = "node.gke.io/last-applied-node-labels";
pub const LAST_APPLIED_TAINTS_ANNOTATION: &str = "node.gke.io/last-applied-node-taints";
pub const NORTH_INTERFACES_ANNOTATION: &str = "networking.gke.io/north-interfaces";
pub const MULTI_NETWORK_ANNOTATION: &str = "networking.gke.io/multi-network";
pub const NODE_NETWORKS_ANNOTATION: &str = "networking.gke.io/node-networks";

/// Pod annotation required by the autopilot readonly-kubelet policy.
pub const AUTOPILOT_READONLY_ANNOTATION: &str = "autopilot/kubelet-api-limited-reader";

/// Instance metadata keys consumed by the node annotator.
pub const KUBE_LABELS_METADATA_KEY: &str = "kube-labels";
pub const KUBE_ENV_METADATA_KEY: &str = "kube-env";

/// Error taxonomy shared by the sync loops. The queue runner keys its
/// retry-vs-drop decision off `is_retryable`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input; terminal for the item.
    #[error("parse: {0}")]
    Parse(String),
    /// External call failed in a way worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// A supporting object is gone; the item is skipped.
    #[error("not found: {0}")]
    NotFound(String),
    /// Policy said no.
    #[error("denied: {0}")]
    Denied(String),
    /// Startup-time misconfiguration; aborts the process.
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tenant descriptor observed from the object store. Created elsewhere;
/// this core only reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub name: String,
    /// Value of the tenancy label, when the descriptor carries one.
    pub tenancy: Option<String>,
    pub project_number: i64,
    pub cluster_network: String,
    pub pod_ranges: Vec<String>,
    pub subnet_paths: Vec<String>,
}

impl ProviderConfig {
    /// Supervisor tenants also observe objects that predate labelling.
    pub fn is_supervisor(&self) -> bool {
        self.name.starts_with('s')
    }
}

pub mod prelude {
    pub use super::{Error, ProviderConfig, Result, StackType, TENANCY_LABEL};
}
