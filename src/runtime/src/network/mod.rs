//! Pod networking.
//!
//! Every non-host-network pod gets a named network namespace, and the CNI
//! plugins from the node's configuration wire it up. `CniNetworkManager`
//! implements [`NetworkManager`] on top of `ip netns` and the CNI exec
//! protocol.

mod cni;
mod netns;

use std::path::PathBuf;

use async_trait::async_trait;
use kiln_core::error::Result;
use serde::{Deserialize, Serialize};

pub use cni::{CniNetworkManager, NetworkList};
pub use netns::{netns_name, NETNS_PREFIX};

/// A named network namespace owned by one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetnsHandle {
    pub name: String,
    /// Bind-mount path, e.g. `/var/run/netns/kiln-<id>`
    pub path: PathBuf,
}

/// Pod identity passed to CNI plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodNetwork {
    pub sandbox_id: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

/// Result of network setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    /// Primary pod IP, without prefix length
    pub ip: Option<String>,
    /// Further IPs (dual stack)
    pub additional_ips: Vec<String>,
}

/// Network collaborator used by the sandbox verbs.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create the sandbox's network namespace.
    async fn create_namespace(&self, sandbox_id: &str) -> Result<NetnsHandle>;

    /// Remove a namespace; removing one that is already gone succeeds.
    async fn remove_namespace(&self, handle: &NetnsHandle) -> Result<()>;

    /// Attach the pod to the network.
    async fn setup(&self, pod: &PodNetwork, netns: &NetnsHandle) -> Result<NetworkStatus>;

    /// Detach the pod from the network.
    async fn teardown(&self, pod: &PodNetwork, netns: &NetnsHandle) -> Result<()>;

    /// Whether a usable network configuration is present.
    fn ready(&self) -> bool;

    /// Record the node's pod CIDR, handed to plugins as runtime config.
    fn set_pod_cidr(&self, cidr: &str);
}
