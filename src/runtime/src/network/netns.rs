//! Named network namespaces via `ip netns`.

use std::path::Path;

use kiln_core::error::{KilnError, Result};
use tokio::process::Command;

use super::NetnsHandle;

/// Prefix of every namespace the daemon creates.
pub const NETNS_PREFIX: &str = "kiln-";

/// Namespace name for a sandbox.
pub fn netns_name(sandbox_id: &str) -> String {
    format!("{}{}", NETNS_PREFIX, kiln_core::short_id(sandbox_id))
}

async fn ip_netns(args: &[&str]) -> Result<std::process::Output> {
    Command::new("ip")
        .arg("netns")
        .args(args)
        .output()
        .await
        .map_err(|e| KilnError::NetworkError(format!("failed to run ip netns: {}", e)))
}

pub(crate) async fn create(netns_dir: &Path, sandbox_id: &str) -> Result<NetnsHandle> {
    let name = netns_name(sandbox_id);
    let output = ip_netns(&["add", &name]).await?;
    if !output.status.success() {
        return Err(KilnError::NetworkError(format!(
            "ip netns add {} failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    tracing::debug!(sandbox_id = %sandbox_id, netns = %name, "Created network namespace");
    Ok(NetnsHandle {
        path: netns_dir.join(&name),
        name,
    })
}

pub(crate) async fn remove(handle: &NetnsHandle) -> Result<()> {
    if !handle.path.exists() {
        return Ok(());
    }
    let output = ip_netns(&["delete", &handle.name]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file") {
            return Ok(());
        }
        return Err(KilnError::NetworkError(format!(
            "ip netns delete {} failed: {}",
            handle.name,
            stderr.trim()
        )));
    }
    tracing::debug!(netns = %handle.name, "Removed network namespace");
    Ok(())
}
