//! CNI plugin invocation.
//!
//! Reads the first network configuration (`*.conflist`, `*.conf`, `*.json`)
//! from the config directory and runs its plugins with the standard exec
//! contract: `CNI_*` environment, network config on stdin, result on stdout.
//! ADD chains each plugin's result into the next one's `prevResult`; DEL
//! runs the plugins in reverse.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::config::NetworkConfig;
use kiln_core::error::{KilnError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{netns, NetnsHandle, NetworkManager, NetworkStatus, PodNetwork};

/// Interface name inside the pod.
const POD_IFNAME: &str = "eth0";

/// A parsed network configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<Value>,
}

impl NetworkList {
    /// Parse a `.conflist`, or a single-plugin `.conf` lifted into a list.
    pub fn parse(bytes: &[u8], conflist: bool) -> Result<Self> {
        if conflist {
            let list: NetworkList = serde_json::from_slice(bytes)?;
            if list.plugins.is_empty() {
                return Err(KilnError::NetworkError(format!(
                    "network {} has no plugins",
                    list.name
                )));
            }
            return Ok(list);
        }

        let plugin: Value = serde_json::from_slice(bytes)?;
        let field = |key: &str| {
            plugin
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| KilnError::NetworkError(format!("network config lacks {}", key)))
        };
        Ok(Self {
            cni_version: field("cniVersion")?,
            name: field("name")?,
            plugins: vec![plugin],
        })
    }

    /// Load the lexically first configuration in `dir`.
    pub fn load_first(dir: &Path) -> Result<Self> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                KilnError::NetworkError(format!("cannot read {}: {}", dir.display(), e))
            })?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("conflist") | Some("conf") | Some("json")
                )
            })
            .collect();
        candidates.sort();

        let path = candidates.first().ok_or_else(|| {
            KilnError::NetworkError(format!("no network config found in {}", dir.display()))
        })?;
        let bytes = std::fs::read(path)?;
        let conflist = path.extension().and_then(|e| e.to_str()) == Some("conflist");
        Self::parse(&bytes, conflist)
    }
}

/// [`NetworkManager`] backed by `ip netns` and CNI plugins.
pub struct CniNetworkManager {
    config_dir: PathBuf,
    plugin_dirs: Vec<PathBuf>,
    netns_dir: PathBuf,
    pod_cidr: RwLock<Option<String>>,
}

impl CniNetworkManager {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            config_dir: config.cni_config_dir.clone(),
            plugin_dirs: config.cni_plugin_dirs.clone(),
            netns_dir: config.netns_dir.clone(),
            pod_cidr: RwLock::new(None),
        }
    }

    fn find_plugin(&self, typ: &str) -> Result<PathBuf> {
        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(typ))
            .find(|path| path.exists())
            .ok_or_else(|| {
                KilnError::NetworkError(format!(
                    "CNI plugin {} not found in {:?}",
                    typ, self.plugin_dirs
                ))
            })
    }

    /// Network config handed to one plugin.
    fn plugin_config(&self, list: &NetworkList, plugin: &Value, prev: Option<&Value>) -> Value {
        let mut conf = plugin.clone();
        if let Value::Object(map) = &mut conf {
            map.insert("cniVersion".into(), Value::String(list.cni_version.clone()));
            map.insert("name".into(), Value::String(list.name.clone()));
            if let Some(prev) = prev {
                map.insert("prevResult".into(), prev.clone());
            }
            if let Some(cidr) = self.pod_cidr.read().clone() {
                map.insert(
                    "runtimeConfig".into(),
                    serde_json::json!({ "podCIDR": cidr }),
                );
            }
        }
        conf
    }

    async fn exec_plugin(
        &self,
        command: &str,
        conf: &Value,
        pod: &PodNetwork,
        netns: &NetnsHandle,
    ) -> Result<Value> {
        let typ = conf
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| KilnError::NetworkError("plugin config lacks type".to_string()))?;
        let binary = self.find_plugin(typ)?;
        let cni_path = std::env::join_paths(&self.plugin_dirs)
            .map_err(|e| KilnError::NetworkError(e.to_string()))?;

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &pod.sandbox_id)
            .env("CNI_NETNS", &netns.path)
            .env("CNI_IFNAME", POD_IFNAME)
            .env("CNI_PATH", cni_path)
            .env("CNI_ARGS", cni_args(pod))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                KilnError::NetworkError(format!("failed to run {}: {}", binary.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(conf)?).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(KilnError::NetworkError(plugin_failure(
                typ,
                command,
                &output.stdout,
                &output.stderr,
            )));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn cni_args(pod: &PodNetwork) -> String {
    format!(
        "IgnoreUnknown=1;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={};K8S_POD_UID={}",
        pod.namespace, pod.name, pod.sandbox_id, pod.uid
    )
}

/// Describe a failed plugin run, preferring the CNI error object on stdout.
fn plugin_failure(typ: &str, command: &str, stdout: &[u8], stderr: &[u8]) -> String {
    if let Ok(err) = serde_json::from_slice::<Value>(stdout) {
        if let Some(msg) = err.get("msg").and_then(Value::as_str) {
            let code = err.get("code").and_then(Value::as_u64).unwrap_or(0);
            return format!("CNI plugin {} {} failed (code {}): {}", typ, command, code, msg);
        }
    }
    format!(
        "CNI plugin {} {} failed: {}",
        typ,
        command,
        String::from_utf8_lossy(stderr).trim()
    )
}

/// Pod IPs from a CNI result (0.3+ `ips`, or legacy `ip4`/`ip6`).
pub(crate) fn result_ips(result: &Value) -> Vec<String> {
    let strip = |cidr: &str| cidr.split('/').next().unwrap_or(cidr).to_string();
    if let Some(ips) = result.get("ips").and_then(Value::as_array) {
        return ips
            .iter()
            .filter_map(|ip| ip.get("address").and_then(Value::as_str))
            .map(strip)
            .collect();
    }
    ["ip4", "ip6"]
        .iter()
        .filter_map(|key| result.get(*key)?.get("ip")?.as_str())
        .map(strip)
        .collect()
}

#[async_trait]
impl NetworkManager for CniNetworkManager {
    async fn create_namespace(&self, sandbox_id: &str) -> Result<NetnsHandle> {
        netns::create(&self.netns_dir, sandbox_id).await
    }

    async fn remove_namespace(&self, handle: &NetnsHandle) -> Result<()> {
        netns::remove(handle).await
    }

    async fn setup(&self, pod: &PodNetwork, netns: &NetnsHandle) -> Result<NetworkStatus> {
        let list = NetworkList::load_first(&self.config_dir)?;
        let mut prev: Option<Value> = None;
        for plugin in &list.plugins {
            let conf = self.plugin_config(&list, plugin, prev.as_ref());
            let result = self.exec_plugin("ADD", &conf, pod, netns).await?;
            if !result.is_null() {
                prev = Some(result);
            }
        }

        let mut ips = prev.as_ref().map(result_ips).unwrap_or_default();
        let ip = if ips.is_empty() { None } else { Some(ips.remove(0)) };
        tracing::info!(
            sandbox_id = %pod.sandbox_id,
            network = %list.name,
            ip = ?ip,
            "Pod network attached"
        );
        Ok(NetworkStatus {
            ip,
            additional_ips: ips,
        })
    }

    async fn teardown(&self, pod: &PodNetwork, netns: &NetnsHandle) -> Result<()> {
        let list = NetworkList::load_first(&self.config_dir)?;
        let mut first_err = None;
        for plugin in list.plugins.iter().rev() {
            let conf = self.plugin_config(&list, plugin, None);
            if let Err(e) = self.exec_plugin("DEL", &conf, pod, netns).await {
                tracing::warn!(sandbox_id = %pod.sandbox_id, error = %e, "CNI DEL failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ready(&self) -> bool {
        NetworkList::load_first(&self.config_dir).is_ok()
    }

    fn set_pod_cidr(&self, cidr: &str) {
        *self.pod_cidr.write() = if cidr.is_empty() {
            None
        } else {
            Some(cidr.to_string())
        };
    }
}
