//! CRI RuntimeService implementation.
//!
//! Every mutating verb follows the same order: validate against the
//! registry, call the collaborator, then apply the registry change. A
//! collaborator call that fails or is cancelled leaves the registry as it
//! was, and resources created earlier in the same call are rolled back.
//!
//! Creates, starts and removes run on their own task. A caller that hits
//! its deadline or disconnects stops waiting, but the work still reaches a
//! commit or a rollback.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kiln_core::{generate_id, DaemonConfig};
use kiln_runtime::{
    copy_tree, ContainerSpec, ImageStorage, MountSpec, NetnsHandle, NetworkManager,
    NetworkStatus, OciImageConfig, PodNetwork, RuntimeInvoker,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::cri_api as cri;
use crate::cri_api::runtime_service_server::RuntimeService;
use crate::error::{CriError, Result};
use crate::exit_watcher::{read_artifact, ExitWatcher};
use crate::metrics::CriMetrics;
use crate::registry::{
    container_full_name, sandbox_full_name, ContainerEntry, ContainerRecord, ContainerState,
    NameReservation, Registry, SandboxEntry, SandboxRecord, SandboxState,
};
use crate::streaming::{SessionKind, StreamingHandle, StreamingSession};

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// How often StopContainer looks for the exit artifact.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Collaborators and shared state behind both CRI services.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<Registry>,
    pub invoker: Arc<dyn RuntimeInvoker>,
    pub images: Arc<dyn ImageStorage>,
    pub network: Arc<dyn NetworkManager>,
    pub watcher: Arc<ExitWatcher>,
    pub streaming: StreamingHandle,
    pub metrics: Arc<CriMetrics>,
    /// Fired when the shutdown grace period runs out
    pub cancel: CancellationToken,
}

impl ServiceContext {
    /// Run a collaborator call unless the daemon gives up on in-flight
    /// calls first.
    pub(crate) async fn call<T>(
        &self,
        verb: &str,
        id: &str,
        fut: impl Future<Output = kiln_core::Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CriError::Cancelled(format!(
                "{} {}: daemon is shutting down",
                verb, id
            ))),
            res = fut => res.map_err(|e| CriError::collaborator(verb, id, e)),
        }
    }

    /// Convert a handler result into a gRPC response and count it.
    pub(crate) fn respond<T>(
        &self,
        verb: &'static str,
        started: Instant,
        result: Result<T>,
    ) -> std::result::Result<Response<T>, Status> {
        let result = result.map(Response::new).map_err(Status::from);
        let code = match &result {
            Ok(_) => tonic::Code::Ok,
            Err(status) => {
                tracing::warn!(verb, code = ?status.code(), message = %status.message(), "CRI call failed");
                status.code()
            }
        };
        self.metrics.observe(verb, code, started.elapsed());
        result
    }
}

/// Kiln implementation of the CRI RuntimeService.
pub struct KilnRuntimeService {
    ctx: ServiceContext,
    pod_cidr: RwLock<Option<String>>,
}

impl KilnRuntimeService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            pod_cidr: RwLock::new(None),
        }
    }

    fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    fn sandbox_entry(&self, id: &str) -> Result<SandboxEntry> {
        self.registry()
            .sandbox(id)
            .ok_or_else(|| CriError::not_found("sandbox", id))
    }

    fn container_entry(&self, id: &str) -> Result<ContainerEntry> {
        self.registry()
            .container(id)
            .ok_or_else(|| CriError::not_found("container", id))
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_sandbox(&self, req: cri::RunPodSandboxRequest) -> Result<cri::RunPodSandboxResponse> {
        let config = req
            .config
            .ok_or_else(|| CriError::invalid("sandbox config required"))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| CriError::invalid("sandbox metadata required"))?;
        if metadata.name.is_empty() || metadata.namespace.is_empty() || metadata.uid.is_empty() {
            return Err(CriError::invalid(
                "sandbox metadata must set name, namespace and uid",
            ));
        }

        let id = generate_id();
        let full_name = sandbox_full_name(
            &metadata.name,
            &metadata.namespace,
            &metadata.uid,
            metadata.attempt,
        );
        tracing::info!(
            sandbox_id = %id,
            name = %metadata.name,
            namespace = %metadata.namespace,
            "CRI RunPodSandbox"
        );

        let reservation = self.ctx.registry.reserve(&full_name, &id)?;
        let request = NewSandbox {
            id: id.clone(),
            full_name,
            metadata,
            config,
            runtime_handler: req.runtime_handler,
        };
        let ctx = self.ctx.clone();
        detached(move |abandoned| async move {
            ctx.create_sandbox(request, reservation, abandoned).await
        })
        .await?;
        Ok(cri::RunPodSandboxResponse { pod_sandbox_id: id })
    }

    async fn stop_sandbox(&self, req: cri::StopPodSandboxRequest) -> Result<cri::StopPodSandboxResponse> {
        const VERB: &str = "StopPodSandbox";
        let entry = self.sandbox_entry(&req.pod_sandbox_id)?;
        let id = entry.id().to_string();
        tracing::info!(sandbox_id = %id, "CRI StopPodSandbox");

        let _op = entry.operation().await;
        // NotReady first so no container can join while the rest are stopped.
        let (containers, netns, pod) = {
            let mut record = entry.lock().await;
            if record.advance(SandboxState::NotReady) {
                self.registry().persist_sandbox(&record).await;
            }
            (record.containers.clone(), record.netns.clone(), pod_network(&record))
        };

        for container_id in containers {
            if let Some(container) = self.registry().container(&container_id) {
                self.ctx.stop_entry(&container, 0).await?;
            }
        }

        if let Some(netns) = netns {
            self.ctx
                .call(VERB, &id, self.ctx.network.teardown(&pod, &netns))
                .await?;
        }
        Ok(cri::StopPodSandboxResponse {})
    }

    async fn remove_sandbox(
        &self,
        req: cri::RemovePodSandboxRequest,
    ) -> Result<cri::RemovePodSandboxResponse> {
        const VERB: &str = "RemovePodSandbox";
        let Some(entry) = self.registry().sandbox(&req.pod_sandbox_id) else {
            tracing::debug!(sandbox_id = %req.pod_sandbox_id, "RemovePodSandbox of unknown sandbox");
            return Ok(cri::RemovePodSandboxResponse {});
        };
        let id = entry.id().to_string();
        tracing::info!(sandbox_id = %id, "CRI RemovePodSandbox");

        let _op = entry.operation().await;
        let (netns, pod, was_ready) = {
            let mut record = entry.lock().await;
            if record.state == SandboxState::Removed {
                return Ok(cri::RemovePodSandboxResponse {});
            }
            if !record.containers.is_empty() {
                return Err(CriError::precondition(format!(
                    "sandbox has {} containers",
                    record.containers.len()
                )));
            }
            let was_ready = record.state == SandboxState::Ready;
            // Closed to new containers while the network goes away.
            if record.advance(SandboxState::NotReady) {
                self.registry().persist_sandbox(&record).await;
            }
            (record.netns.clone(), pod_network(&record), was_ready)
        };

        if let Some(netns) = netns {
            if was_ready {
                self.ctx
                    .call(VERB, &id, self.ctx.network.teardown(&pod, &netns))
                    .await?;
            }
            self.ctx
                .call(VERB, &id, self.ctx.network.remove_namespace(&netns))
                .await?;
        }

        let mut record = entry.lock().await;
        record.advance(SandboxState::Removed);
        self.registry().delete_sandbox(&record).await;
        Ok(cri::RemovePodSandboxResponse {})
    }

    async fn sandbox_status(
        &self,
        req: cri::PodSandboxStatusRequest,
    ) -> Result<cri::PodSandboxStatusResponse> {
        let entry = self.sandbox_entry(&req.pod_sandbox_id)?;
        let record = entry.lock().await;

        let network_mode = if record.netns.is_some() {
            cri::NamespaceMode::Pod
        } else {
            cri::NamespaceMode::Node
        };
        let status = cri::PodSandboxStatus {
            id: record.id.clone(),
            metadata: Some(sandbox_metadata(&record)),
            state: sandbox_state(record.state) as i32,
            created_at: nanos(record.created_at),
            network: Some(cri::PodSandboxNetworkStatus {
                ip: record.ip.clone().unwrap_or_default(),
                additional_ips: record
                    .additional_ips
                    .iter()
                    .map(|ip| cri::PodIp { ip: ip.clone() })
                    .collect(),
            }),
            linux: Some(cri::LinuxPodSandboxStatus {
                namespaces: Some(cri::Namespace {
                    options: Some(cri::NamespaceOption {
                        network: network_mode as i32,
                        pid: cri::NamespaceMode::Container as i32,
                        ipc: cri::NamespaceMode::Pod as i32,
                        target_id: String::new(),
                    }),
                }),
            }),
            labels: record.labels.clone(),
            annotations: record.annotations.clone(),
            runtime_handler: record.runtime_handler.clone(),
        };

        let mut info = HashMap::new();
        if req.verbose {
            let verbose = serde_json::json!({
                "netns": record.netns.as_ref().map(|n| n.path.display().to_string()),
                "hostname": record.hostname,
                "containers": record.containers,
            });
            info.insert("info".to_string(), verbose.to_string());
        }
        Ok(cri::PodSandboxStatusResponse {
            status: Some(status),
            info,
        })
    }

    async fn list_sandboxes(
        &self,
        req: cri::ListPodSandboxRequest,
    ) -> Result<cri::ListPodSandboxResponse> {
        let filter = req.filter.unwrap_or_default();
        let mut items = Vec::new();
        for entry in self.registry().sandboxes() {
            if !filter.id.is_empty() && !entry.id().starts_with(&filter.id) {
                continue;
            }
            let record = entry.lock().await;
            if record.state == SandboxState::Removed {
                continue;
            }
            let state = sandbox_state(record.state) as i32;
            if filter.state.as_ref().is_some_and(|s| s.state != state) {
                continue;
            }
            if !labels_match(&record.labels, &filter.label_selector) {
                continue;
            }
            items.push(cri::PodSandbox {
                id: record.id.clone(),
                metadata: Some(sandbox_metadata(&record)),
                state,
                created_at: nanos(record.created_at),
                labels: record.labels.clone(),
                annotations: record.annotations.clone(),
                runtime_handler: record.runtime_handler.clone(),
            });
        }
        items.sort_by_key(|s| s.created_at);
        Ok(cri::ListPodSandboxResponse { items })
    }

    // ── Containers ───────────────────────────────────────────────────

    async fn create_container(
        &self,
        req: cri::CreateContainerRequest,
    ) -> Result<cri::CreateContainerResponse> {
        let config = req
            .config
            .ok_or_else(|| CriError::invalid("container config required"))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| CriError::invalid("container metadata required"))?;
        if metadata.name.is_empty() {
            return Err(CriError::invalid("container name required"));
        }
        let image = config
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .filter(|i| !i.is_empty())
            .ok_or_else(|| CriError::invalid("container image required"))?;

        let sandbox_entry = self.sandbox_entry(&req.pod_sandbox_id)?;
        let sandbox = {
            let record = sandbox_entry.lock().await;
            if record.state != SandboxState::Ready {
                return Err(CriError::precondition(format!(
                    "sandbox {} is not ready",
                    record.id
                )));
            }
            record.clone()
        };

        let id = generate_id();
        let full_name = container_full_name(&metadata.name, &sandbox, metadata.attempt);
        tracing::info!(
            container_id = %id,
            sandbox_id = %sandbox.id,
            name = %metadata.name,
            image = %image,
            "CRI CreateContainer"
        );

        let reservation = self.ctx.registry.reserve(&full_name, &id)?;
        let request = NewContainer {
            id: id.clone(),
            full_name,
            metadata,
            image,
            config,
        };
        let ctx = self.ctx.clone();
        detached(move |abandoned| async move {
            ctx.build_container(request, reservation, &sandbox_entry, &sandbox, abandoned)
                .await
        })
        .await?;
        Ok(cri::CreateContainerResponse { container_id: id })
    }

    async fn start_container(
        &self,
        req: cri::StartContainerRequest,
    ) -> Result<cri::StartContainerResponse> {
        let entry = self.container_entry(&req.container_id)?;
        tracing::info!(container_id = %entry.id(), "CRI StartContainer");
        let ctx = self.ctx.clone();
        detached(move |_| async move { ctx.start_entry(&entry).await }).await?;
        Ok(cri::StartContainerResponse {})
    }

    async fn stop_container(
        &self,
        req: cri::StopContainerRequest,
    ) -> Result<cri::StopContainerResponse> {
        let entry = self.container_entry(&req.container_id)?;
        tracing::info!(container_id = %entry.id(), timeout = req.timeout, "CRI StopContainer");
        self.ctx.stop_entry(&entry, req.timeout).await?;
        Ok(cri::StopContainerResponse {})
    }

    async fn remove_container(
        &self,
        req: cri::RemoveContainerRequest,
    ) -> Result<cri::RemoveContainerResponse> {
        let Some(entry) = self.registry().container(&req.container_id) else {
            tracing::debug!(container_id = %req.container_id, "RemoveContainer of unknown container");
            return Ok(cri::RemoveContainerResponse {});
        };
        tracing::info!(container_id = %entry.id(), "CRI RemoveContainer");
        let ctx = self.ctx.clone();
        detached(move |_| async move { ctx.remove_entry(&entry).await }).await?;
        Ok(cri::RemoveContainerResponse {})
    }

    async fn list_containers(
        &self,
        req: cri::ListContainersRequest,
    ) -> Result<cri::ListContainersResponse> {
        let filter = req.filter.unwrap_or_default();
        let mut containers = Vec::new();
        for entry in self.registry().containers() {
            if !filter.id.is_empty() && !entry.id().starts_with(&filter.id) {
                continue;
            }
            let record = entry.lock().await;
            if record.state == ContainerState::Removed {
                continue;
            }
            if !filter.pod_sandbox_id.is_empty() && !record.sandbox_id.starts_with(&filter.pod_sandbox_id) {
                continue;
            }
            let state = container_state(&record.state) as i32;
            if filter.state.as_ref().is_some_and(|s| s.state != state) {
                continue;
            }
            if !labels_match(&record.labels, &filter.label_selector) {
                continue;
            }
            containers.push(cri::Container {
                id: record.id.clone(),
                pod_sandbox_id: record.sandbox_id.clone(),
                metadata: Some(container_metadata(&record)),
                image: Some(image_spec(&record.image)),
                image_ref: record.image_ref.clone(),
                state,
                created_at: nanos(record.created_at),
                labels: record.labels.clone(),
                annotations: record.annotations.clone(),
                image_id: record.image_ref.clone(),
            });
        }
        containers.sort_by_key(|c| c.created_at);
        Ok(cri::ListContainersResponse { containers })
    }

    async fn container_status(
        &self,
        req: cri::ContainerStatusRequest,
    ) -> Result<cri::ContainerStatusResponse> {
        let entry = self.container_entry(&req.container_id)?;
        let record = entry.lock().await;

        let (exit_code, finished_at, reason) = match record.state {
            ContainerState::Stopped {
                exit_code,
                finished_at,
                reason,
            } => (exit_code, nanos(finished_at), reason.as_str().to_string()),
            _ => (0, 0, String::new()),
        };
        let status = cri::ContainerStatus {
            id: record.id.clone(),
            metadata: Some(container_metadata(&record)),
            state: container_state(&record.state) as i32,
            created_at: nanos(record.created_at),
            started_at: record.started_at.map(nanos).unwrap_or(0),
            finished_at,
            exit_code,
            image: Some(image_spec(&record.image)),
            image_ref: record.image_ref.clone(),
            reason,
            message: String::new(),
            labels: record.labels.clone(),
            annotations: record.annotations.clone(),
            mounts: record
                .mounts
                .iter()
                .map(|m| cri::Mount {
                    container_path: m.container_path.display().to_string(),
                    host_path: m.host_path.display().to_string(),
                    readonly: m.readonly,
                    ..Default::default()
                })
                .collect(),
            log_path: record.log_path.display().to_string(),
            image_id: record.image_ref.clone(),
        };

        let mut info = HashMap::new();
        if req.verbose {
            let verbose = serde_json::json!({
                "pid": record.container_pid,
                "supervisor_pid": record.supervisor_pid,
                "bundle": record.bundle.display().to_string(),
                "exit_file": record.exit_file.display().to_string(),
                "command": record.command,
            });
            info.insert("info".to_string(), verbose.to_string());
        }
        Ok(cri::ContainerStatusResponse {
            status: Some(status),
            info,
        })
    }

    async fn running_container(&self, id: &str) -> Result<ContainerRecord> {
        let entry = self.container_entry(id)?;
        let record = entry.lock().await;
        if !record.is_running() {
            return Err(CriError::precondition(format!(
                "container {} is not running",
                record.id
            )));
        }
        Ok(record.clone())
    }

    async fn exec_sync(&self, req: cri::ExecSyncRequest) -> Result<cri::ExecSyncResponse> {
        if req.cmd.is_empty() {
            return Err(CriError::invalid("exec command required"));
        }
        let record = self.running_container(&req.container_id).await?;
        tracing::debug!(container_id = %record.id, cmd = ?req.cmd, "CRI ExecSync");
        let timeout = (req.timeout > 0).then(|| Duration::from_secs(req.timeout as u64));
        let output = self
            .ctx
            .call(
                "ExecSync",
                &record.id,
                self.ctx.invoker.exec_sync(&record.id, &req.cmd, timeout),
            )
            .await?;
        Ok(cri::ExecSyncResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }

    async fn exec(&self, req: cri::ExecRequest) -> Result<cri::ExecResponse> {
        if req.cmd.is_empty() {
            return Err(CriError::invalid("exec command required"));
        }
        let record = self.running_container(&req.container_id).await?;
        let url = self
            .ctx
            .streaming
            .register(StreamingSession {
                kind: SessionKind::Exec,
                container_id: record.id,
                sandbox_id: record.sandbox_id,
                cmd: req.cmd,
                tty: req.tty,
                stdin: req.stdin,
                ports: vec![],
                log_path: None,
            })
            .await;
        Ok(cri::ExecResponse { url })
    }

    async fn attach(&self, req: cri::AttachRequest) -> Result<cri::AttachResponse> {
        let record = self.running_container(&req.container_id).await?;
        let url = self
            .ctx
            .streaming
            .register(StreamingSession {
                kind: SessionKind::Attach,
                container_id: record.id,
                sandbox_id: record.sandbox_id,
                cmd: vec![],
                tty: req.tty,
                stdin: req.stdin,
                ports: vec![],
                log_path: Some(record.log_path),
            })
            .await;
        Ok(cri::AttachResponse { url })
    }

    async fn port_forward(&self, req: cri::PortForwardRequest) -> Result<cri::PortForwardResponse> {
        let entry = self.sandbox_entry(&req.pod_sandbox_id)?;
        let sandbox_id = {
            let record = entry.lock().await;
            if record.state != SandboxState::Ready {
                return Err(CriError::precondition(format!(
                    "sandbox {} is not ready",
                    record.id
                )));
            }
            record.id.clone()
        };
        let url = self
            .ctx
            .streaming
            .register(StreamingSession {
                kind: SessionKind::PortForward,
                container_id: String::new(),
                sandbox_id,
                cmd: vec![],
                tty: false,
                stdin: false,
                ports: req.port,
                log_path: None,
            })
            .await;
        Ok(cri::PortForwardResponse { url })
    }

    // ── Runtime ──────────────────────────────────────────────────────

    fn update_runtime_config(
        &self,
        req: cri::UpdateRuntimeConfigRequest,
    ) -> Result<cri::UpdateRuntimeConfigResponse> {
        let cidr = req
            .runtime_config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .unwrap_or_default();
        if !cidr.is_empty() {
            tracing::info!(pod_cidr = %cidr, "CRI UpdateRuntimeConfig");
            self.ctx.network.set_pod_cidr(&cidr);
            *self.pod_cidr.write() = Some(cidr);
        }
        Ok(cri::UpdateRuntimeConfigResponse {})
    }

    fn status(&self, req: cri::StatusRequest) -> Result<cri::StatusResponse> {
        let runtime_ready = cri::RuntimeCondition {
            r#type: "RuntimeReady".to_string(),
            status: true,
            reason: String::new(),
            message: String::new(),
        };
        let network_ready = if self.ctx.network.ready() {
            cri::RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            }
        } else {
            cri::RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: false,
                reason: "NetworkPluginNotReady".to_string(),
                message: "Network plugin returns error: cni config uninitialized".to_string(),
            }
        };

        let mut info = HashMap::new();
        if req.verbose {
            let config = serde_json::json!({
                "root": self.ctx.config.root.display().to_string(),
                "run_root": self.ctx.config.run_root.display().to_string(),
                "runtime": self.ctx.config.runtime.display().to_string(),
                "cgroup_manager": self.ctx.config.cgroup_manager.to_string(),
                "pod_cidr": *self.pod_cidr.read(),
            });
            info.insert("config".to_string(), config.to_string());
        }
        Ok(cri::StatusResponse {
            status: Some(cri::RuntimeStatus {
                conditions: vec![runtime_ready, network_ready],
            }),
            info,
        })
    }
}

/// Inputs of one RunPodSandbox call.
struct NewSandbox {
    id: String,
    full_name: String,
    metadata: cri::PodSandboxMetadata,
    config: cri::PodSandboxConfig,
    runtime_handler: String,
}

/// Inputs of one CreateContainer call.
struct NewContainer {
    id: String,
    full_name: String,
    metadata: cri::ContainerMetadata,
    image: String,
    config: cri::ContainerConfig,
}

/// Run `work` on its own task and wait for it.
///
/// Dropping the returned future (a client deadline or disconnect) does not
/// stop `work`. It sees `abandoned` fire instead and finishes by either
/// committing or rolling back, so nothing it created is orphaned and no
/// name stays reserved.
async fn detached<T, F, Fut>(work: F) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let abandoned = CancellationToken::new();
    let guard = abandoned.clone().drop_guard();
    let result = match tokio::spawn(work(abandoned)).await {
        Ok(result) => result,
        Err(e) => Err(CriError::internal(format!("task failed: {}", e))),
    };
    guard.disarm();
    result
}

fn abandoned_error(verb: &str, id: &str) -> CriError {
    CriError::Cancelled(format!("{} {}: caller went away", verb, id))
}

/// Mutating verbs. Each runs under the entry's operation lock and only
/// takes the record lock to read or commit.
impl ServiceContext {
    async fn create_sandbox(
        &self,
        req: NewSandbox,
        name: NameReservation,
        abandoned: CancellationToken,
    ) -> Result<()> {
        const VERB: &str = "RunPodSandbox";
        let NewSandbox {
            id,
            full_name,
            metadata,
            config,
            runtime_handler,
        } = req;
        let pod = PodNetwork {
            sandbox_id: id.clone(),
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
            uid: metadata.uid.clone(),
        };

        let (netns, status) = if uses_host_network(&config) {
            (None, NetworkStatus::default())
        } else {
            let netns = self
                .call(VERB, &id, self.network.create_namespace(&id))
                .await?;
            match self.call(VERB, &id, self.network.setup(&pod, &netns)).await {
                Ok(status) => (Some(netns), status),
                Err(e) => {
                    if let Err(err) = self.network.remove_namespace(&netns).await {
                        tracing::warn!(sandbox_id = %id, error = %err, "Failed to roll back network namespace");
                    }
                    return Err(e);
                }
            }
        };

        if abandoned.is_cancelled() {
            tracing::warn!(sandbox_id = %id, "RunPodSandbox caller went away, rolling back");
            self.release_network(&pod, netns.as_ref()).await;
            return Err(abandoned_error(VERB, &id));
        }

        let hostname = if config.hostname.is_empty() {
            metadata.name.clone()
        } else {
            config.hostname.clone()
        };
        let record = SandboxRecord {
            id: id.clone(),
            full_name,
            name: metadata.name,
            namespace: metadata.namespace,
            uid: metadata.uid,
            attempt: metadata.attempt,
            labels: config.labels,
            annotations: config.annotations,
            netns: netns.clone(),
            ip: status.ip,
            additional_ips: status.additional_ips,
            log_directory: config.log_directory,
            runtime_handler,
            hostname,
            created_at: Utc::now(),
            state: SandboxState::Ready,
            containers: Default::default(),
        };
        if let Err(e) = self.registry.insert_sandbox(record).await {
            self.release_network(&pod, netns.as_ref()).await;
            return Err(e);
        }
        name.keep();
        Ok(())
    }

    async fn release_network(&self, pod: &PodNetwork, netns: Option<&NetnsHandle>) {
        let Some(netns) = netns else { return };
        if let Err(e) = self.network.teardown(pod, netns).await {
            tracing::warn!(sandbox_id = %pod.sandbox_id, error = %e, "Failed to roll back pod network");
        }
        if let Err(e) = self.network.remove_namespace(netns).await {
            tracing::warn!(sandbox_id = %pod.sandbox_id, error = %e, "Failed to roll back network namespace");
        }
    }

    async fn build_container(
        &self,
        req: NewContainer,
        name: NameReservation,
        sandbox_entry: &SandboxEntry,
        sandbox: &SandboxRecord,
        abandoned: CancellationToken,
    ) -> Result<()> {
        const VERB: &str = "CreateContainer";
        let id = req.id.as_str();
        let images = &self.images;

        let stored = self
            .call(VERB, id, images.get(&req.image))
            .await?
            .ok_or_else(|| CriError::not_found("image", &req.image))?;
        let image_config = self
            .call(VERB, id, images.image_config(&stored.reference))
            .await?;
        let source = self
            .call(VERB, id, images.resolve_rootfs(&stored.reference))
            .await?;

        let bundle = self.config.bundles_dir().join(id);
        let rootfs = bundle.join("rootfs");
        let copy_to = rootfs.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &copy_to))
            .await
            .map_err(|e| CriError::internal(format!("{} {}: {}", VERB, id, e)))?
            .map_err(|e| CriError::internal(format!("{} {}: copy rootfs: {}", VERB, id, e)))?;

        let spec = container_spec(id, sandbox, &req.config, &image_config, bundle.clone(), rootfs)?;
        let handle = match self.call(VERB, id, self.invoker.create(&spec)).await {
            Ok(handle) => handle,
            Err(e) => {
                remove_dir(&bundle).await;
                return Err(e);
            }
        };

        let mut sandbox_record = sandbox_entry.lock().await;
        let refused = if sandbox_record.state != SandboxState::Ready {
            Some(CriError::precondition(format!(
                "sandbox {} stopped while creating container",
                sandbox.id
            )))
        } else if abandoned.is_cancelled() {
            tracing::warn!(container_id = %id, "CreateContainer caller went away, rolling back");
            Some(abandoned_error(VERB, id))
        } else {
            None
        };
        if let Some(err) = refused {
            drop(sandbox_record);
            self.discard_container(id, &bundle).await;
            return Err(err);
        }

        let config = req.config;
        let record = ContainerRecord {
            id: id.to_string(),
            sandbox_id: sandbox.id.clone(),
            full_name: req.full_name,
            name: req.metadata.name,
            attempt: req.metadata.attempt,
            image: req.image,
            image_ref: stored.digest,
            labels: config.labels,
            annotations: config.annotations,
            command: spec.args.clone(),
            working_dir: spec.working_dir.clone(),
            mounts: spec.mounts.clone(),
            log_path: spec.log_path.clone(),
            tty: spec.tty,
            supervisor_pid: Some(handle.pid),
            container_pid: Some(handle.container_pid),
            exit_file: handle.exit_file,
            bundle: handle.bundle,
            created_at: Utc::now(),
            started_at: None,
            state: ContainerState::Created,
        };
        if let Err(e) = self.registry.insert_container(record).await {
            drop(sandbox_record);
            self.discard_container(id, &bundle).await;
            return Err(e);
        }
        sandbox_record.containers.insert(id.to_string());
        self.registry.persist_sandbox(&sandbox_record).await;
        name.keep();
        Ok(())
    }

    async fn discard_container(&self, id: &str, bundle: &Path) {
        if let Err(e) = self.invoker.delete(id).await {
            tracing::warn!(container_id = %id, error = %e, "Failed to roll back container");
        }
        remove_dir(bundle).await;
    }

    async fn start_entry(&self, entry: &ContainerEntry) -> Result<()> {
        let id = entry.id();
        let _op = entry.operation().await;
        {
            let record = entry.lock().await;
            if record.state != ContainerState::Created {
                return Err(CriError::precondition(format!(
                    "container {} is {}, not created",
                    id,
                    record.state.as_str()
                )));
            }
        }
        self.call("StartContainer", id, self.invoker.start(id)).await?;

        let mut record = entry.lock().await;
        record.started_at = Some(Utc::now());
        // A process that exits at once may already be recorded as Stopped.
        if record.state == ContainerState::Created {
            record.state = ContainerState::Running;
        }
        self.registry.persist_container(&record).await;
        Ok(())
    }

    /// Bring a container to Stopped.
    pub(crate) async fn stop_entry(&self, entry: &ContainerEntry, timeout: i64) -> Result<()> {
        let _op = entry.operation().await;
        self.halt(entry, timeout).await
    }

    /// Signal the container and wait for its exit. The caller holds the
    /// operation lock.
    ///
    /// The transition itself goes through [`ExitWatcher::record`], which
    /// applies it at most once whoever observes the exit first.
    async fn halt(&self, entry: &ContainerEntry, timeout: i64) -> Result<()> {
        const VERB: &str = "StopContainer";
        let id = entry.id();
        let (exit_file, running) = {
            let record = entry.lock().await;
            if !record.is_live() {
                return Ok(());
            }
            (record.exit_file.clone(), record.is_running())
        };

        // A created container is parked before exec, so it cannot honour SIGTERM.
        if running && timeout > 0 {
            self.call(VERB, id, self.invoker.kill(id, SIGTERM, false))
                .await?;
            let grace = Duration::from_secs(timeout as u64);
            if self.await_exit(entry, &exit_file, grace).await? {
                return Ok(());
            }
            tracing::info!(container_id = %id, "Container ignored SIGTERM, killing");
        }

        self.call(VERB, id, self.invoker.kill(id, SIGKILL, true))
            .await?;
        let max_wait = self.config.timeouts.exit_max_wait();
        if self.await_exit(entry, &exit_file, max_wait).await? {
            return Ok(());
        }
        Err(CriError::internal(format!(
            "{} {}: no exit status after SIGKILL",
            VERB, id
        )))
    }

    /// Poll for the exit artifact until `wait` elapses. Returns `true` once
    /// the container is Stopped.
    async fn await_exit(&self, entry: &ContainerEntry, exit_file: &Path, wait: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if !entry.lock().await.is_live() {
                return Ok(true);
            }
            match read_artifact(exit_file.to_path_buf()).await {
                Ok(Some(artifact)) => {
                    self.watcher.record(entry, artifact).await;
                    return Ok(true);
                }
                Ok(None) => {}
                // Possibly mid-write; the watcher owns the escalation.
                Err(e) => tracing::debug!(container_id = %entry.id(), error = %e, "Exit file not readable yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CriError::Cancelled(format!(
                        "StopContainer {}: daemon is shutting down",
                        entry.id()
                    )));
                }
                _ = tokio::time::sleep(STOP_POLL) => {}
            }
        }
    }

    async fn remove_entry(&self, entry: &ContainerEntry) -> Result<()> {
        const VERB: &str = "RemoveContainer";
        let id = entry.id();
        let _op = entry.operation().await;

        // CRI removal always forces.
        self.halt(entry, 0).await?;

        let (bundle, exit_file, sandbox_id) = {
            let record = entry.lock().await;
            match record.state {
                ContainerState::Removed => return Ok(()),
                ContainerState::Stopped { .. } => {}
                other => {
                    return Err(CriError::precondition(format!(
                        "container {} is {} after stop",
                        id,
                        other.as_str()
                    )))
                }
            }
            (record.bundle.clone(), record.exit_file.clone(), record.sandbox_id.clone())
        };

        self.call(VERB, id, self.invoker.delete(id)).await?;
        remove_dir(&bundle).await;
        if let Err(e) = tokio::fs::remove_file(&exit_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(container_id = %id, error = %e, "Failed to remove exit file");
            }
        }
        {
            let mut record = entry.lock().await;
            record.state = ContainerState::Removed;
            self.registry.delete_container(&record).await;
        }

        match self.registry.sandbox(&sandbox_id).filter(|s| s.id() == sandbox_id) {
            Some(sandbox) => {
                let mut record = sandbox.lock().await;
                record.containers.remove(id);
                self.registry.persist_sandbox(&record).await;
                Ok(())
            }
            None => {
                tracing::error!(container_id = %id, sandbox_id = %sandbox_id, "Removed container had no sandbox");
                Err(CriError::internal(format!(
                    "{} {}: sandbox {} missing",
                    VERB, id, sandbox_id
                )))
            }
        }
    }
}

#[tonic::async_trait]
impl RuntimeService for KilnRuntimeService {
    async fn version(
        &self,
        request: Request<cri::VersionRequest>,
    ) -> std::result::Result<Response<cri::VersionResponse>, Status> {
        let started = Instant::now();
        let _req = request.into_inner();
        let response = cri::VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "kiln".to_string(),
            runtime_version: crate::VERSION.to_string(),
            runtime_api_version: "v1".to_string(),
        };
        self.ctx.respond("Version", started, Ok(response))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<cri::RunPodSandboxRequest>,
    ) -> std::result::Result<Response<cri::RunPodSandboxResponse>, Status> {
        let started = Instant::now();
        let result = self.run_sandbox(request.into_inner()).await;
        self.ctx.respond("RunPodSandbox", started, result)
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<cri::StopPodSandboxRequest>,
    ) -> std::result::Result<Response<cri::StopPodSandboxResponse>, Status> {
        let started = Instant::now();
        let result = self.stop_sandbox(request.into_inner()).await;
        self.ctx.respond("StopPodSandbox", started, result)
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<cri::RemovePodSandboxRequest>,
    ) -> std::result::Result<Response<cri::RemovePodSandboxResponse>, Status> {
        let started = Instant::now();
        let result = self.remove_sandbox(request.into_inner()).await;
        self.ctx.respond("RemovePodSandbox", started, result)
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<cri::PodSandboxStatusRequest>,
    ) -> std::result::Result<Response<cri::PodSandboxStatusResponse>, Status> {
        let started = Instant::now();
        let result = self.sandbox_status(request.into_inner()).await;
        self.ctx.respond("PodSandboxStatus", started, result)
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<cri::ListPodSandboxRequest>,
    ) -> std::result::Result<Response<cri::ListPodSandboxResponse>, Status> {
        let started = Instant::now();
        let result = self.list_sandboxes(request.into_inner()).await;
        self.ctx.respond("ListPodSandbox", started, result)
    }

    async fn create_container(
        &self,
        request: Request<cri::CreateContainerRequest>,
    ) -> std::result::Result<Response<cri::CreateContainerResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::create_container(self, request.into_inner()).await;
        self.ctx.respond("CreateContainer", started, result)
    }

    async fn start_container(
        &self,
        request: Request<cri::StartContainerRequest>,
    ) -> std::result::Result<Response<cri::StartContainerResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::start_container(self, request.into_inner()).await;
        self.ctx.respond("StartContainer", started, result)
    }

    async fn stop_container(
        &self,
        request: Request<cri::StopContainerRequest>,
    ) -> std::result::Result<Response<cri::StopContainerResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::stop_container(self, request.into_inner()).await;
        self.ctx.respond("StopContainer", started, result)
    }

    async fn remove_container(
        &self,
        request: Request<cri::RemoveContainerRequest>,
    ) -> std::result::Result<Response<cri::RemoveContainerResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::remove_container(self, request.into_inner()).await;
        self.ctx.respond("RemoveContainer", started, result)
    }

    async fn list_containers(
        &self,
        request: Request<cri::ListContainersRequest>,
    ) -> std::result::Result<Response<cri::ListContainersResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::list_containers(self, request.into_inner()).await;
        self.ctx.respond("ListContainers", started, result)
    }

    async fn container_status(
        &self,
        request: Request<cri::ContainerStatusRequest>,
    ) -> std::result::Result<Response<cri::ContainerStatusResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::container_status(self, request.into_inner()).await;
        self.ctx.respond("ContainerStatus", started, result)
    }

    async fn update_container_resources(
        &self,
        request: Request<cri::UpdateContainerResourcesRequest>,
    ) -> std::result::Result<Response<cri::UpdateContainerResourcesResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let result = Err(CriError::Unimplemented(format!(
            "UpdateContainerResources {}: not supported",
            req.container_id
        )));
        self.ctx.respond("UpdateContainerResources", started, result)
    }

    async fn reopen_container_log(
        &self,
        request: Request<cri::ReopenContainerLogRequest>,
    ) -> std::result::Result<Response<cri::ReopenContainerLogResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let result = Err(CriError::Unimplemented(format!(
            "ReopenContainerLog {}: not supported",
            req.container_id
        )));
        self.ctx.respond("ReopenContainerLog", started, result)
    }

    async fn exec_sync(
        &self,
        request: Request<cri::ExecSyncRequest>,
    ) -> std::result::Result<Response<cri::ExecSyncResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::exec_sync(self, request.into_inner()).await;
        self.ctx.respond("ExecSync", started, result)
    }

    async fn exec(
        &self,
        request: Request<cri::ExecRequest>,
    ) -> std::result::Result<Response<cri::ExecResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::exec(self, request.into_inner()).await;
        self.ctx.respond("Exec", started, result)
    }

    async fn attach(
        &self,
        request: Request<cri::AttachRequest>,
    ) -> std::result::Result<Response<cri::AttachResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::attach(self, request.into_inner()).await;
        self.ctx.respond("Attach", started, result)
    }

    async fn port_forward(
        &self,
        request: Request<cri::PortForwardRequest>,
    ) -> std::result::Result<Response<cri::PortForwardResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::port_forward(self, request.into_inner()).await;
        self.ctx.respond("PortForward", started, result)
    }

    async fn update_runtime_config(
        &self,
        request: Request<cri::UpdateRuntimeConfigRequest>,
    ) -> std::result::Result<Response<cri::UpdateRuntimeConfigResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::update_runtime_config(self, request.into_inner());
        self.ctx.respond("UpdateRuntimeConfig", started, result)
    }

    async fn status(
        &self,
        request: Request<cri::StatusRequest>,
    ) -> std::result::Result<Response<cri::StatusResponse>, Status> {
        let started = Instant::now();
        let result = KilnRuntimeService::status(self, request.into_inner());
        self.ctx.respond("Status", started, result)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(0)
}

fn uses_host_network(config: &cri::PodSandboxConfig) -> bool {
    config
        .linux
        .as_ref()
        .and_then(|l| l.security_context.as_ref())
        .and_then(|s| s.namespace_options.as_ref())
        .is_some_and(|n| n.network == cri::NamespaceMode::Node as i32)
}

fn pod_network(record: &SandboxRecord) -> PodNetwork {
    PodNetwork {
        sandbox_id: record.id.clone(),
        name: record.name.clone(),
        namespace: record.namespace.clone(),
        uid: record.uid.clone(),
    }
}

fn sandbox_state(state: SandboxState) -> cri::PodSandboxState {
    match state {
        SandboxState::Ready => cri::PodSandboxState::SandboxReady,
        SandboxState::NotReady | SandboxState::Removed => cri::PodSandboxState::SandboxNotready,
    }
}

fn container_state(state: &ContainerState) -> cri::ContainerState {
    match state {
        ContainerState::Created => cri::ContainerState::ContainerCreated,
        ContainerState::Running => cri::ContainerState::ContainerRunning,
        ContainerState::Stopped { .. } => cri::ContainerState::ContainerExited,
        ContainerState::Removed => cri::ContainerState::ContainerUnknown,
    }
}

fn sandbox_metadata(record: &SandboxRecord) -> cri::PodSandboxMetadata {
    cri::PodSandboxMetadata {
        name: record.name.clone(),
        uid: record.uid.clone(),
        namespace: record.namespace.clone(),
        attempt: record.attempt,
    }
}

fn container_metadata(record: &ContainerRecord) -> cri::ContainerMetadata {
    cri::ContainerMetadata {
        name: record.name.clone(),
        attempt: record.attempt,
    }
}

fn image_spec(image: &str) -> cri::ImageSpec {
    cri::ImageSpec {
        image: image.to_string(),
        annotations: HashMap::new(),
    }
}

fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Process arguments as kubelet defines them: `command` replaces the image
/// entrypoint, `args` replaces the image cmd.
fn merge_args(command: &[String], args: &[String], image: &OciImageConfig) -> Vec<String> {
    let entrypoint = if command.is_empty() {
        image.entrypoint.clone().unwrap_or_default()
    } else {
        command.to_vec()
    };
    let args = if args.is_empty() && command.is_empty() {
        image.cmd.clone().unwrap_or_default()
    } else {
        args.to_vec()
    };
    entrypoint.into_iter().chain(args).collect()
}

/// Image environment overlaid with the container's.
fn merge_env(image_env: &[String], envs: &[cri::KeyValue]) -> Vec<String> {
    let mut merged: Vec<String> = image_env
        .iter()
        .filter(|e| {
            let key = e.split('=').next().unwrap_or_default();
            !envs.iter().any(|kv| kv.key == key)
        })
        .cloned()
        .collect();
    merged.extend(envs.iter().map(|kv| format!("{}={}", kv.key, kv.value)));
    merged
}

/// uid/gid from the security context, else a numeric image user.
fn resolve_user(
    security: Option<&cri::LinuxContainerSecurityContext>,
    image: &OciImageConfig,
) -> Option<(u32, u32)> {
    let uid = security
        .and_then(|s| s.run_as_user.as_ref())
        .and_then(|v| u32::try_from(v.value).ok());
    match uid {
        Some(uid) => {
            let gid = security
                .and_then(|s| s.run_as_group.as_ref())
                .and_then(|v| u32::try_from(v.value).ok())
                .unwrap_or(uid);
            Some((uid, gid))
        }
        None => image.numeric_user(),
    }
}

fn log_path(sandbox: &SandboxRecord, config: &cri::ContainerConfig, bundle: &Path) -> PathBuf {
    if config.log_path.is_empty() {
        return bundle.join("container.log");
    }
    let path = Path::new(&config.log_path);
    if path.is_absolute() || sandbox.log_directory.is_empty() {
        path.to_path_buf()
    } else {
        Path::new(&sandbox.log_directory).join(path)
    }
}

fn container_spec(
    id: &str,
    sandbox: &SandboxRecord,
    config: &cri::ContainerConfig,
    image: &OciImageConfig,
    bundle: PathBuf,
    rootfs: PathBuf,
) -> Result<ContainerSpec> {
    let args = merge_args(&config.command, &config.args, image);
    if args.is_empty() {
        return Err(CriError::invalid(format!(
            "container {}: no command specified and image has none",
            id
        )));
    }
    let security = config.linux.as_ref().and_then(|l| l.security_context.as_ref());
    let working_dir = if config.working_dir.is_empty() {
        image.working_dir.clone().filter(|w| !w.is_empty())
    } else {
        Some(config.working_dir.clone())
    };
    Ok(ContainerSpec {
        id: id.to_string(),
        sandbox_id: sandbox.id.clone(),
        log_path: log_path(sandbox, config, &bundle),
        bundle,
        rootfs,
        args,
        env: merge_env(&image.env, &config.envs),
        working_dir,
        mounts: config
            .mounts
            .iter()
            .map(|m| MountSpec {
                container_path: PathBuf::from(&m.container_path),
                host_path: PathBuf::from(&m.host_path),
                readonly: m.readonly,
            })
            .collect(),
        annotations: config.annotations.clone(),
        netns: sandbox.netns.as_ref().map(|n| n.path.clone()),
        hostname: Some(sandbox.hostname.clone()),
        tty: config.tty,
        readonly_rootfs: security.is_some_and(|s| s.readonly_rootfs),
        user: resolve_user(security, image),
    })
}

async fn remove_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::sandbox_record;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn image() -> OciImageConfig {
        OciImageConfig {
            entrypoint: Some(strings(&["/entry"])),
            cmd: Some(strings(&["serve", "--port=80"])),
            env: strings(&["PATH=/bin", "MODE=prod"]),
            working_dir: Some("/srv".into()),
            user: Some("1000:1000".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_args() {
        let image = image();
        assert_eq!(merge_args(&[], &[], &image), strings(&["/entry", "serve", "--port=80"]));
        assert_eq!(
            merge_args(&[], &strings(&["debug"]), &image),
            strings(&["/entry", "debug"])
        );
        // A command drops both entrypoint and the image cmd.
        assert_eq!(
            merge_args(&strings(&["sleep"]), &[], &image),
            strings(&["sleep"])
        );
        assert_eq!(
            merge_args(&strings(&["sleep"]), &strings(&["5"]), &image),
            strings(&["sleep", "5"])
        );
        assert!(merge_args(&[], &[], &OciImageConfig::default()).is_empty());
    }

    #[test]
    fn test_merge_env_overrides_image() {
        let envs = vec![cri::KeyValue {
            key: "MODE".into(),
            value: "dev".into(),
        }];
        assert_eq!(merge_env(&image().env, &envs), strings(&["PATH=/bin", "MODE=dev"]));
    }

    #[test]
    fn test_resolve_user() {
        let image = image();
        assert_eq!(resolve_user(None, &image), Some((1000, 1000)));

        let security = cri::LinuxContainerSecurityContext {
            run_as_user: Some(cri::Int64Value { value: 0 }),
            ..Default::default()
        };
        assert_eq!(resolve_user(Some(&security), &image), Some((0, 0)));

        let security = cri::LinuxContainerSecurityContext {
            run_as_user: Some(cri::Int64Value { value: 5 }),
            run_as_group: Some(cri::Int64Value { value: 6 }),
            ..Default::default()
        };
        assert_eq!(resolve_user(Some(&security), &image), Some((5, 6)));
    }

    #[test]
    fn test_log_path() {
        let mut sandbox = sandbox_record("s1", "p1");
        let bundle = Path::new("/run/kiln/bundles/c1");
        let mut config = cri::ContainerConfig::default();
        assert_eq!(log_path(&sandbox, &config, bundle), bundle.join("container.log"));

        config.log_path = "web/0.log".into();
        sandbox.log_directory = "/var/log/pods/ns_p1_uid".into();
        assert_eq!(
            log_path(&sandbox, &config, bundle),
            PathBuf::from("/var/log/pods/ns_p1_uid/web/0.log")
        );
    }

    #[test]
    fn test_container_spec_requires_command() {
        let sandbox = sandbox_record("s1", "p1");
        let config = cri::ContainerConfig::default();
        let err = container_spec(
            "c1",
            &sandbox,
            &config,
            &OciImageConfig::default(),
            PathBuf::from("/b"),
            PathBuf::from("/b/rootfs"),
        )
        .unwrap_err();
        assert!(matches!(err, CriError::InvalidArgument(_)));
    }

    #[test]
    fn test_container_spec_fields() {
        let mut sandbox = sandbox_record("s1", "p1");
        sandbox.netns = Some(kiln_runtime::NetnsHandle {
            name: "kiln-s1".into(),
            path: PathBuf::from("/var/run/netns/kiln-s1"),
        });
        let config = cri::ContainerConfig {
            mounts: vec![cri::Mount {
                container_path: "/data".into(),
                host_path: "/srv/data".into(),
                readonly: true,
                ..Default::default()
            }],
            tty: true,
            ..Default::default()
        };
        let spec = container_spec(
            "c1",
            &sandbox,
            &config,
            &image(),
            PathBuf::from("/b"),
            PathBuf::from("/b/rootfs"),
        )
        .unwrap();
        assert_eq!(spec.working_dir.as_deref(), Some("/srv"));
        assert_eq!(spec.netns, Some(PathBuf::from("/var/run/netns/kiln-s1")));
        assert_eq!(spec.hostname.as_deref(), Some("p1"));
        assert_eq!(spec.mounts.len(), 1);
        assert!(spec.mounts[0].readonly);
        assert!(spec.tty);
        assert_eq!(spec.user, Some((1000, 1000)));
    }

    #[test]
    fn test_labels_match() {
        let labels: HashMap<String, String> =
            [("app".to_string(), "web".to_string())].into_iter().collect();
        assert!(labels_match(&labels, &HashMap::new()));
        assert!(labels_match(&labels, &labels));
        let other: HashMap<String, String> =
            [("app".to_string(), "db".to_string())].into_iter().collect();
        assert!(!labels_match(&labels, &other));
    }

    #[test]
    fn test_host_network_detection() {
        let mut config = cri::PodSandboxConfig::default();
        assert!(!uses_host_network(&config));
        config.linux = Some(cri::LinuxPodSandboxConfig {
            security_context: Some(cri::LinuxSandboxSecurityContext {
                namespace_options: Some(cri::NamespaceOption {
                    network: cri::NamespaceMode::Node as i32,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(uses_host_network(&config));
    }
}
