//! Daemon harness for the integration tests: a real coordinator on a
//! temporary socket, driven through the generated tonic clients.

#![allow(dead_code)]

#[path = "../../src/fakes.rs"]
pub mod fakes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Request, StatusCode};
use kiln_core::DaemonConfig;
use kiln_cri::cri_api::image_service_client::ImageServiceClient;
use kiln_cri::cri_api::runtime_service_client::RuntimeServiceClient;
use kiln_cri::cri_api::*;
use kiln_cri::server::{Collaborators, Coordinator, Daemon};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use fakes::{FakeImages, FakeInvoker, FakeNetwork};

pub const IMAGE: &str = "busybox";

pub struct TestDaemon {
    pub tmp: TempDir,
    pub config: DaemonConfig,
    pub invoker: Arc<FakeInvoker>,
    pub images: Arc<FakeImages>,
    pub network: Arc<FakeNetwork>,
    daemon: Option<Daemon>,
}

pub fn test_config(dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.listen = dir.join("kiln.sock");
    config.root = dir.join("lib");
    config.run_root = dir.join("run");
    config.exits_dir = dir.join("exits");
    config.image.dir = dir.join("images");
    config.stream.port = 0;
    config.timeouts.grace_period_secs = 2;
    config.timeouts.exit_poll_interval_ms = 50;
    config.timeouts.exit_max_wait_secs = 2;
    config.enable_shutdown_endpoint = true;
    config
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut DaemonConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        customize(&mut config);
        Self::start_in(tmp, config).await
    }

    /// Start on an existing directory, e.g. to restart over persisted state.
    pub async fn start_in(tmp: TempDir, config: DaemonConfig) -> Self {
        let invoker = Arc::new(FakeInvoker::new(&config.exits_dir));
        let images = Arc::new(FakeImages::new(&tmp.path().join("images")));
        let network = Arc::new(FakeNetwork::new(&tmp.path().join("netns")));
        Self::start_with_fakes(tmp, config, invoker, images, network).await
    }

    pub async fn start_with_fakes(
        tmp: TempDir,
        config: DaemonConfig,
        invoker: Arc<FakeInvoker>,
        images: Arc<FakeImages>,
        network: Arc<FakeNetwork>,
    ) -> Self {
        let collaborators = Collaborators {
            invoker: invoker.clone(),
            images: images.clone(),
            network: network.clone(),
        };
        let daemon = Coordinator::new(config.clone(), collaborators)
            .start()
            .await
            .unwrap();
        Self {
            tmp,
            config,
            invoker,
            images,
            network,
            daemon: Some(daemon),
        }
    }

    pub fn socket(&self) -> PathBuf {
        self.config.listen.clone()
    }

    pub fn daemon(&self) -> &Daemon {
        self.daemon.as_ref().unwrap()
    }

    pub async fn channel(&self) -> Channel {
        connect(&self.socket()).await.unwrap()
    }

    pub async fn runtime(&self) -> RuntimeServiceClient<Channel> {
        RuntimeServiceClient::new(self.channel().await)
    }

    pub async fn image_client(&self) -> ImageServiceClient<Channel> {
        ImageServiceClient::new(self.channel().await)
    }

    pub async fn http(&self, method: &str, path: &str) -> (StatusCode, String) {
        http_request(&self.socket(), method, path).await
    }

    /// Request shutdown and wait for it to finish. Returns the directory so
    /// a test can restart over it.
    pub async fn stop(mut self) -> (TempDir, DaemonConfig) {
        let daemon = self.daemon.take().unwrap();
        daemon.shutdown_handle().request();
        tokio::time::timeout(Duration::from_secs(10), daemon.wait())
            .await
            .expect("daemon did not stop")
            .unwrap();
        (self.tmp, self.config)
    }
}

/// One HTTP/1 request over the CRI socket.
pub async fn http_request(socket: &Path, method: &str, path: &str) -> (StatusCode, String) {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::handshake(stream).await.unwrap();
    tokio::spawn(conn);
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", "kiln")
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8_lossy(&body).to_string())
}

/// A tonic channel over a Unix socket.
pub async fn connect(path: &Path) -> Result<Channel, tonic::transport::Error> {
    let path = path.to_path_buf();
    // The URI is required by the builder and ignored by the connector.
    Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
}

pub fn sandbox_config(name: &str) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: name.to_string(),
            uid: format!("uid-{}", name),
            namespace: "ns1".to_string(),
            attempt: 0,
        }),
        hostname: name.to_string(),
        log_directory: String::new(),
        labels: [("app".to_string(), name.to_string())].into_iter().collect(),
        ..Default::default()
    }
}

pub fn container_config(name: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        }),
        image: Some(ImageSpec {
            image: IMAGE.to_string(),
            annotations: Default::default(),
        }),
        command: vec!["sleep".to_string(), "3600".to_string()],
        ..Default::default()
    }
}

pub async fn pull(daemon: &TestDaemon, image: &str) -> String {
    daemon
        .image_client()
        .await
        .pull_image(PullImageRequest {
            image: Some(ImageSpec {
                image: image.to_string(),
                annotations: Default::default(),
            }),
            auth: None,
            sandbox_config: None,
        })
        .await
        .unwrap()
        .into_inner()
        .image_ref
}

pub async fn run_sandbox(client: &mut RuntimeServiceClient<Channel>, name: &str) -> String {
    client
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config(name)),
            runtime_handler: String::new(),
        })
        .await
        .unwrap()
        .into_inner()
        .pod_sandbox_id
}

pub async fn create_container(
    client: &mut RuntimeServiceClient<Channel>,
    sandbox_id: &str,
    name: &str,
) -> String {
    client
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.to_string(),
            config: Some(container_config(name)),
            sandbox_config: Some(sandbox_config("pod1")),
        })
        .await
        .unwrap()
        .into_inner()
        .container_id
}

pub async fn start_container(client: &mut RuntimeServiceClient<Channel>, id: &str) {
    client
        .start_container(StartContainerRequest {
            container_id: id.to_string(),
        })
        .await
        .unwrap();
}

pub async fn container_status(
    client: &mut RuntimeServiceClient<Channel>,
    id: &str,
) -> Result<ContainerStatus, tonic::Status> {
    client
        .container_status(ContainerStatusRequest {
            container_id: id.to_string(),
            verbose: false,
        })
        .await
        .map(|r| r.into_inner().status.unwrap())
}

/// Poll until the container reports `state` or `timeout` passes.
pub async fn wait_for_state(
    client: &mut RuntimeServiceClient<Channel>,
    id: &str,
    state: ContainerState,
    timeout: Duration,
) -> ContainerStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = container_status(client, id).await.unwrap();
        if status.state == state as i32 {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "container {} stayed in state {}",
            id,
            status.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
