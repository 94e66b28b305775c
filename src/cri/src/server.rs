//! Daemon coordinator.
//!
//! Binds the CRI socket, splits it between the gRPC services and the HTTP/1
//! info server, starts the streaming server, the optional TCP metrics
//! listener and the exit watcher, and owns the shutdown sequence.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::DaemonConfig;
use kiln_runtime::{ImageStorage, NetworkManager, RuntimeInvoker};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::error::CriError;
use crate::exit_watcher::ExitWatcher;
use crate::image_service::KilnImageService;
use crate::info::{self, InfoState, Routes};
use crate::lifecycle::{Lifecycle, ShutdownHandle};
use crate::metrics::CriMetrics;
use crate::mux::{Mux, MuxHandle};
use crate::registry::Registry;
use crate::runtime_service::{KilnRuntimeService, ServiceContext};
use crate::streaming::StreamingServer;

/// How long aborted handlers get to unwind after the force-cancel fires.
const FORCE_DRAIN: Duration = Duration::from_secs(2);

/// Bound on each HTTP server's own graceful shutdown.
const HTTP_DRAIN: Duration = Duration::from_secs(5);

/// Startup and serving failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {path}: {source}")]
    Bind { path: String, source: io::Error },

    #[error("state: {0}")]
    State(#[from] CriError),

    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("gRPC transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// The collaborators the services drive.
#[derive(Clone)]
pub struct Collaborators {
    pub invoker: Arc<dyn RuntimeInvoker>,
    pub images: Arc<dyn ImageStorage>,
    pub network: Arc<dyn NetworkManager>,
}

/// Builds and starts the daemon.
pub struct Coordinator {
    config: Arc<DaemonConfig>,
    collaborators: Collaborators,
    lifecycle: Arc<Lifecycle>,
}

/// A started daemon.
pub struct Daemon {
    socket: PathBuf,
    streaming_addr: SocketAddr,
    metrics_addr: Option<SocketAddr>,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Daemon {
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn streaming_addr(&self) -> SocketAddr {
        self.streaming_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Wait until the daemon has stopped. Returns the first fatal serving
    /// error, if any.
    pub async fn wait(self) -> Result<(), ServerError> {
        self.task
            .await
            .map_err(|e| ServerError::Io(io::Error::other(e)))?
    }
}

/// Everything the drain sequence has to stop.
struct Running {
    config: Arc<DaemonConfig>,
    registry: Arc<Registry>,
    lifecycle: Arc<Lifecycle>,
    mux: MuxHandle,
    mux_task: JoinHandle<()>,
    rpc_stop: CancellationToken,
    rpc_task: JoinHandle<()>,
    force_cancel: CancellationToken,
    http_stop: CancellationToken,
    http_tasks: Vec<JoinHandle<()>>,
    watcher_stop: CancellationToken,
    watcher_task: JoinHandle<()>,
    fatal: Arc<Mutex<Option<ServerError>>>,
}

impl Coordinator {
    /// The configuration is expected to be validated already.
    pub fn new(config: DaemonConfig, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.lifecycle.handle()
    }

    /// Bring every component up and move to Serving.
    pub async fn start(self) -> Result<Daemon, ServerError> {
        let config = self.config.clone();
        let Collaborators {
            invoker,
            images,
            network,
        } = self.collaborators;

        for dir in [
            config.root.clone(),
            config.run_root.clone(),
            config.exits_dir.clone(),
            config.bundles_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let registry = Arc::new(Registry::open(
            &config.sandboxes_dir(),
            &config.containers_dir(),
        )?);
        let metrics = Arc::new(CriMetrics::new()?);

        let watcher = Arc::new(ExitWatcher::new(
            registry.clone(),
            invoker.clone(),
            metrics.clone(),
            config.exits_dir.clone(),
            config.timeouts.exit_poll_interval(),
            config.timeouts.exit_max_wait(),
        ));
        // Exits that happened while the daemon was down are recorded before
        // the first call is served.
        watcher.reconcile().await;

        let stream_addr = stream_addr(&config)?;
        let streaming = StreamingServer::bind(stream_addr, invoker.clone(), registry.clone())
            .await
            .map_err(|source| ServerError::Bind {
                path: stream_addr.to_string(),
                source,
            })?;
        let streaming_addr = streaming.local_addr();

        let listener = bind_socket(&config.listen)?;
        let (mux, grpc_incoming, http_incoming) =
            Mux::split(listener, config.timeouts.mux_peek_timeout());
        let mux_handle = mux.handle();

        let lifecycle = self.lifecycle;
        let fatal = Arc::new(Mutex::new(None));
        let force_cancel = CancellationToken::new();
        let ctx = ServiceContext {
            config: config.clone(),
            registry: registry.clone(),
            invoker,
            images,
            network,
            watcher: watcher.clone(),
            streaming: streaming.handle(),
            metrics: metrics.clone(),
            cancel: force_cancel.clone(),
        };

        let mux_task = {
            let fatal = fatal.clone();
            let shutdown = lifecycle.handle();
            tokio::spawn(async move {
                if let Err(e) = mux.serve().await {
                    fail(&fatal, &shutdown, e.into());
                }
            })
        };

        let rpc_stop = CancellationToken::new();
        let rpc_task = {
            let limit = config.max_concurrent_calls;
            let router = Server::builder()
                .concurrency_limit_per_connection(limit)
                .layer(GlobalConcurrencyLimitLayer::new(limit))
                .add_service(RuntimeServiceServer::new(KilnRuntimeService::new(ctx.clone())))
                .add_service(ImageServiceServer::new(KilnImageService::new(ctx)));
            let stop = rpc_stop.clone();
            let fatal = fatal.clone();
            let shutdown = lifecycle.handle();
            tokio::spawn(async move {
                let result = router
                    .serve_with_incoming_shutdown(grpc_incoming, stop.cancelled_owned())
                    .await;
                if let Err(e) = result {
                    fail(&fatal, &shutdown, e.into());
                }
            })
        };

        let http_stop = CancellationToken::new();
        let shutdown_endpoint = config
            .enable_shutdown_endpoint
            .then(|| lifecycle.handle());
        let info_state = Arc::new(InfoState {
            config: config.clone(),
            registry: registry.clone(),
            metrics,
            shutdown: shutdown_endpoint,
        });
        let read_timeout = config.timeouts.http_read_timeout();
        let mut http_tasks = vec![tokio::spawn(log_http_exit(
            "info",
            info::serve(
                http_incoming,
                info_state.clone(),
                Routes::Full,
                read_timeout,
                http_stop.clone(),
            ),
        ))];

        let mut metrics_addr = None;
        if config.metrics.enabled {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind {
                    path: addr.to_string(),
                    source,
                })?;
            metrics_addr = Some(listener.local_addr()?);
            tracing::info!(addr = %addr, "Metrics listener started");
            http_tasks.push(tokio::spawn(log_http_exit(
                "metrics",
                info::serve(
                    TcpListenerStream::new(listener),
                    info_state,
                    Routes::MetricsOnly,
                    read_timeout,
                    http_stop.clone(),
                ),
            )));
        }

        {
            let stop = http_stop.clone();
            http_tasks.push(tokio::spawn(async move {
                if let Err(e) = streaming.serve(stop).await {
                    tracing::error!(error = %e, "Streaming server failed");
                }
            }));
        }

        let watcher_stop = CancellationToken::new();
        let watcher_task = tokio::spawn(watcher.run(watcher_stop.clone()));

        lifecycle.begin_serving();
        tracing::info!(
            socket = %config.listen.display(),
            streaming = %streaming_addr,
            "kiln is serving"
        );

        let running = Running {
            config: config.clone(),
            registry,
            lifecycle: lifecycle.clone(),
            mux: mux_handle,
            mux_task,
            rpc_stop,
            rpc_task,
            force_cancel,
            http_stop,
            http_tasks,
            watcher_stop,
            watcher_task,
            fatal,
        };
        let task = tokio::spawn(async move {
            running.lifecycle.requested().await;
            running.drain().await
        });

        Ok(Daemon {
            socket: config.listen.clone(),
            streaming_addr,
            metrics_addr,
            shutdown: lifecycle.handle(),
            task,
        })
    }
}

impl Running {
    async fn drain(self) -> Result<(), ServerError> {
        if !self.lifecycle.begin_draining() {
            return Ok(());
        }
        tracing::info!("Draining");

        // 1. No new connections; in-flight RPCs get the grace period.
        self.rpc_stop.cancel();
        self.mux.close();
        let grace = self.config.timeouts.grace_period();
        let mut rpc_task = self.rpc_task;
        if tokio::time::timeout(grace, &mut rpc_task).await.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "Grace period expired, cancelling in-flight calls");
            self.force_cancel.cancel();
            if tokio::time::timeout(FORCE_DRAIN, &mut rpc_task).await.is_err() {
                rpc_task.abort();
            }
        }
        if let Err(e) = self.mux_task.await {
            tracing::warn!(error = %e, "Multiplexer task failed");
        }

        // 2. HTTP servers.
        self.http_stop.cancel();
        for task in self.http_tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(HTTP_DRAIN, task).await.is_err() {
                abort.abort();
            }
        }

        // 3. Exit watcher.
        self.watcher_stop.cancel();
        if let Err(e) = self.watcher_task.await {
            tracing::warn!(error = %e, "Exit watcher task failed");
        }

        // 4. Final state and the socket.
        persist_all(&self.registry).await;
        if let Err(e) = std::fs::remove_file(&self.config.listen) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.config.listen.display(), error = %e, "Failed to remove socket");
            }
        }

        self.lifecycle.finish();
        tracing::info!("Stopped");
        match self.fatal.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn fail(fatal: &Mutex<Option<ServerError>>, shutdown: &ShutdownHandle, err: ServerError) {
    tracing::error!(error = %err, "Fatal serving error");
    fatal.lock().get_or_insert(err);
    shutdown.request();
}

async fn log_http_exit(name: &'static str, server: impl std::future::Future<Output = hyper::Result<()>>) {
    if let Err(e) = server.await {
        tracing::error!(server = name, error = %e, "HTTP server failed");
    }
}

/// Bind the CRI socket, replacing a stale socket file.
fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.display().to_string(),
        source,
    })
}

fn stream_addr(config: &DaemonConfig) -> Result<SocketAddr, ServerError> {
    let raw = format!("{}:{}", config.stream.address, config.stream.port);
    raw.parse().map_err(|e| {
        ServerError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("stream address {}: {}", raw, e),
        ))
    })
}

async fn persist_all(registry: &Registry) {
    for entry in registry.sandboxes() {
        registry.persist_sandbox(&*entry.lock().await).await;
    }
    for entry in registry.containers() {
        registry.persist_container(&*entry.lock().await).await;
    }
}
