//! Kiln - Kubernetes CRI v1 container runtime daemon.
//!
//! Serves the CRI RuntimeService and ImageService on a Unix socket and runs
//! containers under an OCI runtime (runc, crun) through `kiln-shim`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing_subscriber::EnvFilter;

use kiln_core::{CgroupManager, DaemonConfig, LogFormat, LogLevel};
use kiln_cri::server::{Collaborators, Coordinator};
use kiln_runtime::{CniNetworkManager, ImageManager, ShimInvoker};

/// Kiln CRI runtime
#[derive(Parser, Debug)]
#[command(name = "kiln", about = "Kubernetes CRI v1 container runtime", version)]
struct Args {
    /// Configuration file (default: /etc/kiln/kiln.yaml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket to serve CRI on
    #[arg(long)]
    listen: Option<PathBuf>,

    /// Persistent state directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Volatile state directory
    #[arg(long)]
    runroot: Option<PathBuf>,

    /// OCI runtime binary
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// kiln-shim binary
    #[arg(long)]
    shim: Option<PathBuf>,

    /// Directory supervisors write exit files into
    #[arg(long)]
    exits_dir: Option<PathBuf>,

    /// Cgroup manager (cgroupfs, systemd)
    #[arg(long)]
    cgroup_manager: Option<CgroupManager>,

    /// CNI network configuration directory
    #[arg(long)]
    cni_config_dir: Option<PathBuf>,

    /// CNI plugin directory (repeatable)
    #[arg(long)]
    cni_plugin_dir: Vec<PathBuf>,

    /// Streaming server address
    #[arg(long)]
    stream_address: Option<String>,

    /// Streaming server port
    #[arg(long)]
    stream_port: Option<u16>,

    /// Serve /metrics on a TCP port
    #[arg(long)]
    enable_metrics: bool,

    /// TCP metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Seconds in-flight calls may run after shutdown starts
    #[arg(long)]
    grace_period: Option<u64>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Maximum processes per container (0 = unlimited)
    #[arg(long)]
    pids_limit: Option<i64>,

    /// Maximum container log size in bytes (negative = unlimited)
    #[arg(long, allow_hyphen_values = true)]
    log_size_max: Option<i64>,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(runroot) = &self.runroot {
            config.run_root = runroot.clone();
        }
        if let Some(runtime) = &self.runtime {
            config.runtime = runtime.clone();
        }
        if let Some(shim) = &self.shim {
            config.shim = Some(shim.clone());
        }
        if let Some(exits_dir) = &self.exits_dir {
            config.exits_dir = exits_dir.clone();
        }
        if let Some(manager) = self.cgroup_manager {
            config.cgroup_manager = manager;
        }
        if let Some(dir) = &self.cni_config_dir {
            config.network.cni_config_dir = dir.clone();
        }
        if !self.cni_plugin_dir.is_empty() {
            config.network.cni_plugin_dirs = self.cni_plugin_dir.clone();
        }
        if let Some(address) = &self.stream_address {
            config.stream.address = address.clone();
        }
        if let Some(port) = self.stream_port {
            config.stream.port = port;
        }
        if self.enable_metrics {
            config.metrics.enabled = true;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = port;
        }
        if let Some(grace) = self.grace_period {
            config.timeouts.grace_period_secs = grace;
        }
        if let Some(limit) = self.pids_limit {
            config.pids_limit = limit;
        }
        if let Some(max) = self.log_size_max {
            config.log_size_max = max;
        }
    }
}

fn init_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let level: tracing::Level = args.log_level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (&args.log, args.log_format) {
        (Some(path), LogFormat::Json) => builder
            .json()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(open_log(path)?))
            .init(),
        (Some(path), LogFormat::Text) => builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(open_log(path)?))
            .init(),
        (None, LogFormat::Json) => builder.json().with_writer(std::io::stderr).init(),
        (None, LogFormat::Text) => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// SIGINT and SIGTERM listeners. Once installed the signals no longer
/// terminate the process; they are only observed through [`Self::recv`].
struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolves on the first SIGINT or SIGTERM.
    async fn recv(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => tracing::info!("Received SIGINT"),
            _ = self.terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        listen = %config.listen.display(),
        root = %config.root.display(),
        runtime = %config.runtime.display(),
        cgroup_manager = %config.cgroup_manager,
        "Starting kiln"
    );

    let invoker = ShimInvoker::new(&config)?;
    let images = ImageManager::new(
        &config.image.dir,
        config.image.cache_size,
        &config.image.insecure_registries,
    )?;
    let network = CniNetworkManager::new(&config.network);
    let collaborators = Collaborators {
        invoker: Arc::new(invoker),
        images: Arc::new(images),
        network: Arc::new(network),
    };

    // A signal during recovery or binding still ends in a drain.
    let signals = TerminationSignals::install()?;
    let coordinator = Coordinator::new(config, collaborators);
    let shutdown = coordinator.shutdown_handle();
    tokio::spawn(async move {
        signals.recv().await;
        shutdown.request();
    });

    let daemon = coordinator.start().await?;
    daemon.wait().await?;
    Ok(())
}
