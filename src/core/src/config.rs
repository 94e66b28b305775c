//! Daemon configuration.
//!
//! The configuration is loaded once at startup (YAML file, then command-line
//! overrides), validated, and shared read-only as `Arc<DaemonConfig>` with
//! every component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KilnError, Result};

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kiln/kiln.yaml";

/// Minimum non-negative log size; matches the supervisor's read buffer.
pub const MIN_LOG_SIZE_MAX: i64 = 8192;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket the CRI services listen on
    pub listen: PathBuf,

    /// Persistent state (sandbox/container records, images)
    pub root: PathBuf,

    /// Volatile state (bundles, shim pid files)
    pub run_root: PathBuf,

    /// OCI runtime binary (runc, crun, ...)
    pub runtime: PathBuf,

    /// Supervisor binary; searched next to the daemon when unset
    pub shim: Option<PathBuf>,

    /// Directory the supervisors write exit artifacts into
    pub exits_dir: PathBuf,

    /// Cgroup manager passed to the OCI runtime
    pub cgroup_manager: CgroupManager,

    /// Maximum processes per container (0 = unlimited)
    pub pids_limit: i64,

    /// Maximum container log size in bytes (negative = unlimited)
    pub log_size_max: i64,

    /// Image storage
    pub image: ImageConfig,

    /// Pod networking
    pub network: NetworkConfig,

    /// Exec/attach streaming server
    pub stream: StreamConfig,

    /// Optional TCP metrics listener
    pub metrics: MetricsConfig,

    /// Timeouts and polling intervals
    pub timeouts: TimeoutConfig,

    /// Maximum number of RPCs served concurrently
    pub max_concurrent_calls: usize,

    /// Expose `POST /shutdown` on the info listener
    pub enable_shutdown_endpoint: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: PathBuf::from("/var/run/kiln/kiln.sock"),
            root: PathBuf::from("/var/lib/kiln"),
            run_root: PathBuf::from("/var/run/kiln"),
            runtime: PathBuf::from("/usr/bin/runc"),
            shim: None,
            exits_dir: PathBuf::from("/var/run/kiln/exits"),
            cgroup_manager: CgroupManager::Cgroupfs,
            pids_limit: 1024,
            log_size_max: -1,
            image: ImageConfig::default(),
            network: NetworkConfig::default(),
            stream: StreamConfig::default(),
            metrics: MetricsConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_concurrent_calls: 128,
            enable_shutdown_endpoint: false,
        }
    }
}

impl DaemonConfig {
    /// Load a configuration file, layering it over the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: DaemonConfig = serde_yaml::from_str(&raw)?;
        config.expand_home();
        Ok(config)
    }

    /// Load the configuration the way the daemon does at startup.
    ///
    /// An explicitly requested file must exist. The default file is optional:
    /// when absent the built-in defaults are used and a warning is logged.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path).map_err(|e| {
                KilnError::ConfigError(format!("{}: {}", path.display(), e))
            }),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    tracing::warn!(
                        path = DEFAULT_CONFIG_PATH,
                        "default configuration file does not exist"
                    );
                    Ok(Self::default())
                }
            }
        }
    }

    /// Reject configurations that cannot possibly work.
    pub fn validate(&self) -> Result<()> {
        if self.listen.as_os_str().is_empty() {
            return Err(KilnError::ConfigError("listen path must not be empty".into()));
        }
        if self.exits_dir.as_os_str().is_empty() {
            return Err(KilnError::ConfigError("exits_dir must not be empty".into()));
        }
        if self.log_size_max >= 0 && self.log_size_max < MIN_LOG_SIZE_MAX {
            return Err(KilnError::ConfigError(format!(
                "log_size_max should be negative or >= {}",
                MIN_LOG_SIZE_MAX
            )));
        }
        if self.timeouts.grace_period_secs == 0 {
            return Err(KilnError::ConfigError(
                "timeouts.grace_period_secs must be greater than zero".into(),
            ));
        }
        if self.timeouts.exit_poll_interval_ms == 0 {
            return Err(KilnError::ConfigError(
                "timeouts.exit_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(KilnError::ConfigError(
                "metrics.port must be set when metrics are enabled".into(),
            ));
        }
        if self.stream.port == 0 {
            return Err(KilnError::ConfigError("stream.port must not be zero".into()));
        }
        if self.max_concurrent_calls == 0 {
            return Err(KilnError::ConfigError(
                "max_concurrent_calls must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding persisted sandbox records.
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.root.join("sandboxes")
    }

    /// Directory holding persisted container records.
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory holding OCI bundles, one per container.
    pub fn bundles_dir(&self) -> PathBuf {
        self.run_root.join("bundles")
    }

    fn expand_home(&mut self) {
        for path in [
            &mut self.listen,
            &mut self.root,
            &mut self.run_root,
            &mut self.exits_dir,
            &mut self.image.dir,
        ] {
            *path = expand_tilde(path);
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Image storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image store directory
    pub dir: PathBuf,

    /// Maximum store size in bytes before LRU eviction
    pub cache_size: u64,

    /// Registries tried, in order, for unqualified references
    pub registries: Vec<String>,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/kiln/images"),
            cache_size: 10 * 1024 * 1024 * 1024,
            registries: vec!["docker.io".to_string()],
            insecure_registries: vec![],
        }
    }
}

/// Pod network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// CNI network configuration directory
    pub cni_config_dir: PathBuf,

    /// CNI plugin binary directories
    pub cni_plugin_dirs: Vec<PathBuf>,

    /// Directory holding named network namespaces
    pub netns_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cni_config_dir: PathBuf::from("/etc/cni/net.d"),
            cni_plugin_dirs: vec![PathBuf::from("/opt/cni/bin")],
            netns_dir: PathBuf::from("/var/run/netns"),
        }
    }
}

/// Streaming server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub address: String,
    pub port: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 10010,
        }
    }
}

/// Metrics listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Timeouts and polling intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long in-flight RPCs may run once draining starts
    pub grace_period_secs: u64,

    /// Read timeout for the HTTP info server
    pub http_read_timeout_secs: u64,

    /// How long the multiplexer waits for a connection's first bytes
    pub mux_peek_timeout_secs: u64,

    /// Exit watcher polling interval
    pub exit_poll_interval_ms: u64,

    /// How long an unreadable exit artifact is retried before the
    /// container is recorded with an unknown exit code
    pub exit_max_wait_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            http_read_timeout_secs: 5,
            mux_peek_timeout_secs: 5,
            exit_poll_interval_ms: 1000,
            exit_max_wait_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn http_read_timeout(&self) -> Duration {
        Duration::from_secs(self.http_read_timeout_secs)
    }

    pub fn mux_peek_timeout(&self) -> Duration {
        Duration::from_secs(self.mux_peek_timeout_secs)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }

    pub fn exit_max_wait(&self) -> Duration {
        Duration::from_secs(self.exit_max_wait_secs)
    }
}

/// Cgroup manager used by the OCI runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    Cgroupfs,
    Systemd,
}

impl std::fmt::Display for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cgroupfs => write!(f, "cgroupfs"),
            Self::Systemd => write!(f, "systemd"),
        }
    }
}

impl std::str::FromStr for CgroupManager {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cgroupfs" => Ok(Self::Cgroupfs),
            "systemd" => Ok(Self::Systemd),
            _ => Err(format!(
                "unknown cgroup manager: '{}' (supported: cgroupfs, systemd)",
                s
            )),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown log level: '{}'", s)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log-format '{}' (supported: text, json)", s)),
        }
    }
}
