//! Runtime invocation: the narrow interface the daemon uses to drive an OCI
//! runtime, and the implementation that does so through `kiln-shim`.

mod bundle;
mod shim;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::error::Result;
use serde::{Deserialize, Serialize};

pub use bundle::{write_bundle, BundleOptions, OOM_MARKER};
pub use shim::{ShimInvoker, ShimReport};

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container id
    pub id: String,
    /// Owning sandbox id
    pub sandbox_id: String,
    /// Bundle directory; `config.json` and the rootfs live here
    pub bundle: PathBuf,
    /// Root filesystem (already populated)
    pub rootfs: PathBuf,
    /// Process arguments, entrypoint first
    pub args: Vec<String>,
    /// Environment in `KEY=value` form
    pub env: Vec<String>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Bind mounts from the host
    pub mounts: Vec<MountSpec>,
    /// Annotations recorded in the runtime config
    pub annotations: HashMap<String, String>,
    /// Where container stdout/stderr are written, in CRI log format
    pub log_path: PathBuf,
    /// Network namespace to join; `None` shares the host network
    pub netns: Option<PathBuf>,
    /// Hostname inside the container
    pub hostname: Option<String>,
    /// Allocate a terminal
    pub tty: bool,
    /// Mount the rootfs read-only
    pub readonly_rootfs: bool,
    /// uid/gid the process runs as
    pub user: Option<(u32, u32)>,
}

/// A host path mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub container_path: PathBuf,
    pub host_path: PathBuf,
    pub readonly: bool,
}

/// Handle on the detached supervisor of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorHandle {
    /// Supervisor pid
    pub pid: u32,
    /// Container init pid as reported by the runtime
    pub container_pid: u32,
    /// Where the supervisor will write the exit artifact
    pub exit_file: PathBuf,
    /// Bundle directory
    pub bundle: PathBuf,
}

/// Result of a synchronous exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Drives an OCI runtime on behalf of the daemon.
///
/// Implementations never wait for a container's main process; termination is
/// reported out of band through the exit artifact.
#[async_trait]
pub trait RuntimeInvoker: Send + Sync {
    /// Create the container and its supervisor. The process is not started.
    async fn create(&self, spec: &ContainerSpec) -> Result<SupervisorHandle>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Send `signal` to the container's init process, or to every process
    /// in it when `all` is set. Killing an exited container is not an error.
    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()>;

    /// Delete the runtime's record of the container. Idempotent.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Run `cmd` inside a running container and collect its output.
    async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput>;

    /// Whether the process `pid` still exists.
    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }
}

/// Probe a pid with signal 0.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
