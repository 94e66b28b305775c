//! ShimInvoker - drives the OCI runtime through `kiln-shim`.
//!
//! `create` spawns one supervisor per container in its own session. The
//! supervisor runs `<runtime> create`, reports the container pid on its
//! stdout and then outlives the daemon, writing the exit artifact when the
//! container terminates. Every other verb is a plain runtime CLI call.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::config::{CgroupManager, DaemonConfig};
use kiln_core::error::{KilnError, Result};
use kiln_core::ExitArtifact;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::bundle::{write_bundle, BundleOptions};
use super::{ContainerSpec, ExecOutput, RuntimeInvoker, SupervisorHandle};

/// How long `create` waits for the supervisor to report a pid.
const CREATE_TIMEOUT: Duration = Duration::from_secs(240);

/// Name of the supervisor binary.
pub const SHIM_BINARY: &str = "kiln-shim";

/// The single line a supervisor prints on stdout once the runtime's
/// `create` has returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimReport {
    /// Container init pid, or -1 on failure
    pub pid: i32,
    /// Pid of the supervisor itself
    #[serde(default)]
    pub supervisor_pid: Option<u32>,
    /// Failure description when `pid` is -1
    #[serde(default)]
    pub message: Option<String>,
}

/// Runtime invoker backed by `kiln-shim` and an OCI runtime CLI.
pub struct ShimInvoker {
    /// OCI runtime binary
    runtime: PathBuf,
    /// Supervisor binary
    shim_path: PathBuf,
    /// Runtime state directory (`--root`)
    runtime_root: PathBuf,
    exits_dir: PathBuf,
    log_size_max: i64,
    bundle_options: BundleOptions,
}

impl ShimInvoker {
    /// Create an invoker from the daemon configuration.
    ///
    /// Fails when the runtime or supervisor binary cannot be found.
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        if !config.runtime.exists() {
            return Err(KilnError::ConfigError(format!(
                "OCI runtime not found: {}",
                config.runtime.display()
            )));
        }
        let shim_path = match &config.shim {
            Some(path) if path.exists() => path.clone(),
            Some(path) => {
                return Err(KilnError::ConfigError(format!(
                    "Supervisor binary not found: {}",
                    path.display()
                )))
            }
            None => Self::find_shim()?,
        };
        std::fs::create_dir_all(&config.exits_dir)?;

        Ok(Self {
            runtime: config.runtime.clone(),
            shim_path,
            runtime_root: config.run_root.join("runtime"),
            exits_dir: config.exits_dir.clone(),
            log_size_max: config.log_size_max,
            bundle_options: BundleOptions {
                cgroup_manager: config.cgroup_manager,
                pids_limit: config.pids_limit,
            },
        })
    }

    /// Find the supervisor binary.
    ///
    /// Searches in order:
    /// 1. Same directory as current executable
    /// 2. target/debug or target/release (for development)
    /// 3. PATH
    pub fn find_shim() -> Result<PathBuf> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let shim_path = exe_dir.join(SHIM_BINARY);
                if shim_path.exists() {
                    return Ok(shim_path);
                }
            }
        }

        for dir in ["target/debug", "target/release"] {
            let shim_path = PathBuf::from(dir).join(SHIM_BINARY);
            if shim_path.exists() {
                return Ok(shim_path);
            }
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let shim_path = dir.join(SHIM_BINARY);
                if shim_path.exists() {
                    return Ok(shim_path);
                }
            }
        }

        Err(KilnError::ConfigError(format!(
            "Could not find {} binary",
            SHIM_BINARY
        )))
    }

    /// Runtime invocation with the global flags applied.
    fn runtime_command(&self) -> Command {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("--root").arg(&self.runtime_root);
        if self.bundle_options.cgroup_manager == CgroupManager::Systemd {
            cmd.arg("--systemd-cgroup");
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a runtime verb to completion, turning a non-zero exit into an error.
    async fn run(&self, id: &str, args: &[&str]) -> Result<()> {
        let output = self
            .runtime_command()
            .args(args)
            .output()
            .await
            .map_err(|e| {
                KilnError::runtime(id, format!("failed to run {}: {}", self.runtime.display(), e))
            })?;

        if output.status.success() {
            return Ok(());
        }
        Err(KilnError::runtime(
            id,
            format!(
                "{} {} failed ({}): {}",
                self.runtime.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }

    fn exit_file(&self, id: &str) -> PathBuf {
        ExitArtifact::path_for(&self.exits_dir, id)
    }

    fn shim_command(&self, spec: &ContainerSpec) -> Command {
        let mut cmd = Command::new(&self.shim_path);
        cmd.arg("--id")
            .arg(&spec.id)
            .arg("--bundle")
            .arg(&spec.bundle)
            .arg("--runtime")
            .arg(&self.runtime)
            .arg("--runtime-root")
            .arg(&self.runtime_root)
            .arg("--exits-dir")
            .arg(&self.exits_dir)
            .arg("--log-path")
            .arg(&spec.log_path)
            .arg("--log-size-max")
            .arg(self.log_size_max.to_string())
            .arg("--log")
            .arg(spec.bundle.join("shim.log"));
        if self.bundle_options.cgroup_manager == CgroupManager::Systemd {
            cmd.arg("--systemd-cgroup");
        }
        if spec.tty {
            cmd.arg("--terminal");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe and touches no Rust state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd
    }
}

/// Runtime messages that mean the container is already gone.
fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("does not exist") || message.contains("not found")
}

/// Runtime messages that mean there is nothing left to signal.
fn is_not_running(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not running")
        || message.contains("process already finished")
        || message.contains("no such process")
        || is_not_found(&message)
}

/// Parse the supervisor's report line into (container pid, supervisor pid).
pub(crate) fn parse_report(id: &str, line: &str) -> Result<(u32, u32)> {
    let report: ShimReport = serde_json::from_str(line.trim()).map_err(|e| {
        KilnError::runtime(id, format!("invalid supervisor report {:?}: {}", line.trim(), e))
    })?;
    if report.pid <= 0 {
        return Err(KilnError::runtime(
            id,
            report
                .message
                .unwrap_or_else(|| "container create failed".to_string()),
        ));
    }
    Ok((report.pid as u32, report.supervisor_pid.unwrap_or(0)))
}

#[async_trait]
impl RuntimeInvoker for ShimInvoker {
    async fn create(&self, spec: &ContainerSpec) -> Result<SupervisorHandle> {
        write_bundle(spec, &self.bundle_options)?;
        if let Some(log_dir) = spec.log_path.parent() {
            tokio::fs::create_dir_all(log_dir).await?;
        }

        let exit_file = self.exit_file(&spec.id);
        // A stale artifact from an earlier container with this id would be
        // read as this container's exit.
        match tokio::fs::remove_file(&exit_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            shim = %self.shim_path.display(),
            container_id = %spec.id,
            "Spawning supervisor"
        );

        let mut child = self.shim_command(spec).spawn().map_err(|e| {
            KilnError::runtime(&spec.id, format!("failed to spawn supervisor: {}", e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KilnError::runtime(&spec.id, "supervisor stdout not captured"))?;

        let mut line = String::new();
        let read = tokio::time::timeout(
            CREATE_TIMEOUT,
            BufReader::new(stdout).read_line(&mut line),
        )
        .await;

        let reported = match read {
            Ok(Ok(0)) => Err(KilnError::runtime(
                &spec.id,
                "supervisor exited without reporting a pid",
            )),
            Ok(Ok(_)) => parse_report(&spec.id, &line),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(KilnError::TimeoutError(format!(
                "supervisor for {} did not report within {:?}",
                spec.id, CREATE_TIMEOUT
            ))),
        };

        // The process we spawned forks the long-lived supervisor and exits
        // right away; reap it here.
        if reported.is_err() {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
        let (container_pid, supervisor_pid) = reported?;

        tracing::info!(
            container_id = %spec.id,
            pid = container_pid,
            supervisor_pid,
            "Container created"
        );

        Ok(SupervisorHandle {
            pid: supervisor_pid,
            container_pid,
            exit_file,
            bundle: spec.bundle.clone(),
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        tracing::debug!(container_id = %id, "runtime start");
        self.run(id, &["start", id]).await
    }

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        tracing::debug!(container_id = %id, signal, all, "runtime kill");
        let signal = signal.to_string();
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.push(id);
        args.push(&signal);

        match self.run(id, &args).await {
            Err(KilnError::RuntimeError { message, .. }) if is_not_running(&message) => {
                tracing::debug!(container_id = %id, "kill: container already stopped");
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        tracing::debug!(container_id = %id, "runtime delete");
        match self.run(id, &["delete", "--force", id]).await {
            Err(KilnError::RuntimeError { message, .. }) if is_not_found(&message) => Ok(()),
            other => other,
        }
    }

    async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(KilnError::runtime(id, "exec command must not be empty"));
        }

        let mut command = self.runtime_command();
        command
            .arg("exec")
            .arg(id)
            .args(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            KilnError::runtime(id, format!("failed to run {}: {}", self.runtime.display(), e))
        })?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    KilnError::TimeoutError(format!(
                        "exec in {} timed out after {:?}",
                        id, limit
                    ))
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
