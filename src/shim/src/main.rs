//! Kiln Shim - per-container supervisor.
//!
//! Spawned by the daemon for every container. The shim forks once so the
//! daemon can reap the launcher immediately; the surviving child becomes a
//! child subreaper, runs `<runtime> create`, reports the container pid on
//! stdout and then stays around as the parent of the container process.
//! When the container exits the shim writes the exit artifact the daemon is
//! watching for.
//!
//! # Usage
//! ```bash
//! kiln-shim --id <id> --bundle <dir> --runtime /usr/bin/runc \
//!     --runtime-root /run/kiln/runtime --exits-dir /run/kiln/exits \
//!     --log-path /var/log/pods/.../0.log
//! ```

mod cgroup;
mod log;

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::Parser;
use kiln_core::error::{KilnError, Result};
use kiln_core::{ExitArtifact, UNKNOWN_EXIT_CODE};
use kiln_runtime::invoker::{ShimReport, OOM_MARKER};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::log::{copy_stream, CriLog};

/// How long output readers may keep draining after the container exited.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Kiln Shim - container supervisor
#[derive(Parser, Debug)]
#[command(name = "kiln-shim")]
#[command(about = "Per-container supervisor process for kiln")]
struct Args {
    /// Container id
    #[arg(long)]
    id: String,

    /// OCI bundle directory
    #[arg(long)]
    bundle: PathBuf,

    /// OCI runtime binary
    #[arg(long)]
    runtime: PathBuf,

    /// Runtime state directory
    #[arg(long)]
    runtime_root: PathBuf,

    /// Directory receiving the exit artifact
    #[arg(long)]
    exits_dir: PathBuf,

    /// CRI log file for the container's output
    #[arg(long)]
    log_path: PathBuf,

    /// Log size limit in bytes (negative for unlimited)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    log_size_max: i64,

    /// Shim diagnostics file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Use the systemd cgroup driver
    #[arg(long)]
    systemd_cgroup: bool,

    /// Allocate a terminal for the container
    #[arg(long)]
    terminal: bool,
}

/// A container created by the runtime and not yet reaped.
struct Started {
    pid: Pid,
    cgroup: Option<PathBuf>,
    readers: Vec<JoinHandle<()>>,
}

fn main() {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    // SAFETY: no other threads exist yet.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => {
            report(&failure(format!("fork failed: {}", e)));
            std::process::exit(1);
        }
    }

    if let Err(e) = run(&args) {
        tracing::error!(container_id = %args.id, error = %e, "Shim failed");
        std::process::exit(1);
    }
}

fn init_logging(path: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = path.and_then(|p| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(p)
            .ok()
    });
    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn run(args: &Args) -> Result<()> {
    let started = match start_container(args) {
        Ok(started) => started,
        Err(e) => {
            report(&failure(e.to_string()));
            return Err(e);
        }
    };

    report(&ShimReport {
        pid: started.pid.as_raw(),
        supervisor_pid: Some(std::process::id()),
        message: None,
    });
    detach_stdout()?;

    tracing::info!(container_id = %args.id, pid = started.pid.as_raw(), "Container created");

    let exit_code = wait_for(started.pid);
    drain(started.readers);

    if exit_code == 128 + Signal::SIGKILL as i32 {
        if let Some(cgroup) = &started.cgroup {
            if cgroup::was_oom_killed(cgroup) {
                tracing::warn!(container_id = %args.id, "Container was OOM killed");
                if let Err(e) = std::fs::write(args.bundle.join(OOM_MARKER), b"") {
                    tracing::warn!(error = %e, "Failed to write OOM marker");
                }
            }
        }
    }

    let artifact = ExitArtifact::now(exit_code);
    artifact.write(&ExitArtifact::path_for(&args.exits_dir, &args.id))?;
    tracing::info!(container_id = %args.id, exit_code, "Container exited");
    Ok(())
}

fn sys(context: &'static str) -> impl Fn(Errno) -> KilnError {
    move |e| KilnError::Other(format!("{}: {}", context, e))
}

fn start_container(args: &Args) -> Result<Started> {
    // Already a session leader when launched by the daemon; only the forked
    // child needs a session of its own.
    let _ = nix::unistd::setsid();
    nix::sys::prctl::set_child_subreaper(true).map_err(sys("prctl(PR_SET_CHILD_SUBREAPER)"))?;

    std::fs::create_dir_all(&args.exits_dir)?;
    if let Some(dir) = args.log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log = Arc::new(Mutex::new(CriLog::open(&args.log_path, args.log_size_max)?));

    let pid_file = args.bundle.join("pidfile");
    let runtime_log = args.bundle.join("runtime.log");
    let _ = std::fs::remove_file(&pid_file);

    let mut cmd = Command::new(&args.runtime);
    cmd.arg("--root").arg(&args.runtime_root);
    if args.systemd_cgroup {
        cmd.arg("--systemd-cgroup");
    }
    cmd.arg("--log")
        .arg(&runtime_log)
        .arg("create")
        .arg("--bundle")
        .arg(&args.bundle)
        .arg("--pid-file")
        .arg(&pid_file)
        .stdin(Stdio::null());

    let mut outputs: Vec<(&'static str, File)> = Vec::new();
    let console = if args.terminal {
        let path = console_socket_path(&args.id);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        cmd.arg("--console-socket")
            .arg(&path)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Some((path, std::thread::spawn(move || receive_console(&listener))))
    } else {
        let (out_r, out_w) = pipe2(OFlag::O_CLOEXEC).map_err(sys("pipe"))?;
        let (err_r, err_w) = pipe2(OFlag::O_CLOEXEC).map_err(sys("pipe"))?;
        cmd.stdout(Stdio::from(out_w)).stderr(Stdio::from(err_w));
        outputs.push(("stdout", File::from(out_r)));
        outputs.push(("stderr", File::from(err_r)));
        None
    };
    cmd.arg(&args.id);

    tracing::debug!(container_id = %args.id, runtime = %args.runtime.display(), "Running runtime create");
    let status = cmd
        .status()
        .map_err(|e| KilnError::runtime(&args.id, format!("failed to run runtime: {}", e)))?;
    // Our copies of the write ends must close or the readers never see EOF.
    drop(cmd);

    if !status.success() {
        let detail = std::fs::read_to_string(&runtime_log)
            .ok()
            .and_then(|body| runtime_error(&body));
        return Err(KilnError::runtime(
            &args.id,
            detail.unwrap_or_else(|| format!("runtime create failed ({})", status)),
        ));
    }

    if let Some((path, accept)) = console {
        let master = accept
            .join()
            .map_err(|_| KilnError::runtime(&args.id, "console receiver panicked"))??;
        let _ = std::fs::remove_file(&path);
        outputs.push(("stdout", File::from(master)));
    }

    let pid = std::fs::read_to_string(&pid_file)?
        .trim()
        .parse::<i32>()
        .map_err(|e| KilnError::runtime(&args.id, format!("invalid pid file: {}", e)))?;
    let cgroup = cgroup::cgroup_of(pid);

    let readers = outputs
        .into_iter()
        .map(|(stream, file)| {
            let log = log.clone();
            std::thread::spawn(move || copy_stream(file, stream, log))
        })
        .collect();

    Ok(Started {
        pid: Pid::from_raw(pid),
        cgroup,
        readers,
    })
}

/// Socket paths are limited to 108 bytes, so the console socket lives in
/// the temp dir rather than the bundle.
fn console_socket_path(id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("kiln-console-{}.sock", kiln_core::short_id(id)))
}

/// Accept the runtime's connection and take the pty master it sends.
fn receive_console(listener: &UnixListener) -> Result<OwnedFd> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
    use std::io::IoSliceMut;
    use std::os::fd::{FromRawFd, RawFd};

    let (stream, _) = listener.accept()?;
    let mut buf = [0u8; 4096];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut space = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::empty(),
    )
    .map_err(sys("recvmsg"))?;

    for cmsg in msg.cmsgs().map_err(sys("recvmsg"))? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // SAFETY: the fd was just received and is owned by nobody else.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(KilnError::Other(
        "runtime sent no console descriptor".to_string(),
    ))
}

/// Last error message from the runtime's JSON log, or its last raw line.
fn runtime_error(log: &str) -> Option<String> {
    let line = log.lines().rev().find(|l| !l.trim().is_empty())?;
    let message = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| line.trim().to_string());
    Some(message)
}

fn failure(message: String) -> ShimReport {
    ShimReport {
        pid: -1,
        supervisor_pid: None,
        message: Some(message),
    }
}

fn report(report: &ShimReport) {
    let line = match serde_json::to_string(report) {
        Ok(line) => line,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode report");
            return;
        }
    };
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
        tracing::warn!(error = %e, "Failed to write report");
    }
}

/// Point stdout at /dev/null so the daemon's read side sees EOF.
fn detach_stdout() -> Result<()> {
    let devnull = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    nix::unistd::dup2(devnull.as_raw_fd(), std::io::stdout().as_raw_fd()).map_err(sys("dup2"))?;
    Ok(())
}

/// Reap children until `pid` terminates and return its exit code.
fn wait_for(pid: Pid) -> i32 {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(p, code)) if p == pid => return code,
            Ok(WaitStatus::Signaled(p, signal, _)) if p == pid => return 128 + signal as i32,
            Ok(status) => {
                tracing::debug!(?status, "Reaped child");
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                // Not reparented to us; the status is lost.
                tracing::warn!(pid = pid.as_raw(), "Container is not our child, polling");
                while kill(pid, None).is_ok() {
                    std::thread::sleep(Duration::from_millis(100));
                }
                return UNKNOWN_EXIT_CODE;
            }
            Err(e) => {
                tracing::error!(error = %e, "waitpid failed");
                return UNKNOWN_EXIT_CODE;
            }
        }
    }
}

/// Give output readers a bounded time to flush what the container wrote.
fn drain(readers: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + LOG_DRAIN_TIMEOUT;
    while Instant::now() < deadline && !readers.iter().all(|r| r.is_finished()) {
        std::thread::sleep(Duration::from_millis(20));
    }
    for reader in readers {
        if reader.is_finished() {
            let _ = reader.join();
        }
    }
}
