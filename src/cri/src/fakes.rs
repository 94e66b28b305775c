//! In-memory collaborators for tests.
//!
//! Only the public APIs of `kiln_core` and `kiln_runtime` are used here so
//! the integration tests can include this file as well.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::{ExitArtifact, KilnError, Result};
use kiln_runtime::{
    ContainerSpec, ExecOutput, FsUsage, ImageStorage, NetnsHandle, NetworkManager, NetworkStatus,
    OciImageConfig, PodNetwork, RegistryAuth, RuntimeInvoker, StoredImage, SupervisorHandle,
};
use parking_lot::Mutex;

async fn pause(delay: &Mutex<Duration>) {
    let delay = *delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Runtime invoker that simulates supervisors with exit files.
///
/// A signal delivered to a live container makes it exit with `128 + signal`,
/// unless `ignore_sigterm` is set and the signal is SIGTERM.
pub struct FakeInvoker {
    exits_dir: PathBuf,
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    supervisors: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub ignore_sigterm: AtomicBool,
    /// How long `create` takes
    pub create_delay: Mutex<Duration>,
    /// How long `start` takes
    pub start_delay: Mutex<Duration>,
}

impl FakeInvoker {
    pub fn new(exits_dir: &Path) -> Self {
        Self {
            exits_dir: exits_dir.to_path_buf(),
            next_pid: AtomicU32::new(1000),
            alive: Mutex::new(HashSet::new()),
            supervisors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            ignore_sigterm: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            start_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut set = self.alive.lock();
        if alive {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }

    /// Make the container exit on its own with `code`.
    pub fn exit(&self, id: &str, code: i32) {
        let pid = self.supervisors.lock().get(id).copied();
        let _ = ExitArtifact::now(code).write(&ExitArtifact::path_for(&self.exits_dir, id));
        if let Some(pid) = pid {
            self.set_alive(pid, false);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// How many recorded calls start with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl RuntimeInvoker for FakeInvoker {
    async fn create(&self, spec: &ContainerSpec) -> Result<SupervisorHandle> {
        self.log(format!("create {}", spec.id));
        pause(&self.create_delay).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(KilnError::runtime(&spec.id, "create failed"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.supervisors.lock().insert(spec.id.clone(), pid);
        self.set_alive(pid, true);
        Ok(SupervisorHandle {
            pid,
            container_pid: pid + 1,
            exit_file: ExitArtifact::path_for(&self.exits_dir, &spec.id),
            bundle: spec.bundle.clone(),
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.log(format!("start {}", id));
        pause(&self.start_delay).await;
        Ok(())
    }

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        self.log(format!("kill {} {} {}", id, signal, all));
        if signal == 15 && self.ignore_sigterm.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pid = self.supervisors.lock().get(id).copied();
        if let Some(pid) = pid {
            if self.alive.lock().contains(&pid) {
                self.exit(id, 128 + signal);
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.log(format!("delete {}", id));
        Ok(())
    }

    async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        self.log(format!("exec {} {}", id, cmd.join(" ")));
        Ok(ExecOutput {
            stdout: cmd.join(" ").into_bytes(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }
}

/// Image store over a map; every pulled image gets a one-file rootfs.
pub struct FakeImages {
    root: PathBuf,
    images: Mutex<HashMap<String, StoredImage>>,
    pub config: Mutex<OciImageConfig>,
}

impl FakeImages {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            images: Mutex::new(HashMap::new()),
            config: Mutex::new(OciImageConfig {
                cmd: Some(vec!["/bin/sh".to_string()]),
                env: vec!["PATH=/usr/bin:/bin".to_string()],
                ..Default::default()
            }),
        }
    }

    fn normalize(reference: &str) -> String {
        if reference.contains(':') {
            reference.to_string()
        } else {
            format!("{}:latest", reference)
        }
    }

    fn find(&self, reference: &str) -> Option<StoredImage> {
        let images = self.images.lock();
        images
            .get(&Self::normalize(reference))
            .or_else(|| images.values().find(|i| i.digest == reference))
            .cloned()
    }
}

#[async_trait]
impl ImageStorage for FakeImages {
    async fn pull(&self, reference: &str, _auth: &RegistryAuth) -> Result<StoredImage> {
        if reference.starts_with("missing") {
            return Err(KilnError::ImageNotFound(reference.to_string()));
        }
        let reference = Self::normalize(reference);
        let digest = format!("sha256:{:0>64}", reference.len());
        let path = self.root.join(&reference.replace(['/', ':'], "_"));
        std::fs::create_dir_all(path.join("rootfs/bin"))?;
        std::fs::write(path.join("rootfs/bin/sh"), b"#!fake")?;
        let image = StoredImage {
            reference: reference.clone(),
            digest,
            size_bytes: 6,
            pulled_at: Utc::now(),
            last_used: Utc::now(),
            path,
        };
        self.images.lock().insert(reference, image.clone());
        Ok(image)
    }

    async fn get(&self, reference: &str) -> Result<Option<StoredImage>> {
        Ok(self.find(reference))
    }

    async fn list(&self) -> Result<Vec<StoredImage>> {
        Ok(self.images.lock().values().cloned().collect())
    }

    async fn references(&self, digest: &str) -> Result<Vec<String>> {
        Ok(self
            .images
            .lock()
            .values()
            .filter(|i| i.digest == digest)
            .map(|i| i.reference.clone())
            .collect())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let Some(image) = self.find(reference) else {
            return Err(KilnError::ImageNotFound(reference.to_string()));
        };
        self.images.lock().remove(&image.reference);
        Ok(())
    }

    async fn resolve_rootfs(&self, reference: &str) -> Result<PathBuf> {
        self.find(reference)
            .map(|i| i.path.join("rootfs"))
            .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))
    }

    async fn image_config(&self, reference: &str) -> Result<OciImageConfig> {
        if self.find(reference).is_none() {
            return Err(KilnError::ImageNotFound(reference.to_string()));
        }
        Ok(self.config.lock().clone())
    }

    async fn fs_usage(&self) -> Result<FsUsage> {
        let images = self.images.lock();
        Ok(FsUsage {
            mountpoint: self.root.clone(),
            used_bytes: images.values().map(|i| i.size_bytes).sum(),
            inodes_used: images.len() as u64,
        })
    }
}

/// Network manager that hands out sequential IPs.
pub struct FakeNetwork {
    root: PathBuf,
    next_ip: AtomicU32,
    calls: Mutex<Vec<String>>,
    pub ready: AtomicBool,
    pub fail_setup: AtomicBool,
    /// How long `setup` takes
    pub setup_delay: Mutex<Duration>,
    pub pod_cidr: Mutex<Option<String>>,
}

impl FakeNetwork {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            next_ip: AtomicU32::new(2),
            calls: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
            fail_setup: AtomicBool::new(false),
            setup_delay: Mutex::new(Duration::ZERO),
            pod_cidr: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl NetworkManager for FakeNetwork {
    async fn create_namespace(&self, sandbox_id: &str) -> Result<NetnsHandle> {
        self.calls.lock().push(format!("netns add {}", sandbox_id));
        let name = format!("kiln-{}", sandbox_id);
        Ok(NetnsHandle {
            path: self.root.join(&name),
            name,
        })
    }

    async fn remove_namespace(&self, handle: &NetnsHandle) -> Result<()> {
        self.calls.lock().push(format!("netns delete {}", handle.name));
        Ok(())
    }

    async fn setup(&self, pod: &PodNetwork, _netns: &NetnsHandle) -> Result<NetworkStatus> {
        self.calls.lock().push(format!("setup {}", pod.sandbox_id));
        pause(&self.setup_delay).await;
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(KilnError::NetworkError("plugin failed".to_string()));
        }
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        Ok(NetworkStatus {
            ip: Some(format!("10.88.0.{}", n)),
            additional_ips: Vec::new(),
        })
    }

    async fn teardown(&self, pod: &PodNetwork, _netns: &NetnsHandle) -> Result<()> {
        self.calls.lock().push(format!("teardown {}", pod.sandbox_id));
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn set_pod_cidr(&self, cidr: &str) {
        *self.pod_cidr.lock() = Some(cidr.to_string());
    }
}
