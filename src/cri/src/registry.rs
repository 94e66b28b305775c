//! Registry - the live set of sandboxes and containers.
//!
//! Every record sits behind its own async mutex so operations on different
//! ids never contend; the surrounding maps are sharded (`dashmap`) and only
//! locked for the instant it takes to insert, remove or clone an entry.
//! The record lock is only held to read or update a record. Verbs that call
//! out to the runtime or the network serialize on a second, per-entry
//! operation lock instead, so a slow collaborator never blocks readers or
//! the exit watcher.
//!
//! Names are reserved before a create does any work, so two concurrent
//! creates of the same pod or container collide with `AlreadyExists`.
//!
//! Records are persisted as one JSON file per id and reloaded at startup.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use kiln_runtime::{MountSpec, NetnsHandle};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{CriError, Result};

/// Sandbox lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SandboxState {
    Ready,
    NotReady,
    Removed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::NotReady => "notready",
            Self::Removed => "removed",
        }
    }
}

/// Why a container stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Completed,
    Error,
    OOMKilled,
    /// The exit status could not be recovered
    Unknown,
}

impl ExitReason {
    pub fn from_exit(exit_code: i32, oom: bool) -> Self {
        if oom {
            Self::OOMKilled
        } else if exit_code == 0 {
            Self::Completed
        } else {
            Self::Error
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::OOMKilled => "OOMKilled",
            Self::Unknown => "Unknown",
        }
    }
}

/// Container lifecycle state: `Created → Running → Stopped → Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Stopped {
        exit_code: i32,
        finished_at: DateTime<Utc>,
        reason: ExitReason,
    },
    Removed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped { .. } => "stopped",
            Self::Removed => "removed",
        }
    }
}

/// A pod sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    /// Unique name, `<name>_<namespace>_<uid>_<attempt>`
    pub full_name: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub attempt: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Absent for host-network pods
    pub netns: Option<NetnsHandle>,
    pub ip: Option<String>,
    #[serde(default)]
    pub additional_ips: Vec<String>,
    pub log_directory: String,
    pub runtime_handler: String,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub state: SandboxState,
    /// Containers owned by this sandbox
    #[serde(default)]
    pub containers: BTreeSet<String>,
}

impl SandboxRecord {
    /// Move to `next` unless that would go backwards. Returns whether the
    /// state changed.
    pub fn advance(&mut self, next: SandboxState) -> bool {
        if next <= self.state {
            return false;
        }
        self.state = next;
        true
    }
}

/// A container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub sandbox_id: String,
    /// Unique name, `<name>_<sandbox-name>_<namespace>_<uid>_<attempt>`
    pub full_name: String,
    pub name: String,
    pub attempt: u32,
    /// Image as requested
    pub image: String,
    /// Resolved image id
    pub image_ref: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    pub log_path: PathBuf,
    #[serde(default)]
    pub tty: bool,
    pub supervisor_pid: Option<u32>,
    pub container_pid: Option<u32>,
    pub exit_file: PathBuf,
    pub bundle: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub state: ContainerState,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Created or running: a process exists that has not been reaped.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ContainerState::Created | ContainerState::Running)
    }

    /// Record termination of a created or running container. Returns
    /// `false` (and changes nothing) once it has stopped.
    pub fn finish(&mut self, exit_code: i32, finished_at: DateTime<Utc>, reason: ExitReason) -> bool {
        if !self.is_live() {
            return false;
        }
        self.state = ContainerState::Stopped {
            exit_code,
            finished_at,
            reason,
        };
        true
    }
}

/// Unique sandbox name.
pub fn sandbox_full_name(name: &str, namespace: &str, uid: &str, attempt: u32) -> String {
    format!("{}_{}_{}_{}", name, namespace, uid, attempt)
}

/// Unique container name.
pub fn container_full_name(name: &str, sandbox: &SandboxRecord, attempt: u32) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        name, sandbox.name, sandbox.namespace, sandbox.uid, attempt
    )
}

/// One registry entry: an id, the record behind its lock and the lock that
/// serializes mutating verbs.
#[derive(Debug)]
pub struct Entry<T> {
    id: String,
    record: Mutex<T>,
    op: Mutex<()>,
}

impl<T> Entry<T> {
    fn new(id: String, record: T) -> Arc<Self> {
        Arc::new(Self {
            id,
            record: Mutex::new(record),
            op: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The record. Never hold this across a runtime or network call.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.record.lock().await
    }

    /// The record, or `None` while someone else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.record.try_lock().ok()
    }

    /// Exclusive right to run a mutating verb (start, stop, remove) on this
    /// entry. May be held across collaborator calls.
    pub async fn operation(&self) -> MutexGuard<'_, ()> {
        self.op.lock().await
    }
}

pub type SandboxEntry = Arc<Entry<SandboxRecord>>;
pub type ContainerEntry = Arc<Entry<ContainerRecord>>;

/// JSON files, one per record.
#[derive(Debug, Clone)]
struct RecordStore {
    sandboxes_dir: PathBuf,
    containers_dir: PathBuf,
}

impl RecordStore {
    async fn save<T: Serialize>(dir: &Path, id: &str, record: &T) -> std::io::Result<()> {
        let path = dir.join(format!("{}.json", id));
        let tmp = dir.join(format!("{}.json.tmp", id));
        let body = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn delete(dir: &Path, id: &str) {
        let path = dir.join(format!("{}.json", id));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete record");
            }
        }
    }

    /// Startup-only variant of [`RecordStore::delete`].
    fn discard(dir: &Path, id: &str) {
        let path = dir.join(format!("{}.json", id));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete record");
            }
        }
    }

    /// Every readable record in `dir`; unreadable files are logged and skipped.
    fn load_all<T: DeserializeOwned>(dir: &Path) -> Vec<T> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot read record directory");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record")
                }
            }
        }
        records
    }
}

/// Concurrency-safe map of sandbox and container ids to their records.
#[derive(Debug, Default)]
pub struct Registry {
    sandboxes: DashMap<String, SandboxEntry>,
    containers: DashMap<String, ContainerEntry>,
    /// Reserved names → owning id
    names: DashMap<String, String>,
    store: Option<RecordStore>,
}

impl Registry {
    /// An in-memory registry with no persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a persistent registry, recovering any records already on disk.
    pub fn open(sandboxes_dir: &Path, containers_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(sandboxes_dir).map_err(kiln_core::KilnError::from)?;
        std::fs::create_dir_all(containers_dir).map_err(kiln_core::KilnError::from)?;
        let registry = Self {
            store: Some(RecordStore {
                sandboxes_dir: sandboxes_dir.to_path_buf(),
                containers_dir: containers_dir.to_path_buf(),
            }),
            ..Self::default()
        };
        registry.recover();
        Ok(registry)
    }

    fn recover(&self) {
        let Some(store) = &self.store else { return };

        let mut sandboxes: HashMap<String, SandboxRecord> = HashMap::new();
        for mut record in RecordStore::load_all::<SandboxRecord>(&store.sandboxes_dir) {
            if record.state == SandboxState::Removed {
                RecordStore::discard(&store.sandboxes_dir, &record.id);
                continue;
            }
            // Membership is rebuilt from the container records below.
            record.containers.clear();
            sandboxes.insert(record.id.clone(), record);
        }

        let mut containers = Vec::new();
        for record in RecordStore::load_all::<ContainerRecord>(&store.containers_dir) {
            if record.state == ContainerState::Removed {
                RecordStore::discard(&store.containers_dir, &record.id);
                continue;
            }
            match sandboxes.get_mut(&record.sandbox_id) {
                Some(sandbox) => {
                    sandbox.containers.insert(record.id.clone());
                }
                None => tracing::error!(
                    container_id = %record.id,
                    sandbox_id = %record.sandbox_id,
                    "Recovered container has no sandbox"
                ),
            }
            containers.push(record);
        }

        for (id, record) in sandboxes {
            self.names.insert(record.full_name.clone(), id.clone());
            self.sandboxes.insert(id.clone(), Entry::new(id, record));
        }
        for record in containers {
            let id = record.id.clone();
            self.names.insert(record.full_name.clone(), id.clone());
            self.containers.insert(id.clone(), Entry::new(id, record));
        }

        tracing::info!(
            sandboxes = self.sandboxes.len(),
            containers = self.containers.len(),
            "Recovered registry state"
        );
    }

    /// Reserve `name` for `id`. Fails if another id holds it.
    pub fn reserve_name(&self, name: &str, id: &str) -> Result<()> {
        match self.names.entry(name.to_string()) {
            MapEntry::Occupied(existing) => Err(CriError::AlreadyExists(format!(
                "name {} is reserved for {}",
                name,
                existing.get()
            ))),
            MapEntry::Vacant(slot) => {
                slot.insert(id.to_string());
                Ok(())
            }
        }
    }

    /// Reserve `name` for `id` until the returned guard is dropped or kept.
    pub fn reserve(self: &Arc<Self>, name: &str, id: &str) -> Result<NameReservation> {
        self.reserve_name(name, id)?;
        Ok(NameReservation {
            registry: self.clone(),
            name: name.to_string(),
            id: id.to_string(),
            kept: false,
        })
    }

    /// Insert a new sandbox. Its name must already be reserved.
    pub async fn insert_sandbox(&self, record: SandboxRecord) -> Result<SandboxEntry> {
        let id = record.id.clone();
        let persisted = record.clone();
        let entry = match self.sandboxes.entry(id.clone()) {
            MapEntry::Occupied(_) => {
                return Err(CriError::AlreadyExists(format!("sandbox {} exists", id)))
            }
            MapEntry::Vacant(slot) => slot.insert(Entry::new(id, record)).value().clone(),
        };
        self.persist_sandbox(&persisted).await;
        Ok(entry)
    }

    /// Insert a new container. Its name must already be reserved.
    pub async fn insert_container(&self, record: ContainerRecord) -> Result<ContainerEntry> {
        let id = record.id.clone();
        let persisted = record.clone();
        let entry = match self.containers.entry(id.clone()) {
            MapEntry::Occupied(_) => {
                return Err(CriError::AlreadyExists(format!("container {} exists", id)))
            }
            MapEntry::Vacant(slot) => slot.insert(Entry::new(id, record)).value().clone(),
        };
        self.persist_container(&persisted).await;
        Ok(entry)
    }

    /// Look up a sandbox by id or unique id prefix.
    pub fn sandbox(&self, id: &str) -> Option<SandboxEntry> {
        resolve(&self.sandboxes, id)
    }

    /// Look up a container by id or unique id prefix.
    pub fn container(&self, id: &str) -> Option<ContainerEntry> {
        resolve(&self.containers, id)
    }

    pub fn sandboxes(&self) -> Vec<SandboxEntry> {
        self.sandboxes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn containers(&self) -> Vec<ContainerEntry> {
        self.containers.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn persist_sandbox(&self, record: &SandboxRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = RecordStore::save(&store.sandboxes_dir, &record.id, record).await {
                tracing::warn!(sandbox_id = %record.id, error = %e, "Failed to persist sandbox");
            }
        }
    }

    pub async fn persist_container(&self, record: &ContainerRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = RecordStore::save(&store.containers_dir, &record.id, record).await {
                tracing::warn!(container_id = %record.id, error = %e, "Failed to persist container");
            }
        }
    }

    /// Drop a removed sandbox and free its name.
    pub async fn delete_sandbox(&self, record: &SandboxRecord) {
        debug_assert_eq!(record.state, SandboxState::Removed);
        self.sandboxes.remove(&record.id);
        self.names
            .remove_if(&record.full_name, |_, owner| owner == &record.id);
        if let Some(store) = &self.store {
            RecordStore::delete(&store.sandboxes_dir, &record.id).await;
        }
    }

    /// Drop a removed container and free its name.
    pub async fn delete_container(&self, record: &ContainerRecord) {
        debug_assert_eq!(record.state, ContainerState::Removed);
        self.containers.remove(&record.id);
        self.names
            .remove_if(&record.full_name, |_, owner| owner == &record.id);
        if let Some(store) = &self.store {
            RecordStore::delete(&store.containers_dir, &record.id).await;
        }
    }

    /// Transition a created or running container to Stopped. Returns `true`
    /// only for the call that performed the transition.
    pub async fn finish_container(
        &self,
        entry: &ContainerEntry,
        exit_code: i32,
        finished_at: DateTime<Utc>,
        reason: ExitReason,
    ) -> bool {
        let mut record = entry.lock().await;
        if !record.finish(exit_code, finished_at, reason) {
            return false;
        }
        self.persist_container(&record).await;
        tracing::info!(
            container_id = %record.id,
            exit_code,
            reason = reason.as_str(),
            "Container stopped"
        );
        true
    }
}

/// A name held for a create in progress. Dropping it frees the name, so a
/// create that fails or is abandoned never leaves the name taken.
#[derive(Debug)]
pub struct NameReservation {
    registry: Arc<Registry>,
    name: String,
    id: String,
    kept: bool,
}

impl NameReservation {
    /// The record now owns the name; it is freed by `delete_*` instead.
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        if !self.kept {
            self.registry
                .names
                .remove_if(&self.name, |_, owner| owner == &self.id);
        }
    }
}

/// Exact id first, then a unique prefix.
fn resolve<T>(map: &DashMap<String, Arc<Entry<T>>>, id: &str) -> Option<Arc<Entry<T>>> {
    if id.is_empty() {
        return None;
    }
    if let Some(entry) = map.get(id) {
        return Some(entry.value().clone());
    }
    let mut found = None;
    for entry in map.iter() {
        if entry.key().starts_with(id) {
            if found.is_some() {
                return None;
            }
            found = Some(entry.value().clone());
        }
    }
    found
}
