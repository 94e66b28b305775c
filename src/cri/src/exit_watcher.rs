//! ExitWatcher - turns exit artifacts into Stopped transitions.
//!
//! The daemon is never the parent of a container process. Each container's
//! supervisor writes `<exits_dir>/<id>` when the process ends, and this
//! watcher notices the file, either through a filesystem event or through
//! the periodic poll that covers missed events.
//!
//! The watcher never waits on a container's record lock. An entry that is
//! busy is skipped and looked at again on the next poll, so one slow verb
//! cannot delay exit detection for other containers.
//!
//! An artifact that cannot be parsed, or a supervisor that vanished without
//! writing one, is retried with exponential backoff. After `max_wait` of
//! continuous failure the container is recorded as exited with code -1 and
//! reason `Unknown`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::{ExitArtifact, KilnError, UNKNOWN_EXIT_CODE};
use kiln_runtime::{RuntimeInvoker, OOM_MARKER};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::metrics::CriMetrics;
use crate::registry::{ContainerEntry, ExitReason, Registry};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_FACTOR: f64 = 1.2;

/// Retry state of one container whose exit could not be read yet.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    since: Instant,
    next_attempt: Instant,
    delay: Duration,
}

impl Backoff {
    fn start(now: Instant) -> Self {
        Self {
            since: now,
            next_attempt: now + INITIAL_BACKOFF,
            delay: INITIAL_BACKOFF,
        }
    }

    fn bump(&mut self, now: Instant) {
        self.delay = self.delay.mul_f64(BACKOFF_FACTOR);
        self.next_attempt = now + self.delay;
    }
}

/// Outcome of one look at a container's exit artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCheck {
    /// Not live (or already stopped by someone else)
    Idle,
    /// Still running, busy, or waiting out a backoff
    Pending,
    /// This check recorded the exit
    Recorded,
}

pub struct ExitWatcher {
    registry: Arc<Registry>,
    invoker: Arc<dyn RuntimeInvoker>,
    metrics: Arc<CriMetrics>,
    exits_dir: PathBuf,
    poll_interval: Duration,
    max_wait: Duration,
    failing: Mutex<HashMap<String, Backoff>>,
}

impl ExitWatcher {
    pub fn new(
        registry: Arc<Registry>,
        invoker: Arc<dyn RuntimeInvoker>,
        metrics: Arc<CriMetrics>,
        exits_dir: PathBuf,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            registry,
            invoker,
            metrics,
            exits_dir,
            poll_interval,
            max_wait,
            failing: Mutex::new(HashMap::new()),
        }
    }

    /// Check every live container once.
    pub async fn reconcile(&self) -> usize {
        let mut recorded = 0;
        for entry in self.registry.containers() {
            if self.check(&entry).await == ExitCheck::Recorded {
                recorded += 1;
            }
        }
        if recorded > 0 {
            tracing::info!(recorded, "Reconciled container exits");
        }
        recorded
    }

    /// Watch until `cancel` fires. Runs a reconciliation pass first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.reconcile().await;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        // Held for the lifetime of the loop; dropping it stops the events.
        let _watcher = match watch_exits_dir(&self.exits_dir, tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(
                    dir = %self.exits_dir.display(),
                    error = %e,
                    "Filesystem watch unavailable, polling only"
                );
                None
            }
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(dir = %self.exits_dir.display(), "Exit watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(id) = rx.recv() => {
                    if let Some(entry) = self.registry.container(&id).filter(|e| e.id() == id) {
                        self.check(&entry).await;
                    }
                }
                _ = ticker.tick() => self.poll().await,
            }
        }
        tracing::debug!("Exit watcher stopped");
    }

    async fn poll(&self) {
        for entry in self.registry.containers() {
            self.check(&entry).await;
        }
        // Forget retry state of containers that are gone.
        self.failing
            .lock()
            .retain(|id, _| self.registry.container(id).is_some());
    }

    /// Look at one container's artifact and record its exit if present.
    pub async fn check(&self, entry: &ContainerEntry) -> ExitCheck {
        let (exit_file, supervisor_pid) = {
            let Some(record) = entry.try_lock() else {
                return ExitCheck::Pending;
            };
            if !record.is_live() {
                return ExitCheck::Idle;
            }
            (record.exit_file.clone(), record.supervisor_pid)
        };

        let now = Instant::now();
        if let Some(backoff) = self.failing.lock().get(entry.id()) {
            if now < backoff.next_attempt {
                return ExitCheck::Pending;
            }
        }

        match read_artifact(exit_file).await {
            Ok(Some(artifact)) => {
                self.failing.lock().remove(entry.id());
                if self.record(entry, artifact).await {
                    ExitCheck::Recorded
                } else {
                    ExitCheck::Idle
                }
            }
            Ok(None) => {
                let alive = supervisor_pid.is_some_and(|pid| self.invoker.is_alive(pid));
                if alive {
                    self.failing.lock().remove(entry.id());
                    return ExitCheck::Pending;
                }
                self.escalate(entry, now, "supervisor exited without an exit file")
                    .await
            }
            Err(e) => {
                let reason = e.to_string();
                self.escalate(entry, now, &reason).await
            }
        }
    }

    /// Record an observed exit. Returns `true` if this call made the
    /// transition.
    pub async fn record(&self, entry: &ContainerEntry, artifact: ExitArtifact) -> bool {
        let bundle = entry.lock().await.bundle.clone();
        let oom = oom_marked(&bundle);
        let reason = ExitReason::from_exit(artifact.exit_code, oom);
        let recorded = self
            .registry
            .finish_container(entry, artifact.exit_code, artifact.finished_at, reason)
            .await;
        if recorded {
            self.metrics.exit_observed();
        }
        recorded
    }

    async fn escalate(&self, entry: &ContainerEntry, now: Instant, reason: &str) -> ExitCheck {
        let give_up = {
            let mut failing = self.failing.lock();
            match failing.get_mut(entry.id()) {
                None => {
                    tracing::warn!(container_id = %entry.id(), reason, "Container exit not readable yet");
                    failing.insert(entry.id().to_string(), Backoff::start(now));
                    false
                }
                Some(backoff) if now.duration_since(backoff.since) >= self.max_wait => {
                    failing.remove(entry.id());
                    true
                }
                Some(backoff) => {
                    tracing::debug!(container_id = %entry.id(), reason, "Retrying container exit");
                    backoff.bump(now);
                    false
                }
            }
        };
        if !give_up {
            return ExitCheck::Pending;
        }

        tracing::warn!(
            container_id = %entry.id(),
            reason,
            "Giving up on container exit status, recording unknown exit"
        );
        let recorded = self
            .registry
            .finish_container(entry, UNKNOWN_EXIT_CODE, chrono::Utc::now(), ExitReason::Unknown)
            .await;
        if recorded {
            self.metrics.exit_observed();
            self.metrics.unknown_exit();
            ExitCheck::Recorded
        } else {
            ExitCheck::Idle
        }
    }
}

/// Read an exit artifact off the async workers.
pub(crate) async fn read_artifact(path: PathBuf) -> kiln_core::Result<Option<ExitArtifact>> {
    tokio::task::spawn_blocking(move || ExitArtifact::read(&path))
        .await
        .map_err(|e| KilnError::Other(format!("exit artifact read: {}", e)))?
}

fn oom_marked(bundle: &Path) -> bool {
    bundle.join(OOM_MARKER).exists()
}

/// Forward the ids of artifacts appearing in `dir`. Temporary files written
/// before the rename are ignored.
fn watch_exits_dir(dir: &Path, tx: mpsc::Sender<String>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in &event.paths {
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            if let Some(id) = path.file_name().and_then(|n| n.to_str()) {
                // A full channel is harmless; the next poll picks the exit up.
                let _ = tx.try_send(id.to_string());
            }
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeInvoker;
    use crate::registry::tests::{container_record, sandbox_record};
    use crate::registry::ContainerState;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        exits: PathBuf,
        bundles: PathBuf,
        registry: Arc<Registry>,
        invoker: Arc<FakeInvoker>,
        metrics: Arc<CriMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let exits = tmp.path().join("exits");
            let bundles = tmp.path().join("bundles");
            std::fs::create_dir_all(&exits).unwrap();
            std::fs::create_dir_all(&bundles).unwrap();
            let invoker = Arc::new(FakeInvoker::new(&exits));
            Self {
                _tmp: tmp,
                exits,
                bundles,
                registry: Arc::new(Registry::new()),
                invoker,
                metrics: Arc::new(CriMetrics::new().unwrap()),
            }
        }

        fn watcher(&self, max_wait: Duration) -> Arc<ExitWatcher> {
            Arc::new(ExitWatcher::new(
                self.registry.clone(),
                self.invoker.clone(),
                self.metrics.clone(),
                self.exits.clone(),
                Duration::from_millis(50),
                max_wait,
            ))
        }

        async fn running(&self, id: &str, supervisor_pid: u32) -> ContainerEntry {
            self.insert(id, supervisor_pid, ContainerState::Running).await
        }

        async fn insert(&self, id: &str, supervisor_pid: u32, state: ContainerState) -> ContainerEntry {
            let sandbox = sandbox_record("s1", "p1");
            let mut record = container_record(id, &sandbox, id);
            record.state = state;
            record.supervisor_pid = Some(supervisor_pid);
            record.exit_file = self.exits.join(id);
            record.bundle = self.bundles.join(id);
            std::fs::create_dir_all(&record.bundle).unwrap();
            self.invoker.set_alive(supervisor_pid, true);
            self.registry.insert_container(record).await.unwrap()
        }
    }

    async fn stopped(entry: &ContainerEntry) -> Option<(i32, ExitReason)> {
        match entry.lock().await.state {
            ContainerState::Stopped {
                exit_code, reason, ..
            } => Some((exit_code, reason)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_check_records_artifact() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let entry = fx.running("c1", 100).await;

        assert_eq!(watcher.check(&entry).await, ExitCheck::Pending);
        ExitArtifact::now(3).write(&fx.exits.join("c1")).unwrap();
        assert_eq!(watcher.check(&entry).await, ExitCheck::Recorded);
        assert_eq!(stopped(&entry).await, Some((3, ExitReason::Error)));
        // A second look changes nothing.
        assert_eq!(watcher.check(&entry).await, ExitCheck::Idle);
    }

    #[tokio::test]
    async fn test_oom_marker_sets_reason() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let entry = fx.running("c1", 100).await;
        std::fs::write(fx.bundles.join("c1").join(OOM_MARKER), b"").unwrap();
        ExitArtifact::now(137).write(&fx.exits.join("c1")).unwrap();

        watcher.check(&entry).await;
        assert_eq!(stopped(&entry).await, Some((137, ExitReason::OOMKilled)));
    }

    #[tokio::test]
    async fn test_reconcile_picks_up_existing_artifacts() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let done = fx.running("c1", 100).await;
        let live = fx.running("c2", 101).await;
        std::fs::write(fx.exits.join("c1"), b"0").unwrap();

        assert_eq!(watcher.reconcile().await, 1);
        assert_eq!(stopped(&done).await, Some((0, ExitReason::Completed)));
        assert!(live.lock().await.is_running());
    }

    #[tokio::test]
    async fn test_corrupt_artifact_escalates_to_unknown() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::ZERO);
        let entry = fx.running("c1", 100).await;
        std::fs::write(fx.exits.join("c1"), b"not a number").unwrap();

        // First failure starts the backoff.
        assert_eq!(watcher.check(&entry).await, ExitCheck::Pending);
        tokio::time::sleep(INITIAL_BACKOFF + Duration::from_millis(50)).await;
        assert_eq!(watcher.check(&entry).await, ExitCheck::Recorded);
        assert_eq!(
            stopped(&entry).await,
            Some((UNKNOWN_EXIT_CODE, ExitReason::Unknown))
        );
        assert!(fx.metrics.render().unwrap().contains("kiln_container_unknown_exits_total 1"));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_waits_for_max_wait() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let entry = fx.running("c1", 100).await;
        std::fs::write(fx.exits.join("c1"), b"").unwrap();

        assert_eq!(watcher.check(&entry).await, ExitCheck::Pending);
        tokio::time::sleep(INITIAL_BACKOFF + Duration::from_millis(50)).await;
        assert_eq!(watcher.check(&entry).await, ExitCheck::Pending);
        assert!(entry.lock().await.is_running());

        // The supervisor finishes writing; the retry picks it up.
        tokio::time::sleep(INITIAL_BACKOFF.mul_f64(BACKOFF_FACTOR) + Duration::from_millis(50)).await;
        std::fs::write(fx.exits.join("c1"), b"0").unwrap();
        assert_eq!(watcher.check(&entry).await, ExitCheck::Recorded);
        assert_eq!(stopped(&entry).await, Some((0, ExitReason::Completed)));
    }

    #[tokio::test]
    async fn test_vanished_supervisor_escalates() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::ZERO);
        let entry = fx.running("c1", 100).await;
        fx.invoker.set_alive(100, false);

        assert_eq!(watcher.check(&entry).await, ExitCheck::Pending);
        tokio::time::sleep(INITIAL_BACKOFF + Duration::from_millis(50)).await;
        assert_eq!(watcher.check(&entry).await, ExitCheck::Recorded);
        assert_eq!(
            stopped(&entry).await,
            Some((UNKNOWN_EXIT_CODE, ExitReason::Unknown))
        );
    }

    #[tokio::test]
    async fn test_run_observes_new_artifact() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let entry = fx.running("c1", 100).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        ExitArtifact::now(0).write(&fx.exits.join("c1")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stopped(&entry).await.is_none() {
            assert!(Instant::now() < deadline, "exit not observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stopped(&entry).await, Some((0, ExitReason::Completed)));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_created_container_exit_is_recorded() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let entry = fx.insert("c1", 100, ContainerState::Created).await;

        assert_eq!(watcher.check(&entry).await, ExitCheck::Pending);
        ExitArtifact::now(137).write(&fx.exits.join("c1")).unwrap();
        assert_eq!(watcher.check(&entry).await, ExitCheck::Recorded);
        assert_eq!(stopped(&entry).await, Some((137, ExitReason::Error)));
    }

    #[tokio::test]
    async fn test_busy_entry_does_not_hold_up_others() {
        let fx = Fixture::new();
        let watcher = fx.watcher(Duration::from_secs(30));
        let busy = fx.running("c1", 100).await;
        let done = fx.running("c2", 101).await;
        ExitArtifact::now(0).write(&fx.exits.join("c1")).unwrap();
        ExitArtifact::now(0).write(&fx.exits.join("c2")).unwrap();

        let held = busy.lock().await;
        tokio::time::timeout(Duration::from_secs(1), watcher.poll())
            .await
            .expect("poll waited on a locked entry");
        drop(held);
        assert_eq!(stopped(&done).await, Some((0, ExitReason::Completed)));
        assert_eq!(stopped(&busy).await, None);

        // Picked up once the entry is free again.
        watcher.poll().await;
        assert_eq!(stopped(&busy).await, Some((0, ExitReason::Completed)));
    }

    #[test]
    fn test_backoff_grows_by_factor() {
        let now = Instant::now();
        let mut backoff = Backoff::start(now);
        assert_eq!(backoff.delay, INITIAL_BACKOFF);
        backoff.bump(now);
        assert!((599..=600).contains(&backoff.delay.as_millis()));
        backoff.bump(now);
        assert!((719..=720).contains(&backoff.delay.as_millis()));
    }
}
