//! Process-wide lifecycle state: `Starting → Serving → Draining → Stopped`.
//!
//! Transitions are compare-and-set on one atomic, so exactly one caller wins
//! the move into `Draining` and runs the shutdown sequence; every other
//! caller of [`ShutdownHandle::shutdown`] just waits for `Stopped`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Starting = 0,
    Serving = 1,
    Draining = 2,
    Stopped = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Serving,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8,
    requested: CancellationToken,
    stopped: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Starting as u8),
            requested: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Starting → Serving`.
    pub fn begin_serving(&self) -> bool {
        self.transition(Phase::Starting, Phase::Serving)
    }

    /// Enter `Draining`. Only the first caller gets `true`.
    pub fn begin_draining(&self) -> bool {
        self.transition(Phase::Serving, Phase::Draining)
            || self.transition(Phase::Starting, Phase::Draining)
    }

    /// Enter the terminal state and release everyone waiting in
    /// [`ShutdownHandle::shutdown`].
    pub fn finish(&self) {
        self.phase.store(Phase::Stopped as u8, Ordering::Release);
        self.requested.cancel();
        self.stopped.cancel();
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.requested.cancelled().await
    }

    pub fn handle(self: &Arc<Self>) -> ShutdownHandle {
        ShutdownHandle {
            lifecycle: self.clone(),
        }
    }
}

/// Requests and awaits shutdown. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownHandle {
    /// Ask for shutdown without waiting for it.
    pub fn request(&self) {
        self.lifecycle.requested.cancel();
    }

    /// Ask for shutdown and wait until the daemon reached `Stopped`.
    /// Idempotent; concurrent callers all return together.
    pub async fn shutdown(&self) {
        self.request();
        self.lifecycle.stopped.cancelled().await
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }
}
