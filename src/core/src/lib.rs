//! Kiln Core - foundational types shared by the daemon, the runtime
//! collaborators and the per-container supervisor.

pub mod config;
pub mod error;
pub mod exit;
pub mod id;

// Re-export commonly used types
pub use config::{CgroupManager, DaemonConfig, LogFormat, LogLevel};
pub use error::{KilnError, Result};
pub use exit::{ExitArtifact, UNKNOWN_EXIT_CODE};
pub use id::{generate_id, short_id};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
