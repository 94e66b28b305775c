//! Exit artifacts.
//!
//! The supervisor writes one file per container, `<exits_dir>/<id>`, once the
//! container's main process has terminated. The daemon never waits on the
//! process itself; it only reads this file. The file is written to a
//! temporary name and renamed into place so readers never see a partial
//! record.
//!
//! Two encodings are accepted:
//! - JSON: `{"exit_code": 0, "finished_at": "2024-01-01T00:00:00Z"}`
//! - bare decimal exit code, with the file's mtime as the finish time.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Exit code recorded when the real one could not be recovered.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Terminal state of a container process as recorded by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitArtifact {
    pub exit_code: i32,
    pub finished_at: DateTime<Utc>,
}

impl ExitArtifact {
    /// An artifact finished now.
    pub fn now(exit_code: i32) -> Self {
        Self {
            exit_code,
            finished_at: Utc::now(),
        }
    }

    /// Location of the artifact for container `id`.
    pub fn path_for(exits_dir: &Path, id: &str) -> PathBuf {
        exits_dir.join(id)
    }

    /// Write the artifact atomically (temporary file, then rename).
    pub fn write(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec(self)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read the artifact at `path`.
    ///
    /// Returns `Ok(None)` while the file does not exist yet, and
    /// `Err(ExitArtifactError)` when it exists but cannot be interpreted.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Self::parse(&bytes, mtime)
            .map(Some)
            .map_err(|message| KilnError::ExitArtifactError {
                path: path.display().to_string(),
                message,
            })
    }

    /// Decode an artifact body; `mtime` is used when the body carries no
    /// timestamp of its own.
    pub fn parse(bytes: &[u8], mtime: DateTime<Utc>) -> std::result::Result<Self, String> {
        let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?.trim();
        if text.is_empty() {
            return Err("empty exit file".to_string());
        }
        if text.starts_with('{') {
            return serde_json::from_str(text).map_err(|e| e.to_string());
        }
        let exit_code = text
            .parse::<i32>()
            .map_err(|e| format!("invalid exit code {:?}: {}", text, e))?;
        Ok(Self {
            exit_code,
            finished_at: mtime,
        })
    }
}
