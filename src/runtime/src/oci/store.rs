//! Disk-based image store with LRU eviction.
//!
//! Images live as OCI layouts under `sha256/<manifest-digest>/`; several
//! references (tags) may point at the same digest. The in-memory index is
//! mirrored to `index.json` after every change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Metadata for a stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Fully qualified reference (`docker.io/library/nginx:latest`)
    pub reference: String,
    /// Manifest digest (`sha256:...`); doubles as the image id
    pub digest: String,
    /// Bytes on disk
    pub size_bytes: u64,
    pub pulled_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// OCI image layout directory
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store.
pub struct ImageStore {
    store_dir: PathBuf,
    /// reference → image
    index: RwLock<HashMap<String, StoredImage>>,
    max_size_bytes: u64,
}

impl ImageStore {
    /// Open (or create) a store, loading any existing index.
    pub fn new(store_dir: &Path, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            KilnError::ImageStoreError(format!(
                "failed to create image store {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: RwLock::new(index),
            max_size_bytes,
        })
    }

    /// Look an image up by reference, touching its LRU timestamp.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        let updated = {
            let mut index = self.index.write().await;
            let image = index.get_mut(reference)?;
            image.last_used = Utc::now();
            image.clone()
        };
        if let Err(e) = self.save_index().await {
            tracing::warn!(error = %e, "Failed to persist image index");
        }
        Some(updated)
    }

    /// Look an image up by manifest digest (any of its references).
    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        let index = self.index.read().await;
        index.values().find(|img| img.digest == digest).cloned()
    }

    /// All references that point at `digest`.
    pub async fn references_for(&self, digest: &str) -> Vec<String> {
        let index = self.index.read().await;
        let mut refs: Vec<String> = index
            .values()
            .filter(|img| img.digest == digest)
            .map(|img| img.reference.clone())
            .collect();
        refs.sort();
        refs
    }

    /// Directory an image with `digest` lives in.
    pub fn layout_dir(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.store_dir.join("sha256").join(hex)
    }

    /// Record `reference` → `digest`, moving `source_dir` into place when
    /// the digest is not stored yet.
    pub async fn put(&self, reference: &str, digest: &str, source_dir: &Path) -> Result<StoredImage> {
        let target_dir = self.layout_dir(digest);
        if !target_dir.exists() {
            if let Some(parent) = target_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if source_dir != target_dir {
                std::fs::rename(source_dir, &target_dir).map_err(|e| {
                    KilnError::ImageStoreError(format!(
                        "failed to move image into store: {}",
                        e
                    ))
                })?;
            }
        }

        let now = Utc::now();
        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: dir_size(&target_dir),
            pulled_at: now,
            last_used: now,
            path: target_dir,
        };

        self.index
            .write()
            .await
            .insert(reference.to_string(), stored.clone());
        self.save_index().await?;
        Ok(stored)
    }

    /// Remove a reference; the layout is deleted with its last reference.
    ///
    /// Returns the removed record.
    pub async fn remove(&self, reference: &str) -> Result<StoredImage> {
        let (image, digest_still_used) = {
            let mut index = self.index.write().await;
            let image = index
                .remove(reference)
                .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))?;
            let used = index.values().any(|img| img.digest == image.digest);
            (image, used)
        };

        if !digest_still_used && image.path.exists() {
            std::fs::remove_dir_all(&image.path).map_err(|e| {
                KilnError::ImageStoreError(format!(
                    "failed to remove {}: {}",
                    image.path.display(),
                    e
                ))
            })?;
        }

        self.save_index().await?;
        Ok(image)
    }

    /// All stored images, one entry per reference.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        images
    }

    /// Evict least-recently-used references until the store fits its
    /// limit, never touching digests listed in `pinned`.
    pub async fn evict(&self, pinned: &[String]) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        while self.total_size().await > self.max_size_bytes {
            let lru = {
                let index = self.index.read().await;
                index
                    .values()
                    .filter(|img| !pinned.contains(&img.digest))
                    .min_by_key(|img| img.last_used)
                    .map(|img| img.reference.clone())
            };
            match lru {
                Some(reference) => {
                    self.remove(&reference).await?;
                    evicted.push(reference);
                }
                None => break,
            }
        }
        Ok(evicted)
    }

    /// Bytes used by distinct layouts.
    pub async fn total_size(&self) -> u64 {
        let index = self.index.read().await;
        let mut seen = std::collections::HashSet::new();
        index
            .values()
            .filter(|img| seen.insert(img.digest.clone()))
            .map(|img| img.size_bytes)
            .sum()
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    async fn save_index(&self) -> Result<()> {
        let store_index = {
            let index = self.index.read().await;
            StoreIndex {
                images: index.values().cloned().collect(),
            }
        };
        let data = serde_json::to_vec_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");
        let tmp_path = self.store_dir.join("index.json.tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &index_path).await?;
        Ok(())
    }
}

fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
    let index_path = store_dir.join("index.json");
    let data = match std::fs::read(&index_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let store_index: StoreIndex = serde_json::from_slice(&data).map_err(|e| {
        KilnError::ImageStoreError(format!(
            "failed to parse {}: {}",
            index_path.display(),
            e
        ))
    })?;

    Ok(store_index
        .images
        .into_iter()
        // layouts deleted behind our back are dropped from the index
        .filter(|image| image.path.exists())
        .map(|image| (image.reference.clone(), image))
        .collect())
}

/// Total size of a directory tree, not following symlinks.
pub(crate) fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                total += dir_size(&entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}
