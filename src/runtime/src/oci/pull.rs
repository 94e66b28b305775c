//! ImageManager - the disk-backed [`ImageStorage`] implementation.
//!
//! Combines the registry puller and the image store: pulls are cache-first
//! by manifest digest, and each image's layers are unpacked once into a
//! shared rootfs cache that containers copy from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use tokio::sync::Mutex;

use super::image::{OciImage, OciImageConfig};
use super::layers::extract_layer;
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller};
use super::store::{dir_size, ImageStore, StoredImage};
use super::{FsUsage, ImageStorage};

/// Disk-backed image storage.
pub struct ImageManager {
    store: ImageStore,
    puller: RegistryPuller,
    rootfs_dir: PathBuf,
    /// Serializes unpacking so two containers of one image unpack it once.
    unpack_lock: Mutex<()>,
}

impl ImageManager {
    /// Open the store under `dir`.
    pub fn new(dir: &Path, max_size_bytes: u64, insecure_registries: &[String]) -> Result<Self> {
        let store = ImageStore::new(dir, max_size_bytes)?;
        let rootfs_dir = dir.join("rootfs");
        std::fs::create_dir_all(&rootfs_dir)?;
        Ok(Self {
            store,
            puller: RegistryPuller::new(insecure_registries),
            rootfs_dir,
            unpack_lock: Mutex::new(()),
        })
    }

    fn tmp_dir(&self) -> PathBuf {
        self.store
            .store_dir()
            .join("tmp")
            .join(kiln_core::generate_id())
    }

    fn rootfs_path(&self, digest: &str) -> PathBuf {
        self.rootfs_dir
            .join(digest.strip_prefix("sha256:").unwrap_or(digest))
    }

    /// Find the stored image for a reference, an image id or a digest.
    async fn lookup(&self, reference: &str) -> Result<Option<StoredImage>> {
        if let Some(digest) = as_digest(reference) {
            return Ok(self.store.get_by_digest(&digest).await);
        }
        let parsed = ImageReference::parse(reference)?;
        if let Some(digest) = &parsed.digest {
            if parsed.tag.is_none() {
                return Ok(self.store.get_by_digest(digest).await);
            }
        }
        Ok(self.store.get(&parsed.full_reference()).await)
    }

    async fn require(&self, reference: &str) -> Result<StoredImage> {
        self.lookup(reference)
            .await?
            .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))
    }
}

/// Interpret `reference` as an image id (`sha256:<hex>` or bare 64 hex).
fn as_digest(reference: &str) -> Option<String> {
    let is_hex64 = |s: &str| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit());
    if let Some(hex) = reference.strip_prefix("sha256:") {
        if is_hex64(hex) {
            return Some(reference.to_string());
        }
    }
    if is_hex64(reference) {
        return Some(format!("sha256:{}", reference));
    }
    None
}

#[async_trait]
impl ImageStorage for ImageManager {
    async fn pull(&self, reference: &str, auth: &RegistryAuth) -> Result<StoredImage> {
        let parsed = ImageReference::parse(reference)?;
        let full_ref = parsed.full_reference();

        let digest = self.puller.fetch_digest(&parsed, auth).await?;
        if let Some(existing) = self.store.get_by_digest(&digest).await {
            tracing::info!(reference = %full_ref, digest = %digest, "Image content already stored");
            return self.store.put(&full_ref, &digest, &existing.path).await;
        }

        let tmp_dir = self.tmp_dir();
        let pulled = self.puller.pull(&parsed, auth, &tmp_dir).await;
        let result = match pulled {
            Ok(digest) => self.store.put(&full_ref, &digest, &tmp_dir).await,
            Err(e) => Err(e),
        };
        if tmp_dir.exists() {
            let _ = std::fs::remove_dir_all(&tmp_dir);
        }
        let stored = result?;

        let evicted = self.store.evict(&[stored.digest.clone()]).await?;
        for reference in &evicted {
            tracing::info!(reference = %reference, "Evicted image");
        }
        Ok(stored)
    }

    async fn get(&self, reference: &str) -> Result<Option<StoredImage>> {
        self.lookup(reference).await
    }

    async fn list(&self) -> Result<Vec<StoredImage>> {
        Ok(self.store.list().await)
    }

    async fn references(&self, digest: &str) -> Result<Vec<String>> {
        Ok(self.store.references_for(digest).await)
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let image = self.require(reference).await?;
        // Removing by id drops every tag; removing by tag drops that tag only.
        let targets = if as_digest(reference).is_some() {
            self.store.references_for(&image.digest).await
        } else {
            vec![image.reference.clone()]
        };
        for target in targets {
            self.store.remove(&target).await?;
        }

        if self.store.get_by_digest(&image.digest).await.is_none() {
            let rootfs = self.rootfs_path(&image.digest);
            if rootfs.exists() {
                tokio::fs::remove_dir_all(&rootfs).await?;
            }
        }
        tracing::info!(reference = %reference, digest = %image.digest, "Image removed");
        Ok(())
    }

    async fn resolve_rootfs(&self, reference: &str) -> Result<PathBuf> {
        let image = self.require(reference).await?;
        let target = self.rootfs_path(&image.digest);

        let _guard = self.unpack_lock.lock().await;
        if target.exists() {
            return Ok(target);
        }

        let layout = image.path.clone();
        let staging = self.rootfs_dir.join(format!(".{}", kiln_core::generate_id()));
        let staged = staging.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let oci_image = OciImage::from_path(&layout)?;
            std::fs::create_dir_all(&staged)?;
            for layer in oci_image.layer_paths() {
                extract_layer(layer, &staged)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| KilnError::ImageStoreError(format!("unpack task failed: {}", e)))??;

        tokio::fs::rename(&staging, &target).await?;
        tracing::info!(digest = %image.digest, rootfs = %target.display(), "Unpacked image");
        Ok(target)
    }

    async fn image_config(&self, reference: &str) -> Result<OciImageConfig> {
        let image = self.require(reference).await?;
        let layout = image.path.clone();
        tokio::task::spawn_blocking(move || OciImage::from_path(&layout).map(|i| i.config().clone()))
            .await
            .map_err(|e| KilnError::ImageStoreError(format!("config task failed: {}", e)))?
    }

    async fn fs_usage(&self) -> Result<FsUsage> {
        let dir = self.store.store_dir().to_path_buf();
        let scanned = dir.clone();
        let (used_bytes, inodes_used) =
            tokio::task::spawn_blocking(move || (dir_size(&scanned), count_inodes(&scanned)))
                .await
                .map_err(|e| KilnError::ImageStoreError(format!("usage task failed: {}", e)))?;
        Ok(FsUsage {
            mountpoint: dir,
            used_bytes,
            inodes_used,
        })
    }
}

fn count_inodes(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            total += 1;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                total += count_inodes(&entry.path());
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::tests::make_layout;
    use tempfile::TempDir;

    fn gz_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Seed the manager's store directly, bypassing the registry.
    async fn seed(manager: &ImageManager, tmp: &Path, reference: &str) -> StoredImage {
        let src = tmp.join(format!("src-{}", kiln_core::generate_id()));
        let digest = make_layout(
            &src,
            &gz_layer(&[("bin/app", b"#!/bin/sh\n")]),
            serde_json::json!({"Cmd": ["/bin/app"], "Env": ["A=1"]}),
        );
        let full = ImageReference::parse(reference).unwrap().full_reference();
        manager.store.put(&full, &digest, &src).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_by_reference_and_id() {
        let tmp = TempDir::new().unwrap();
        let manager = ImageManager::new(&tmp.path().join("images"), u64::MAX, &[]).unwrap();
        let stored = seed(&manager, tmp.path(), "busybox").await;

        let by_ref = manager.get("busybox:latest").await.unwrap().unwrap();
        assert_eq!(by_ref.digest, stored.digest);
        let by_id = manager.get(&stored.digest).await.unwrap().unwrap();
        assert_eq!(by_id.reference, "docker.io/library/busybox:latest");
        let bare = stored.digest.trim_start_matches("sha256:").to_string();
        assert!(manager.get(&bare).await.unwrap().is_some());
        assert!(manager.get("redis").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_rootfs_unpacks_once() {
        let tmp = TempDir::new().unwrap();
        let manager = ImageManager::new(&tmp.path().join("images"), u64::MAX, &[]).unwrap();
        seed(&manager, tmp.path(), "busybox").await;

        let rootfs = manager.resolve_rootfs("busybox").await.unwrap();
        assert!(rootfs.join("bin/app").exists());
        let again = manager.resolve_rootfs("docker.io/library/busybox:latest").await.unwrap();
        assert_eq!(rootfs, again);
    }

    #[tokio::test]
    async fn test_image_config() {
        let tmp = TempDir::new().unwrap();
        let manager = ImageManager::new(&tmp.path().join("images"), u64::MAX, &[]).unwrap();
        seed(&manager, tmp.path(), "busybox").await;

        let config = manager.image_config("busybox").await.unwrap();
        assert_eq!(config.cmd, Some(vec!["/bin/app".to_string()]));
        assert_eq!(config.env, vec!["A=1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_image_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let manager = ImageManager::new(&tmp.path().join("images"), u64::MAX, &[]).unwrap();
        assert!(matches!(
            manager.resolve_rootfs("nginx").await,
            Err(KilnError::ImageNotFound(_))
        ));
        assert!(matches!(
            manager.remove("nginx").await,
            Err(KilnError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_drops_rootfs_with_last_reference() {
        let tmp = TempDir::new().unwrap();
        let manager = ImageManager::new(&tmp.path().join("images"), u64::MAX, &[]).unwrap();
        let stored = seed(&manager, tmp.path(), "busybox").await;
        let rootfs = manager.resolve_rootfs("busybox").await.unwrap();

        manager.remove(&stored.digest).await.unwrap();
        assert!(!rootfs.exists());
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_usage() {
        let tmp = TempDir::new().unwrap();
        let manager = ImageManager::new(&tmp.path().join("images"), u64::MAX, &[]).unwrap();
        seed(&manager, tmp.path(), "busybox").await;
        let usage = manager.fs_usage().await.unwrap();
        assert!(usage.used_bytes > 0);
        assert!(usage.inodes_used > 0);
    }

    #[test]
    fn test_as_digest() {
        let hex = "a".repeat(64);
        assert_eq!(as_digest(&hex), Some(format!("sha256:{}", hex)));
        assert_eq!(as_digest(&format!("sha256:{}", hex)), Some(format!("sha256:{}", hex)));
        assert_eq!(as_digest("nginx"), None);
    }
}
