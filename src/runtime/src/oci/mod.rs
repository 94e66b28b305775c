//! Image storage.
//!
//! ```text
//! <image dir>/
//! ├── index.json               reference → digest index
//! ├── sha256/<digest>/         OCI image layout per manifest digest
//! │   ├── oci-layout
//! │   ├── index.json
//! │   └── blobs/sha256/...
//! └── rootfs/<digest>/         unpacked layers, shared by containers
//! ```

mod image;
mod layers;
mod pull;
pub mod reference;
pub mod registry;
pub mod store;

use std::path::PathBuf;

use async_trait::async_trait;
use kiln_core::error::Result;

pub use image::{OciImage, OciImageConfig};
pub use layers::{copy_tree, extract_layer};
pub use pull::ImageManager;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryPuller};
pub use store::{ImageStore, StoredImage};

/// Usage of the filesystem holding images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsUsage {
    pub mountpoint: PathBuf,
    pub used_bytes: u64,
    pub inodes_used: u64,
}

/// Image storage as seen by the daemon.
///
/// `reference` arguments accept any spelling of a reference (`nginx`,
/// `docker.io/library/nginx:latest`) as well as an image id. Errors are
/// typed: `ImageNotFound` when the image is absent locally or unknown to
/// the registry, `RegistryAuthError` when credentials are rejected,
/// `IoError`/`ImageStoreError` for local storage failures.
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Pull from the registry (cache-first by digest) and store.
    async fn pull(&self, reference: &str, auth: &RegistryAuth) -> Result<StoredImage>;

    /// Look up a stored image.
    async fn get(&self, reference: &str) -> Result<Option<StoredImage>>;

    /// All stored images, one entry per reference.
    async fn list(&self) -> Result<Vec<StoredImage>>;

    /// All references that share `digest`.
    async fn references(&self, digest: &str) -> Result<Vec<String>>;

    /// Remove an image (by id: every reference; by reference: that one).
    async fn remove(&self, reference: &str) -> Result<()>;

    /// Unpacked root filesystem of a stored image.
    async fn resolve_rootfs(&self, reference: &str) -> Result<PathBuf>;

    /// Entrypoint, command, environment and user of a stored image.
    async fn image_config(&self, reference: &str) -> Result<OciImageConfig>;

    /// Disk usage of the store.
    async fn fs_usage(&self) -> Result<FsUsage>;
}
