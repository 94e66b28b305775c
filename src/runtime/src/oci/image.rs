//! Reading a stored OCI image layout: manifest, configuration and layers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};

/// An image layout on disk.
#[derive(Debug)]
pub struct OciImage {
    config: OciImageConfig,
    /// Layer blobs, bottom to top
    layer_paths: Vec<PathBuf>,
}

/// The parts of the image configuration a container inherits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
}

impl OciImage {
    /// Load the layout rooted at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref();
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(KilnError::ImageStoreError(format!(
                    "not an OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }

        let index: ImageIndex = read_json(&root_dir.join("index.json"))?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| {
                KilnError::ImageStoreError(format!(
                    "no manifests in {}/index.json",
                    root_dir.display()
                ))
            })?
            .digest()
            .to_string();

        let manifest: ImageManifest = read_json(&blob_path(root_dir, &manifest_digest))?;
        let configuration: ImageConfiguration =
            read_json(&blob_path(root_dir, &manifest.config().digest().to_string()))?;
        let layer_paths = manifest
            .layers()
            .iter()
            .map(|layer| blob_path(root_dir, &layer.digest().to_string()))
            .collect();

        Ok(Self {
            config: OciImageConfig::from_configuration(&configuration),
            layer_paths,
        })
    }

    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    /// Layer blobs, bottom to top.
    pub fn layer_paths(&self) -> &[PathBuf] {
        &self.layer_paths
    }
}

impl OciImageConfig {
    fn from_configuration(configuration: &ImageConfiguration) -> Self {
        let Some(config) = configuration.config() else {
            return Self::default();
        };
        Self {
            entrypoint: config.entrypoint().clone(),
            cmd: config.cmd().clone(),
            env: config.env().clone().unwrap_or_default(),
            working_dir: config.working_dir().clone(),
            user: config.user().clone().filter(|u| !u.is_empty()),
            labels: config.labels().clone().unwrap_or_default(),
        }
    }

    /// Numeric uid/gid from `user`, when it is given numerically.
    pub fn numeric_user(&self) -> Option<(u32, u32)> {
        let user = self.user.as_deref()?;
        let (uid, gid) = match user.split_once(':') {
            Some((uid, gid)) => (uid, Some(gid)),
            None => (user, None),
        };
        let uid: u32 = uid.parse().ok()?;
        let gid: u32 = match gid {
            Some(gid) => gid.parse().ok()?,
            None => uid,
        };
        Some((uid, gid))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path).map_err(|e| {
        KilnError::ImageStoreError(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&content).map_err(|e| {
        KilnError::ImageStoreError(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// `blobs/<algorithm>/<hex>` for a digest.
fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn write_blob(root: &Path, data: &[u8]) -> (String, usize) {
        let hex = hex::encode(Sha256::digest(data));
        std::fs::write(root.join("blobs/sha256").join(&hex), data).unwrap();
        (format!("sha256:{}", hex), data.len())
    }

    /// Build a minimal single-layer layout in `root`; returns the manifest digest.
    pub(crate) fn make_layout(root: &Path, layer: &[u8], config: serde_json::Value) -> String {
        std::fs::create_dir_all(root.join("blobs/sha256")).unwrap();
        std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

        let image_config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": config,
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        let (config_digest, config_size) =
            write_blob(root, &serde_json::to_vec(&image_config).unwrap());
        let (layer_digest, layer_size) = write_blob(root, layer);

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config_size
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer_digest,
                "size": layer_size
            }]
        });
        let (manifest_digest, manifest_size) =
            write_blob(root, &serde_json::to_vec(&manifest).unwrap());

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_size
            }]
        });
        std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        manifest_digest
    }

    #[test]
    fn test_from_path_reads_config_and_layers() {
        let tmp = TempDir::new().unwrap();
        make_layout(
            tmp.path(),
            b"layer",
            serde_json::json!({
                "Entrypoint": ["/docker-entrypoint.sh"],
                "Cmd": ["nginx", "-g", "daemon off;"],
                "Env": ["PATH=/usr/bin", "NGINX_VERSION=1.25"],
                "WorkingDir": "/srv",
                "User": "101:101",
                "Labels": {"maintainer": "nginx"}
            }),
        );

        let image = OciImage::from_path(tmp.path()).unwrap();
        let config = image.config();
        assert_eq!(config.entrypoint.as_deref(), Some(&["/docker-entrypoint.sh".to_string()][..]));
        assert_eq!(config.cmd.as_ref().unwrap().len(), 3);
        assert!(config.env.contains(&"NGINX_VERSION=1.25".to_string()));
        assert_eq!(config.working_dir.as_deref(), Some("/srv"));
        assert_eq!(config.numeric_user(), Some((101, 101)));
        assert_eq!(config.labels.get("maintainer").map(String::as_str), Some("nginx"));
        assert_eq!(image.layer_paths().len(), 1);
        assert!(image.layer_paths()[0].exists());
    }

    #[test]
    fn test_missing_layout_files() {
        let tmp = TempDir::new().unwrap();
        let err = OciImage::from_path(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));
    }

    #[test]
    fn test_numeric_user() {
        let mut config = OciImageConfig {
            user: Some("1000".to_string()),
            ..Default::default()
        };
        assert_eq!(config.numeric_user(), Some((1000, 1000)));
        config.user = Some("nginx".to_string());
        assert_eq!(config.numeric_user(), None);
        config.user = None;
        assert_eq!(config.numeric_user(), None);
    }

    #[test]
    fn test_blob_path() {
        let root = Path::new("/img");
        assert_eq!(
            blob_path(root, "sha256:abc"),
            PathBuf::from("/img/blobs/sha256/abc")
        );
    }
}
