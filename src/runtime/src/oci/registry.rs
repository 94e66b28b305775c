//! OCI registry client.
//!
//! Uses the `oci-distribution` crate to pull an image into a local OCI image
//! layout (`oci-layout`, `index.json`, `blobs/sha256/...`).

use std::path::Path;

use base64::Engine;
use kiln_core::error::{KilnError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};

use super::reference::ImageReference;

/// Credentials for one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Build from the CRI `AuthConfig` fields.
    ///
    /// Explicit username/password win; otherwise the base64 `auth` field
    /// (`user:password`) is decoded. Anything else is anonymous.
    pub fn from_cri(username: &str, password: &str, auth: &str) -> Result<Self> {
        if !username.is_empty() {
            return Ok(Self::basic(username, password));
        }
        if auth.is_empty() {
            return Ok(Self::anonymous());
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth.trim())
            .map_err(|e| KilnError::Other(format!("invalid auth field: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| KilnError::Other(format!("invalid auth field: {}", e)))?;
        match decoded.split_once(':') {
            Some((user, pass)) => Ok(Self::basic(user, pass)),
            None => Err(KilnError::Other(
                "invalid auth field: expected user:password".to_string(),
            )),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls images from registries into OCI image layouts.
pub struct RegistryPuller {
    client: Client,
}

impl Default for RegistryPuller {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl RegistryPuller {
    /// Create a puller; registries in `insecure` are reached over plain HTTP.
    pub fn new(insecure: &[String]) -> Self {
        let protocol = if insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure.to_vec())
        };
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }

    /// Pull `reference` into `target_dir`, returning the manifest digest.
    pub async fn pull(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        target_dir: &Path,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let registry = reference.registry.as_str();

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth.to_oci_auth())
            .await
            .map_err(|e| classify_error(reference, e))?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        std::fs::write(blobs_dir.join(digest_hex(&manifest_digest)), &manifest_json)?;

        self.pull_content(&oci_ref, &manifest, &blobs_dir, registry)
            .await?;

        std::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_json.len(),
                "annotations": {
                    "org.opencontainers.image.ref.name": reference.full_reference()
                }
            }]
        });
        std::fs::write(
            target_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            "Image pulled"
        );
        Ok(manifest_digest)
    }

    /// Resolve the manifest digest without pulling any blob.
    pub async fn fetch_digest(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let (_manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth.to_oci_auth())
            .await
            .map_err(|e| classify_error(reference, e))?;
        Ok(digest)
    }

    async fn pull_content(
        &self,
        oci_ref: &Reference,
        manifest: &OciImageManifest,
        blobs_dir: &Path,
        registry: &str,
    ) -> Result<()> {
        self.pull_verified(oci_ref, &manifest.config, blobs_dir, registry)
            .await?;
        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            self.pull_verified(oci_ref, layer, blobs_dir, registry)
                .await?;
        }
        Ok(())
    }

    /// Fetch one blob, check it against its descriptor digest and store it.
    async fn pull_verified(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
        registry: &str,
    ) -> Result<()> {
        let target = blobs_dir.join(digest_hex(&descriptor.digest));
        if target.exists() {
            return Ok(());
        }

        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(oci_ref, descriptor, &mut data)
            .await
            .map_err(|e| KilnError::RegistryError {
                registry: registry.to_string(),
                message: format!("failed to pull blob {}: {}", descriptor.digest, e),
            })?;

        verify_digest(&descriptor.digest, &data).map_err(|message| KilnError::RegistryError {
            registry: registry.to_string(),
            message,
        })?;
        std::fs::write(&target, &data)?;
        Ok(())
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };
    ref_str
        .parse::<Reference>()
        .map_err(|e| KilnError::InvalidImageReference(format!("{}: {}", ref_str, e)))
}

/// Map a registry failure onto the error kinds callers distinguish.
pub(crate) fn classify_error(reference: &ImageReference, err: impl std::fmt::Display) -> KilnError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("manifest unknown")
        || lower.contains("name unknown")
        || lower.contains("not found")
        || lower.contains("404")
    {
        KilnError::ImageNotFound(reference.full_reference())
    } else if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("denied")
        || lower.contains("401")
        || lower.contains("403")
    {
        KilnError::RegistryAuthError {
            registry: reference.registry.clone(),
            message,
        }
    } else {
        KilnError::RegistryError {
            registry: reference.registry.clone(),
            message,
        }
    }
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Check `data` against a `sha256:` digest. Other algorithms are accepted
/// unchecked.
fn verify_digest(expected: &str, data: &[u8]) -> std::result::Result<(), String> {
    let Some(expected_hex) = expected.strip_prefix("sha256:") else {
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(data));
    if actual == expected_hex {
        Ok(())
    } else {
        Err(format!(
            "digest mismatch: expected {}, got sha256:{}",
            expected, actual
        ))
    }
}

/// Select the linux image for the host architecture from a multi-arch index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_from_cri_username() {
        let auth = RegistryAuth::from_cri("user", "pass", "").unwrap();
        assert_eq!(auth, RegistryAuth::basic("user", "pass"));
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_auth_from_cri_encoded() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let auth = RegistryAuth::from_cri("", "", &encoded).unwrap();
        assert_eq!(auth, RegistryAuth::basic("alice", "s3cret"));
    }

    #[test]
    fn test_auth_from_cri_anonymous() {
        let auth = RegistryAuth::from_cri("", "", "").unwrap();
        assert!(auth.is_anonymous());
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_auth_from_cri_malformed() {
        assert!(RegistryAuth::from_cri("", "", "!!!").is_err());
        let no_colon = base64::engine::general_purpose::STANDARD.encode("alice");
        assert!(RegistryAuth::from_cri("", "", &no_colon).is_err());
    }

    #[test]
    fn test_to_oci_reference() {
        let r = ImageReference::parse("ghcr.io/org/app:v0.1.0").unwrap();
        assert_eq!(
            to_oci_reference(&r).unwrap().to_string(),
            "ghcr.io/org/app:v0.1.0"
        );
    }

    #[test]
    fn test_classify_error() {
        let r = ImageReference::parse("nginx").unwrap();
        assert!(matches!(
            classify_error(&r, "manifest unknown: manifest unknown"),
            KilnError::ImageNotFound(_)
        ));
        assert!(matches!(
            classify_error(&r, "Not authorized: 401 Unauthorized"),
            KilnError::RegistryAuthError { .. }
        ));
        assert!(matches!(
            classify_error(&r, "connection refused"),
            KilnError::RegistryError { .. }
        ));
    }

    #[test]
    fn test_verify_digest() {
        let data = b"hello";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        assert!(verify_digest(&digest, data).is_ok());
        assert!(verify_digest(&digest, b"other").is_err());
        assert!(verify_digest("sha512:abc", data).is_ok());
    }

    #[test]
    fn test_platform_resolver_ignores_other_os() {
        assert_eq!(linux_platform_resolver(&[]), None);
    }
}
