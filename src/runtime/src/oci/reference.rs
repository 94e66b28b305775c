//! Image reference normalisation.
//!
//! CRI clients send short names (`nginx`, `nginx:1.25`, `myuser/app`). The
//! store keys images by the fully qualified form
//! (`docker.io/library/nginx:latest`) so every spelling of the same image
//! lands on the same entry.

use kiln_core::error::{KilnError, Result};

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, optionally with port
    pub registry: String,
    /// Repository path (`library/nginx`)
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (`sha256:...`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalise a reference.
    ///
    /// - `nginx` → `docker.io/library/nginx:latest`
    /// - `localhost:5000/app` → `localhost:5000/app:latest`
    /// - `ghcr.io/org/app@sha256:...` keeps the digest and gets no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KilnError::InvalidImageReference(
                "empty image reference".to_string(),
            ));
        }
        if reference.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase()) {
            return Err(KilnError::InvalidImageReference(format!(
                "'{}' must be lowercase and contain no whitespace",
                reference
            )));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(KilnError::InvalidImageReference(format!(
                        "invalid digest in '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag separator is the last ':' after the last '/'; anything
        // before the first '/' may be a registry port.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(KilnError::InvalidImageReference(format!(
                "empty tag in '{}'",
                reference
            )));
        }

        let (registry, repository) = split_registry(name)?;
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Fully qualified reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// `registry/repository@digest`, the CRI "repo digest" form.
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}/{}@{}", self.registry, self.repository, digest)
    }

    /// Registry key used to look up credentials and the insecure list.
    pub fn registry_host(&self) -> &str {
        &self.registry
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(KilnError::InvalidImageReference(format!(
                    "empty repository in '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return Err(KilnError::InvalidImageReference(
            "empty repository".to_string(),
        ));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

/// `algorithm:hex` with a non-empty hex part.
pub fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty() && !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
