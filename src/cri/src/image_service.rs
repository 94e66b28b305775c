//! CRI ImageService implementation.
//!
//! Maps CRI image operations onto an [`ImageStorage`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use kiln_runtime::{ImageStorage, RegistryAuth, StoredImage};
use tonic::{Request, Response, Status};

use crate::cri_api as cri;
use crate::cri_api::image_service_server::ImageService;
use crate::error::{CriError, Result};
use crate::runtime_service::ServiceContext;

/// Kiln implementation of the CRI ImageService.
pub struct KilnImageService {
    ctx: ServiceContext,
}

impl KilnImageService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn images(&self) -> &Arc<dyn ImageStorage> {
        &self.ctx.images
    }

    /// Build the CRI view of one image, with every reference it is known by.
    async fn describe(&self, stored: StoredImage) -> Result<cri::Image> {
        let mut tags = self
            .ctx
            .call("ImageStatus", &stored.digest, self.images().references(&stored.digest))
            .await?;
        if tags.is_empty() {
            tags.push(stored.reference.clone());
        }
        let config = self
            .ctx
            .call("ImageStatus", &stored.digest, self.images().image_config(&stored.digest))
            .await?;
        Ok(image_message(stored, tags, config.user.as_deref()))
    }

    async fn list(&self, req: cri::ListImagesRequest) -> Result<cri::ListImagesResponse> {
        let wanted = req
            .filter
            .and_then(|f| f.image)
            .map(|spec| spec.image)
            .filter(|image| !image.is_empty());

        let stored = match wanted {
            Some(image) => self
                .ctx
                .call("ListImages", &image, self.images().get(&image))
                .await?
                .into_iter()
                .collect(),
            None => self.ctx.call("ListImages", "", self.images().list()).await?,
        };

        // One CRI image per id, however many references point at it.
        let mut by_digest: HashMap<String, (StoredImage, Vec<String>)> = HashMap::new();
        for image in stored {
            let slot = by_digest
                .entry(image.digest.clone())
                .or_insert_with(|| (image.clone(), Vec::new()));
            slot.1.push(image.reference);
        }
        let mut images: Vec<cri::Image> = by_digest
            .into_values()
            .map(|(stored, mut tags)| {
                tags.sort();
                tags.dedup();
                image_message(stored, tags, None)
            })
            .collect();
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cri::ListImagesResponse { images })
    }

    async fn status(&self, req: cri::ImageStatusRequest) -> Result<cri::ImageStatusResponse> {
        let spec = req
            .image
            .ok_or_else(|| CriError::invalid("image spec required"))?;
        let stored = self
            .ctx
            .call("ImageStatus", &spec.image, self.images().get(&spec.image))
            .await?;
        let image = match stored {
            Some(stored) => Some(self.describe(stored).await?),
            None => None,
        };

        let mut info = HashMap::new();
        if req.verbose {
            if let Some(image) = &image {
                let config = self
                    .ctx
                    .call("ImageStatus", &image.id, self.images().image_config(&image.id))
                    .await?;
                let verbose = serde_json::json!({
                    "entrypoint": config.entrypoint,
                    "cmd": config.cmd,
                    "env": config.env,
                    "working_dir": config.working_dir,
                    "labels": config.labels,
                });
                info.insert("info".to_string(), verbose.to_string());
            }
        }
        Ok(cri::ImageStatusResponse { image, info })
    }

    async fn pull(&self, req: cri::PullImageRequest) -> Result<cri::PullImageResponse> {
        let spec = req
            .image
            .ok_or_else(|| CriError::invalid("image spec required"))?;
        if spec.image.is_empty() {
            return Err(CriError::invalid("image reference required"));
        }
        tracing::info!(image = %spec.image, "CRI PullImage");

        let auth = match req.auth {
            Some(auth) => RegistryAuth::from_cri(&auth.username, &auth.password, &auth.auth)
                .map_err(|e| CriError::invalid(format!("PullImage {}: {}", spec.image, e)))?,
            None => RegistryAuth::anonymous(),
        };
        let stored = self
            .ctx
            .call("PullImage", &spec.image, self.images().pull(&spec.image, &auth))
            .await?;
        tracing::info!(image = %spec.image, digest = %stored.digest, "Image pulled");
        Ok(cri::PullImageResponse {
            image_ref: stored.digest,
        })
    }

    async fn remove(&self, req: cri::RemoveImageRequest) -> Result<cri::RemoveImageResponse> {
        let spec = req
            .image
            .ok_or_else(|| CriError::invalid("image spec required"))?;
        tracing::info!(image = %spec.image, "CRI RemoveImage");

        match self.images().remove(&spec.image).await {
            Ok(()) => Ok(cri::RemoveImageResponse {}),
            Err(kiln_core::KilnError::ImageNotFound(_)) => {
                tracing::debug!(image = %spec.image, "RemoveImage of unknown image");
                Ok(cri::RemoveImageResponse {})
            }
            Err(e) => Err(CriError::collaborator("RemoveImage", &spec.image, e)),
        }
    }

    async fn fs_info(&self) -> Result<cri::ImageFsInfoResponse> {
        let usage = self
            .ctx
            .call("ImageFsInfo", "", self.images().fs_usage())
            .await?;
        let usage = cri::FilesystemUsage {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            fs_id: Some(cri::FilesystemIdentifier {
                mountpoint: usage.mountpoint.to_string_lossy().to_string(),
            }),
            used_bytes: Some(cri::UInt64Value {
                value: usage.used_bytes,
            }),
            inodes_used: Some(cri::UInt64Value {
                value: usage.inodes_used,
            }),
        };
        Ok(cri::ImageFsInfoResponse {
            image_filesystems: vec![usage],
            container_filesystems: vec![],
        })
    }
}

#[tonic::async_trait]
impl ImageService for KilnImageService {
    async fn list_images(
        &self,
        request: Request<cri::ListImagesRequest>,
    ) -> std::result::Result<Response<cri::ListImagesResponse>, Status> {
        let started = Instant::now();
        let result = self.list(request.into_inner()).await;
        self.ctx.respond("ListImages", started, result)
    }

    async fn image_status(
        &self,
        request: Request<cri::ImageStatusRequest>,
    ) -> std::result::Result<Response<cri::ImageStatusResponse>, Status> {
        let started = Instant::now();
        let result = self.status(request.into_inner()).await;
        self.ctx.respond("ImageStatus", started, result)
    }

    async fn pull_image(
        &self,
        request: Request<cri::PullImageRequest>,
    ) -> std::result::Result<Response<cri::PullImageResponse>, Status> {
        let started = Instant::now();
        let result = self.pull(request.into_inner()).await;
        self.ctx.respond("PullImage", started, result)
    }

    async fn remove_image(
        &self,
        request: Request<cri::RemoveImageRequest>,
    ) -> std::result::Result<Response<cri::RemoveImageResponse>, Status> {
        let started = Instant::now();
        let result = self.remove(request.into_inner()).await;
        self.ctx.respond("RemoveImage", started, result)
    }

    async fn image_fs_info(
        &self,
        _request: Request<cri::ImageFsInfoRequest>,
    ) -> std::result::Result<Response<cri::ImageFsInfoResponse>, Status> {
        let started = Instant::now();
        let result = self.fs_info().await;
        self.ctx.respond("ImageFsInfo", started, result)
    }
}

/// CRI image message. A numeric image user becomes `uid`, anything else
/// `username`.
fn image_message(stored: StoredImage, repo_tags: Vec<String>, user: Option<&str>) -> cri::Image {
    let repo_digests = repo_tags
        .iter()
        .map(|tag| format!("{}@{}", repository(tag), stored.digest))
        .collect();
    let (uid, username) = match user.map(|u| u.split(':').next().unwrap_or_default()) {
        Some(user) if !user.is_empty() => match user.parse::<i64>() {
            Ok(uid) => (Some(cri::Int64Value { value: uid }), String::new()),
            Err(_) => (None, user.to_string()),
        },
        _ => (None, String::new()),
    };
    cri::Image {
        id: stored.digest,
        repo_tags,
        repo_digests,
        size: stored.size_bytes,
        uid,
        username,
        spec: Some(cri::ImageSpec {
            image: stored.reference,
            annotations: HashMap::new(),
        }),
        pinned: false,
    }
}

/// `registry/repo:tag` → `registry/repo`. A port in the registry host is
/// not mistaken for a tag.
fn repository(reference: &str) -> &str {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].find(':') {
        Some(i) => &reference[..name_start + i],
        None => reference,
    }
}
