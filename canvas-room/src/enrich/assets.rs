//! Filesystem asset store for images and videos placed on the canvas.
//!
//! Objects live under `<root>/uploads/<name>` and are served from
//! `<public_base>/uploads/<name>`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EnrichmentError;

const UPLOADS_DIR: &str = "uploads";

/// Client-supplied description of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMetadata {
    pub name: String,
    pub content_type: String,
}

impl AssetMetadata {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
        }
    }
}

/// A stored asset, as referenced from canvas records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub object_name: String,
    pub url: String,
}

/// Replace every char outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_object_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Asset store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
    public_base: String,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the store's root directory exists.
    pub fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    /// Store `bytes` under a unique name derived from `metadata.name`.
    pub async fn upload(
        &self,
        bytes: &[u8],
        metadata: &AssetMetadata,
    ) -> Result<AssetRef, EnrichmentError> {
        if !self.is_available() {
            return Err(EnrichmentError::Unavailable);
        }
        let content_type = metadata.content_type.trim().to_ascii_lowercase();
        if !content_type.starts_with("image/") && !content_type.starts_with("video/") {
            return Err(EnrichmentError::InvalidContentType(
                metadata.content_type.clone(),
            ));
        }

        let object_name =
            sanitize_object_name(&format!("{}-{}", Uuid::new_v4().simple(), metadata.name));
        let dir = self.root.join(UPLOADS_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&object_name), bytes).await?;

        log::info!(
            "Stored asset {object_name} ({} bytes, {content_type})",
            bytes.len()
        );
        Ok(AssetRef {
            url: self.url_for(&object_name),
            object_name,
        })
    }

    /// Public URL of an existing object.
    pub async fn resolve(&self, object_name: &str) -> Result<String, EnrichmentError> {
        let path = self.object_path(object_name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(EnrichmentError::NotFound(object_name.to_string()));
        }
        Ok(self.url_for(&sanitize_object_name(object_name)))
    }

    /// Contents of an existing object.
    pub async fn read(&self, object_name: &str) -> Result<Vec<u8>, EnrichmentError> {
        let path = self.object_path(object_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EnrichmentError::NotFound(object_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn object_path(&self, object_name: &str) -> Result<PathBuf, EnrichmentError> {
        let name = sanitize_object_name(object_name);
        if name.is_empty() || name == "." || name == ".." {
            return Err(EnrichmentError::InvalidName(object_name.to_string()));
        }
        Ok(self.root.join(UPLOADS_DIR).join(name))
    }

    fn url_for(&self, object_name: &str) -> String {
        format!("{}/{UPLOADS_DIR}/{object_name}", self.public_base)
    }
}
