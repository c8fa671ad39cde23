//! Best-effort asset and link-preview services.
//!
//! Nothing here is needed for rooms to converge; callers fall back to
//! empty metadata when a service fails.

pub mod assets;
pub mod preview;

pub use assets::{sanitize_object_name, AssetMetadata, AssetRef, FsAssetStore};
pub use preview::{unfurl_or_default, LinkPreview, LinkUnfurler};

/// Upstream enrichment failures.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("invalid content type {0:?}: only images and videos are allowed")]
    InvalidContentType(String),
    #[error("invalid object name: {0:?}")]
    InvalidName(String),
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("asset storage is not configured")]
    Unavailable,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("upstream timed out")]
    Timeout,
}
