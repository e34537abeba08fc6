//! Backend seams: the photo API used by the upload pipeline and the image
//! fetcher used by the cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;

use super::http::{HttpError, ValidatedUrl};
use crate::model::{
    ColorizeOptions, EnhancementResponse, PhotoId, RestorationOptions, SharpenOptions,
    UploadMetadata, UploadResponse,
};

/// Byte-level download progress. Advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_done as f32 / total as f32).min(1.0)),
        }
    }
}

pub type ProgressSender = watch::Sender<DownloadProgress>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network failure: {0}")]
    Network(#[from] HttpError),

    #[error("no usable credential: {reason}")]
    Unauthenticated { reason: String },

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid server response: {reason}")]
    InvalidResponse { reason: String },

    #[error("cannot read artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    /// Failures that say nothing about the content itself. The upload
    /// pipeline queues these instead of reporting them as terminal.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => !matches!(e, HttpError::InvalidUrl { .. }),
            Self::Unauthenticated { .. } | Self::InvalidResponse { .. } => true,
            Self::Rejected { .. } | Self::Artifact { .. } => false,
        }
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

#[async_trait]
pub trait PhotoApi: Send + Sync {
    /// Multipart upload of a local artifact plus its metadata.
    async fn upload_photo(
        &self,
        artifact: &Path,
        metadata: &UploadMetadata,
    ) -> Result<UploadResponse, ApiError>;

    async fn sharpen(
        &self,
        photo_id: PhotoId,
        options: &SharpenOptions,
    ) -> Result<EnhancementResponse, ApiError>;

    async fn restore(
        &self,
        photo_id: PhotoId,
        options: &RestorationOptions,
    ) -> Result<EnhancementResponse, ApiError>;

    async fn colorize(
        &self,
        photo_id: PhotoId,
        options: &ColorizeOptions,
    ) -> Result<EnhancementResponse, ApiError>;
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Streams `url` into `dest`, returning the number of bytes written.
    /// `dest` is a scratch path owned by the caller; on error its contents
    /// are undefined and the caller removes it.
    async fn fetch(
        &self,
        url: &ValidatedUrl,
        dest: &Path,
        progress: Option<&ProgressSender>,
    ) -> Result<u64, HttpError>;
}
