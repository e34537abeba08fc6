//! Crate-wide error taxonomy.
//!
//! Every module keeps its own `thiserror` enum; this module maps them onto a
//! single [`AppError`] the host can show to a user or attach to a log line.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::capabilities::{ApiError, HttpError};
use crate::config::ConfigError;
use crate::image_cache::CacheError;
use crate::preview::PreviewError;
use crate::sharpen::SharpenError;
use crate::upload_queue::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Worth retrying later: network, timeouts, expired credentials.
    Transient,
    /// The input itself is unacceptable; retrying the same thing cannot help.
    Permanent,
    /// Local resource failure. The operation in progress is abandoned.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    ContentRejected,
    Validation,
    NotFound,
    Storage,
    DownloadExhausted,
    ImageProcessing,
    ImageTooLarge,
    ImageFormatUnsupported,
    Overloaded,
    InvalidState,
    Configuration,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::ContentRejected => "CONTENT_REJECTED",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE_ERROR",
            Self::DownloadExhausted => "DOWNLOAD_EXHAUSTED",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::ImageFormatUnsupported => "IMAGE_FORMAT_UNSUPPORTED",
            Self::Overloaded => "OVERLOADED",
            Self::InvalidState => "INVALID_STATE",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Authentication
            | Self::DownloadExhausted
            | Self::Overloaded => ErrorSeverity::Transient,

            Self::Storage | Self::InvalidState | Self::Configuration | Self::Internal => {
                ErrorSeverity::Fatal
            }

            Self::ContentRejected
            | Self::Validation
            | Self::NotFound
            | Self::ImageProcessing
            | Self::ImageTooLarge
            | Self::ImageFormatUnsupported => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::Authentication
                | Self::DownloadExhausted
                | Self::Overloaded
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Your photo is safe and will upload when you're back online."
                    .into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::ContentRejected => {
                "The server could not accept this photo. Please try a different one.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested photo could not be found.".into(),
            ErrorKind::Storage => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::DownloadExhausted => {
                "The image could not be downloaded. Tap to try again.".into()
            }
            ErrorKind::ImageProcessing => {
                "Unable to process the image. Please try a different photo.".into()
            }
            ErrorKind::ImageTooLarge => format!(
                "The image is too large. Maximum supported is {}x{} pixels.",
                crate::MAX_IMAGE_DIMENSION,
                crate::MAX_IMAGE_DIMENSION
            ),
            ErrorKind::ImageFormatUnsupported => {
                "This image format is not supported. Please use JPEG, PNG, or WebP.".into()
            }
            ErrorKind::Overloaded => "Still working on the previous image. Please wait.".into(),
            ErrorKind::InvalidState | ErrorKind::Configuration | ErrorKind::Internal => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    /// Classifies a non-success status the way the upload pipeline treats it.
    /// Retryable kinds line up with `HttpError::is_retryable_status`; 403 and
    /// 404 are the only 4xx codes with a kind of their own.
    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 | 500..=599 => ErrorKind::Network,
            400..=499 => ErrorKind::ContentRejected,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

// ============================================================================
// Conversions
// ============================================================================

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let kind = match &e {
            HttpError::InvalidUrl { .. } => ErrorKind::Validation,
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::MissingCredential => ErrorKind::Authentication,
            HttpError::LocalWrite { .. } => ErrorKind::Storage,
            HttpError::HttpStatus { status, .. } => {
                return Self::from_http_status(*status, e.to_string());
            }
            _ => ErrorKind::Network,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(inner) => inner.into(),
            ApiError::Unauthenticated { .. } => {
                Self::new(ErrorKind::Authentication, e.to_string())
            }
            ApiError::Rejected { status, .. } if (400..500).contains(&status) => {
                Self::from_http_status(status, e.to_string())
            }
            ApiError::Rejected { status, .. } => Self::new(ErrorKind::ContentRejected, e.to_string())
                .with_context("http_status", status.to_string()),
            ApiError::InvalidResponse { .. } => Self::new(ErrorKind::Network, e.to_string()),
            ApiError::Artifact { .. } => Self::new(ErrorKind::Storage, e.to_string()),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        let kind = match &e {
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::Validation(_) => ErrorKind::Validation,
            QueueError::Full(_)
            | QueueError::ArtifactMissing { .. }
            | QueueError::Io { .. }
            | QueueError::Storage(_)
            | QueueError::CorruptedEntry { .. } => ErrorKind::Storage,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        let kind = match &e {
            CacheError::InvalidUrl(_) => ErrorKind::Validation,
            CacheError::Config(_) => ErrorKind::Configuration,
            CacheError::Exhausted { .. } => ErrorKind::DownloadExhausted,
            CacheError::Io { .. } => ErrorKind::Storage,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<SharpenError> for AppError {
    fn from(e: SharpenError) -> Self {
        let kind = match &e {
            SharpenError::ImageTooLarge { .. } | SharpenError::InputTooLarge { .. } => {
                ErrorKind::ImageTooLarge
            }
            SharpenError::UnsupportedFormat | SharpenError::EmptyInput => {
                ErrorKind::ImageFormatUnsupported
            }
            SharpenError::Overloaded => ErrorKind::Overloaded,
            SharpenError::Io { .. } => ErrorKind::Storage,
            SharpenError::Decode { .. }
            | SharpenError::Encode { .. }
            | SharpenError::ZeroDimension { .. }
            | SharpenError::TaskFailed => ErrorKind::ImageProcessing,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<PreviewError> for AppError {
    fn from(e: PreviewError) -> Self {
        match e {
            PreviewError::Download(inner) => inner.into(),
            PreviewError::Transform(inner) => inner.into(),
            PreviewError::Api(inner) => inner.into(),
            PreviewError::Params(_) => Self::new(ErrorKind::Validation, e.to_string()),
            PreviewError::Io { .. } => Self::new(ErrorKind::Storage, e.to_string()),
            PreviewError::Closed | PreviewError::InvalidState { .. } => {
                Self::new(ErrorKind::InvalidState, e.to_string())
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, e.to_string())
    }
}
