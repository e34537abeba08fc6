use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::ConfigError;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_RESPONSE_BODY_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 120_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url)?;

        let scheme = parsed.scheme().to_lowercase();
        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path component without query or fragment.
    pub fn path(&self) -> &str {
        let after_scheme = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        let path_start = after_scheme.find('/').unwrap_or(after_scheme.len());
        let path = &after_scheme[path_start..];
        let end = path.find(['?', '#']).unwrap_or(path.len());
        &path[..end]
    }

    // Private hosts are allowed: a family vault is often served from the
    // home network.
    fn validate(url: &str) -> Result<Url, HttpError> {
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(url.trim()).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(parsed)
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            return url.to_string();
        }
        let mut end = 100;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &url[..end])
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
        retryable: bool,
    },

    #[error("missing bearer credential")]
    MissingCredential,

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: u64, max: u64 },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },

    #[error("failed writing {path}: {message}")]
    LocalWrite { path: String, message: String },
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. }
            | HttpError::ConnectionError { .. }
            | HttpError::MissingCredential => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Status codes worth another attempt against the same URL.
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 401 | 408 | 429 | 500..=599)
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            upload_timeout_ms: DEFAULT_UPLOAD_TIMEOUT_MS,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(self.base_url.as_str())
            .map_err(|e| ConfigError::Invalid(format!("api.base_url: {e}")))?;
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("upload_timeout_ms", self.upload_timeout_ms),
        ] {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid(format!(
                    "api.{name} must be in 1..={MAX_TIMEOUT_MS}"
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Best-effort extraction of a human-readable reason from an error body.
pub(crate) fn error_message(status: u16, body: &[u8]) -> String {
    serde_json::from_slice::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("HTTP error: {status}"))
}

pub(crate) fn mime_for_path(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// Reqwest client
// ============================================================================

#[cfg(feature = "http")]
pub use self::client::HttpPhotoClient;

#[cfg(feature = "http")]
mod client {
    use async_trait::async_trait;
    use serde::de::DeserializeOwned;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tracing::{debug, instrument, warn};
    use url::Url;
    use uuid::Uuid;

    use super::{error_message, mime_for_path, ApiConfig, HttpError, ValidatedUrl};
    use super::MAX_RESPONSE_BODY_SIZE;
    use crate::capabilities::api::{
        ApiError, DownloadProgress, ImageFetcher, PhotoApi, ProgressSender,
    };
    use crate::capabilities::auth::CredentialProvider;
    use crate::model::{
        ColorizeOptions, EnhancementResponse, PhotoId, RestorationOptions, SharpenOptions,
        UploadMetadata, UploadResponse,
    };

    /// `PhotoApi` and `ImageFetcher` over HTTPS with bearer auth.
    pub struct HttpPhotoClient {
        client: reqwest::Client,
        base: Url,
        host: String,
        config: ApiConfig,
        credentials: Arc<dyn CredentialProvider>,
    }

    impl HttpPhotoClient {
        pub fn new(
            config: ApiConfig,
            credentials: Arc<dyn CredentialProvider>,
        ) -> Result<Self, HttpError> {
            let validated = ValidatedUrl::new(config.base_url.as_str())?;
            let mut base = validated.as_str().to_string();
            if !base.ends_with('/') {
                base.push('/');
            }
            let base = Url::parse(&base).map_err(|e| HttpError::InvalidUrl {
                url: base.clone(),
                reason: e.to_string(),
            })?;

            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
                .timeout(config.request_timeout())
                .build()
                .map_err(|e| HttpError::InvalidRequest {
                    reason: format!("failed to create HTTP client: {e}"),
                })?;

            Ok(Self {
                client,
                host: validated.host().to_string(),
                base,
                config,
                credentials,
            })
        }

        pub(crate) fn endpoint(&self, path: &str) -> Result<Url, HttpError> {
            self.base.join(path).map_err(|e| HttpError::InvalidUrl {
                url: path.to_string(),
                reason: e.to_string(),
            })
        }

        fn authorize(
            &self,
            request: reqwest::RequestBuilder,
            request_id: &str,
        ) -> Result<reqwest::RequestBuilder, HttpError> {
            let token = self
                .credentials
                .bearer_token()
                .ok_or(HttpError::MissingCredential)?;
            Ok(request
                .bearer_auth(token.expose())
                .header("X-Request-ID", request_id))
        }

        fn transport_error(&self, e: &reqwest::Error, timeout: Duration, request_id: &str) -> HttpError {
            if e.is_timeout() {
                HttpError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    request_id: request_id.to_string(),
                }
            } else {
                HttpError::ConnectionError {
                    host: self.host.clone(),
                    message: e.to_string(),
                }
            }
        }

        async fn send_json<T: DeserializeOwned>(
            &self,
            request: reqwest::RequestBuilder,
            timeout: Duration,
        ) -> Result<T, ApiError> {
            let request_id = Uuid::new_v4().to_string();
            let request = self.authorize(request, &request_id).map_err(|_| {
                ApiError::Unauthenticated {
                    reason: "no bearer token available".into(),
                }
            })?;

            let response = request
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| self.transport_error(&e, timeout, &request_id))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| self.transport_error(&e, timeout, &request_id))?;

            if !(200..300).contains(&status) {
                return Err(classify_status(status, &body, request_id));
            }

            serde_json::from_slice(&body).map_err(|e| ApiError::InvalidResponse {
                reason: e.to_string(),
            })
        }

        async fn enhance<O: serde::Serialize + Sync>(
            &self,
            photo_id: PhotoId,
            operation: &str,
            options: &O,
        ) -> Result<EnhancementResponse, ApiError> {
            let url = self.endpoint(&format!("api/photos/{photo_id}/{operation}"))?;
            let response: EnhancementResponse = self
                .send_json(self.client.post(url).json(options), self.config.request_timeout())
                .await?;
            if !response.success {
                return Err(ApiError::Rejected {
                    status: 200,
                    message: response
                        .message
                        .unwrap_or_else(|| format!("{operation} was not applied")),
                });
            }
            Ok(response)
        }
    }

    fn classify_status(status: u16, body: &[u8], request_id: String) -> ApiError {
        let message = error_message(status, body);
        match status {
            401 | 403 => ApiError::Unauthenticated { reason: message },
            s if HttpError::is_retryable_status(s) => ApiError::Network(HttpError::HttpStatus {
                status,
                message,
                request_id,
                retryable: true,
            }),
            _ => ApiError::Rejected { status, message },
        }
    }

    #[async_trait]
    impl PhotoApi for HttpPhotoClient {
        #[instrument(skip(self, metadata), fields(artifact = %artifact.display()))]
        async fn upload_photo(
            &self,
            artifact: &Path,
            metadata: &UploadMetadata,
        ) -> Result<UploadResponse, ApiError> {
            let data = tokio::fs::read(artifact)
                .await
                .map_err(|source| ApiError::Artifact {
                    path: artifact.to_path_buf(),
                    source,
                })?;
            let file_name = artifact
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("capture.jpg")
                .to_string();

            let part = reqwest::multipart::Part::bytes(data)
                .file_name(file_name)
                .mime_str(mime_for_path(artifact))
                .map_err(|e| HttpError::InvalidRequest {
                    reason: e.to_string(),
                })?;
            let mut form = reqwest::multipart::Form::new().part("file", part);
            if let Some(caption) = &metadata.caption {
                form = form.text("caption", caption.clone());
            }
            if let Some(kind) = &metadata.enhancement_type {
                form = form.text("enhancement_type", kind.clone());
            }
            if let Some(source) = metadata.source_photo_id {
                form = form.text("source_photo_id", source.to_string());
            }

            let url = self.endpoint("api/upload")?;
            let response: UploadResponse = self
                .send_json(self.client.post(url).multipart(form), self.config.upload_timeout())
                .await?;
            if !response.success {
                return Err(ApiError::Rejected {
                    status: 200,
                    message: "upload was not accepted".into(),
                });
            }
            debug!(
                photo_id = ?response.photo_id,
                extracted = response.extracted_photo_ids.len(),
                "upload acknowledged"
            );
            Ok(response)
        }

        async fn sharpen(
            &self,
            photo_id: PhotoId,
            options: &SharpenOptions,
        ) -> Result<EnhancementResponse, ApiError> {
            self.enhance(photo_id, "sharpen", options).await
        }

        async fn restore(
            &self,
            photo_id: PhotoId,
            options: &RestorationOptions,
        ) -> Result<EnhancementResponse, ApiError> {
            self.enhance(photo_id, "restore", options).await
        }

        async fn colorize(
            &self,
            photo_id: PhotoId,
            options: &ColorizeOptions,
        ) -> Result<EnhancementResponse, ApiError> {
            self.enhance(photo_id, "colorize", options).await
        }
    }

    #[async_trait]
    impl ImageFetcher for HttpPhotoClient {
        #[instrument(skip(self, dest, progress), fields(url = %url))]
        async fn fetch(
            &self,
            url: &ValidatedUrl,
            dest: &Path,
            progress: Option<&ProgressSender>,
        ) -> Result<u64, HttpError> {
            let request_id = Uuid::new_v4().to_string();
            let timeout = self.config.request_timeout();
            let request = self.authorize(self.client.get(url.as_str()), &request_id)?;

            let mut response = request
                .send()
                .await
                .map_err(|e| self.transport_error(&e, timeout, &request_id))?;
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(HttpError::HttpStatus {
                    status,
                    message: format!("download of {} failed", url.path()),
                    request_id,
                    retryable: HttpError::is_retryable_status(status),
                });
            }

            let total = response.content_length();
            if let Some(size) = total.filter(|s| *s > MAX_RESPONSE_BODY_SIZE) {
                return Err(HttpError::ResponseTooLarge {
                    size,
                    max: MAX_RESPONSE_BODY_SIZE,
                });
            }

            let local_write = |e: std::io::Error| HttpError::LocalWrite {
                path: dest.display().to_string(),
                message: e.to_string(),
            };
            let mut file = tokio::fs::File::create(dest).await.map_err(local_write)?;
            let mut done: u64 = 0;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| self.transport_error(&e, timeout, &request_id))?
            {
                done += chunk.len() as u64;
                if done > MAX_RESPONSE_BODY_SIZE {
                    return Err(HttpError::ResponseTooLarge {
                        size: done,
                        max: MAX_RESPONSE_BODY_SIZE,
                    });
                }
                file.write_all(&chunk).await.map_err(local_write)?;
                if let Some(tx) = progress {
                    tx.send_replace(DownloadProgress {
                        bytes_done: done,
                        total_bytes: total,
                    });
                }
            }
            file.flush().await.map_err(local_write)?;
            file.sync_all().await.map_err(local_write)?;

            if let Some(expected) = total.filter(|t| *t != done) {
                warn!(expected, received = done, "short download");
                return Err(HttpError::ConnectionError {
                    host: url.host().to_string(),
                    message: format!("body ended after {done} of {expected} bytes"),
                });
            }
            Ok(done)
        }
    }

}
