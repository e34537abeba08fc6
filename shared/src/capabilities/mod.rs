//! Ports to the outside world: the photo backend, remote image downloads
//! and the caller-supplied credential.

mod api;
mod auth;
mod http;

pub use self::api::{ApiError, DownloadProgress, ImageFetcher, PhotoApi, ProgressSender};
pub use self::auth::{BearerToken, CredentialProvider, StaticCredentials};
pub use self::http::{ApiConfig, HttpError, ValidatedUrl};

#[cfg(feature = "http")]
pub use self::http::HttpPhotoClient;
