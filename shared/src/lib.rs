//! PhotoVault client core.
//!
//! Two independent subsystems live here:
//!
//! * the connectivity-aware upload queue ([`NetworkMonitor`],
//!   [`UploadQueue`], [`CaptureCoordinator`]);
//! * the local sharpen preview pipeline ([`ImageCache`],
//!   [`SharpenTransform`], [`PreviewController`]).
//!
//! The host app reaches the backend through [`capabilities::PhotoApi`] and
//! [`capabilities::ImageFetcher`]; everything else is owned by this crate.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod capture;
pub mod config;
pub mod error;
pub mod image_cache;
pub mod listeners;
pub mod logging;
pub mod model;
pub mod network;
pub mod preview;
pub mod sharpen;
pub mod upload_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::{BatchItem, BatchReport, CaptureCoordinator, SubmitOptions, SubmitOutcome};
pub use config::{ConfigError, CoreConfig};
pub use error::{AppError, AppResult, ErrorKind, ErrorSeverity};
pub use image_cache::{CacheConfig, CacheError, ImageCache, ImageRef, ResolveOptions};
pub use listeners::ListenerHandle;
pub use network::{ConnectivityState, NetworkMonitor};
pub use preview::{
    PreviewConfig, PreviewController, PreviewError, PreviewSnapshot, PreviewStage, PreviewState,
};
pub use sharpen::{ImageTransform, ProcessingConfig, SharpenError, SharpenParams, SharpenTransform};
pub use upload_queue::{
    DrainReport, QueueConfig, QueueEntry, QueueError, QueueStorage, UploadQueue,
};

#[cfg(not(target_arch = "wasm32"))]
pub use upload_queue::SqliteQueueStorage;

/// Largest width or height accepted for local image work.
pub const MAX_IMAGE_DIMENSION: u32 = 15_000;
