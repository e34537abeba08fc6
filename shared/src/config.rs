//! Aggregated configuration for the client core.
//!
//! Each subsystem owns its own config struct next to its implementation;
//! [`CoreConfig`] only groups them so a host can load everything from one
//! JSON document.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::capabilities::ApiConfig;
use crate::image_cache::CacheConfig;
use crate::preview::PreviewConfig;
use crate::sharpen::ProcessingConfig;
use crate::upload_queue::QueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub sharpen: ProcessingConfig,
    pub preview: PreviewConfig,
}

impl CoreConfig {
    /// Defaults with every on-disk location placed under `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.set_root(root);
        config
    }

    pub fn set_root(&mut self, root: impl AsRef<Path>) {
        let root = root.as_ref();
        self.queue.root_dir = root.join("queue");
        self.cache.cache_dir = root.join("image-cache");
        self.preview.scratch_dir = root.join("preview");
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), "loaded core config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.validate()?;
        self.queue.validate()?;
        self.cache.validate()?;
        self.sharpen.validate()?;
        self.preview.validate()?;
        Ok(())
    }
}
