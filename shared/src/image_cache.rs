//! Content-addressed on-disk cache of remote images.
//!
//! A URL maps to `<cache_dir>/<blake3-hex>.<ext>`. That path only ever holds a
//! complete download: fetches land in a unique `.part` file that is renamed
//! into place on success and deleted otherwise. There is no expiry and no
//! eviction; [`ImageCache::clear`] is the only way files leave.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::{HttpError, ImageFetcher, ProgressSender, ValidatedUrl};
use crate::config::ConfigError;

const DEFAULT_EXTENSION: &str = "jpg";
const KNOWN_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid image url: {0}")]
    InvalidUrl(#[source] HttpError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("every image source failed: {}", describe_failures(.failures))]
    Exhausted { failures: Vec<SourceFailure> },

    #[error("cache {op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Last error seen for one candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub url: String,
    pub attempts: u32,
    pub last_error: String,
}

fn describe_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} after {} attempt(s): {}", f.url, f.attempts, f.last_error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Fetch attempts per URL.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("photovault/image-cache"),
            max_attempts: 3,
            base_backoff_ms: 1000,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache.cache_dir must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("cache.max_attempts must be > 0".into()));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "cache.attempt_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Delay after the `failed_attempt`-th failure: `base × 2^(n-1)`.
    #[must_use]
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << exponent))
    }
}

/// A remote image with an optional lower-resolution rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub full: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl ImageRef {
    pub fn new(full: impl Into<String>) -> Self {
        Self {
            full: full.into(),
            thumbnail: None,
        }
    }

    #[must_use]
    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct ResolveOptions {
    pub prefer_thumbnail: bool,
    pub progress: Option<ProgressSender>,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    downloads: AtomicU64,
    failed_attempts: AtomicU64,
    cleanup_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub downloads: u64,
    pub failed_attempts: u64,
    pub cleanup_failures: u64,
}

pub struct ImageCache {
    config: CacheConfig,
    fetcher: Arc<dyn ImageFetcher>,
    metrics: CacheMetrics,
}

impl ImageCache {
    pub async fn new(config: CacheConfig, fetcher: Arc<dyn ImageFetcher>) -> Result<Self, CacheError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .map_err(|source| CacheError::Io {
                op: "create",
                path: config.cache_dir.clone(),
                source,
            })?;
        Ok(Self {
            config,
            fetcher,
            metrics: CacheMetrics::default(),
        })
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Stable file name for a URL: BLAKE3 hex digest plus the URL's image
    /// extension.
    #[must_use]
    pub fn key_for(url: &ValidatedUrl) -> String {
        let digest = hex::encode(blake3::hash(url.as_str().as_bytes()).as_bytes());
        format!("{digest}.{}", extension_for(url))
    }

    pub fn path_for(&self, url: &str) -> Result<PathBuf, CacheError> {
        let url = ValidatedUrl::new(url).map_err(CacheError::InvalidUrl)?;
        Ok(self.path_for_validated(&url))
    }

    pub async fn contains(&self, url: &str) -> Result<bool, CacheError> {
        let path = self.path_for(url)?;
        Ok(is_file(&path).await)
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            downloads: self.metrics.downloads.load(Ordering::Relaxed),
            failed_attempts: self.metrics.failed_attempts.load(Ordering::Relaxed),
            cleanup_failures: self.metrics.cleanup_failures.load(Ordering::Relaxed),
        }
    }

    /// Local path for `image`, downloading it if no candidate is cached.
    ///
    /// Candidates are the thumbnail (when preferred) and then the full
    /// image. All of them are checked on disk before any network call.
    #[instrument(skip(self, options), fields(url = %image.full))]
    pub async fn resolve(
        &self,
        image: &ImageRef,
        options: ResolveOptions,
    ) -> Result<PathBuf, CacheError> {
        let candidates = self.candidates(image, options.prefer_thumbnail)?;

        for url in &candidates {
            let path = self.path_for_validated(url);
            if is_file(&path).await {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, "cache hit");
                return Ok(path);
            }
        }

        let mut failures = Vec::with_capacity(candidates.len());
        for url in &candidates {
            match self.download(url, options.progress.as_ref()).await {
                Ok(path) => return Ok(path),
                Err(failure) => {
                    warn!(url = %url, error = %failure.last_error, "source exhausted");
                    failures.push(failure);
                }
            }
        }
        Err(CacheError::Exhausted { failures })
    }

    /// Deletes every cached file. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let dir = &self.config.cache_dir;
        let io_err = |op, source| CacheError::Io {
            op,
            path: dir.clone(),
            source,
        };
        let mut reader = tokio::fs::read_dir(dir).await.map_err(|e| io_err("list", e))?;
        let mut removed = 0;
        while let Some(item) = reader.next_entry().await.map_err(|e| io_err("list", e))? {
            match tokio::fs::remove_file(item.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    self.metrics.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %item.path().display(), error = %e, "failed to clear cache file");
                }
            }
        }
        info!(removed, "image cache cleared");
        Ok(removed)
    }

    fn path_for_validated(&self, url: &ValidatedUrl) -> PathBuf {
        self.config.cache_dir.join(Self::key_for(url))
    }

    fn candidates(&self, image: &ImageRef, prefer_thumbnail: bool) -> Result<Vec<ValidatedUrl>, CacheError> {
        let full = ValidatedUrl::new(image.full.as_str()).map_err(CacheError::InvalidUrl)?;
        let mut candidates = Vec::with_capacity(2);
        if prefer_thumbnail {
            if let Some(raw) = image.thumbnail.as_deref() {
                match ValidatedUrl::new(raw) {
                    Ok(thumb) if thumb != full => candidates.push(thumb),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "ignoring invalid thumbnail url"),
                }
            }
        }
        candidates.push(full);
        Ok(candidates)
    }

    async fn download(
        &self,
        url: &ValidatedUrl,
        progress: Option<&ProgressSender>,
    ) -> Result<PathBuf, SourceFailure> {
        let dest = self.path_for_validated(url);
        let timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let mut last_error = String::new();
        let mut attempts = 0;

        while attempts < self.config.max_attempts {
            attempts += 1;
            let part = self
                .config
                .cache_dir
                .join(format!("{}.{}.part", Self::key_for(url), Uuid::new_v4().simple()));

            let retryable = match tokio::time::timeout(timeout, self.fetcher.fetch(url, &part, progress)).await {
                Ok(Ok(bytes)) => match tokio::fs::rename(&part, &dest).await {
                    Ok(()) => {
                        self.metrics.downloads.fetch_add(1, Ordering::Relaxed);
                        info!(url = %url, bytes, attempts, "image cached");
                        return Ok(dest);
                    }
                    Err(e) => {
                        last_error = format!("failed to move download into place: {e}");
                        false
                    }
                },
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    e.is_retryable()
                }
                Err(_) => {
                    last_error = format!("attempt timed out after {}ms", self.config.attempt_timeout_ms);
                    true
                }
            };

            self.metrics.failed_attempts.fetch_add(1, Ordering::Relaxed);
            self.discard_part(&part).await;
            debug!(url = %url, attempts, retryable, error = %last_error, "fetch attempt failed");

            if !retryable {
                break;
            }
            if attempts < self.config.max_attempts {
                tokio::time::sleep(self.config.backoff(attempts)).await;
            }
        }

        Err(SourceFailure {
            url: url.to_string(),
            attempts,
            last_error,
        })
    }

    async fn discard_part(&self, part: &Path) {
        match tokio::fs::remove_file(part).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.metrics.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %part.display(), error = %e, "failed to delete partial download");
            }
        }
    }
}

fn extension_for(url: &ValidatedUrl) -> &'static str {
    let path = url.path();
    let last = path.rsplit('/').next().unwrap_or_default();
    last.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .and_then(|ext| KNOWN_EXTENSIONS.iter().copied().find(|known| *known == ext))
        .unwrap_or(DEFAULT_EXTENSION)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DownloadProgress;
    use crate::testing::{connection_reset, FetchStep, ScriptedFetcher};
    use proptest::prelude::*;

    const FULL: &str = "https://vault.test/photos/7/full.JPG?sig=abc";
    const THUMB: &str = "https://vault.test/photos/7/thumb.webp";

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.join("cache"),
            max_attempts: 3,
            base_backoff_ms: 1,
            attempt_timeout_ms: 2_000,
        }
    }

    async fn cache(dir: &Path, fetcher: Arc<ScriptedFetcher>) -> ImageCache {
        ImageCache::new(config(dir), fetcher).await.unwrap()
    }

    fn leftover_parts(dir: &Path) -> usize {
        ScriptedFetcher::dest_dir_snapshot(dir)
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == "part"))
            .count()
    }

    #[test]
    fn keys_are_stable_and_typed() {
        let url = ValidatedUrl::new(FULL).unwrap();
        let key = ImageCache::key_for(&url);
        assert_eq!(key, ImageCache::key_for(&ValidatedUrl::new(FULL).unwrap()));
        assert!(key.ends_with(".jpg"));
        assert_eq!(key.len(), 64 + 4);

        let other = ValidatedUrl::new("https://vault.test/a/b").unwrap();
        assert!(ImageCache::key_for(&other).ends_with(".jpg"));
        let webp = ValidatedUrl::new(THUMB).unwrap();
        assert!(ImageCache::key_for(&webp).ends_with(".webp"));
    }

    #[test]
    fn backoff_doubles() {
        let cfg = CacheConfig {
            base_backoff_ms: 100,
            ..CacheConfig::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn second_resolve_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"jpeg bytes".to_vec()));
        let cache = cache(dir.path(), fetcher.clone()).await;
        let image = ImageRef::new(FULL);

        let first = cache.resolve(&image, ResolveOptions::default()).await.unwrap();
        let second = cache.resolve(&image, ResolveOptions::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.total_calls(), 1);
        assert_eq!(std::fs::read(&first).unwrap(), b"jpeg bytes");
        assert!(cache.contains(FULL).await.unwrap());
        assert_eq!(cache.metrics().hits, 1);
    }

    #[tokio::test]
    async fn cached_full_image_satisfies_thumbnail_request() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"x".to_vec()));
        let cache = cache(dir.path(), fetcher.clone()).await;
        cache.resolve(&ImageRef::new(FULL), ResolveOptions::default()).await.unwrap();

        let image = ImageRef::new(FULL).with_thumbnail(THUMB);
        let path = cache
            .resolve(
                &image,
                ResolveOptions {
                    prefer_thumbnail: true,
                    progress: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(path, cache.path_for(FULL).unwrap());
        assert_eq!(fetcher.calls_for(THUMB), 0);
    }

    #[tokio::test]
    async fn thumbnail_failures_fall_back_to_full() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"full".to_vec()));
        fetcher.script(
            THUMB,
            [
                FetchStep::FailAfterPartial(connection_reset()),
                FetchStep::Fail(connection_reset()),
                FetchStep::FailAfterPartial(connection_reset()),
            ],
        );
        let cache = cache(dir.path(), fetcher.clone()).await;
        let image = ImageRef::new(FULL).with_thumbnail(THUMB);

        let path = cache
            .resolve(
                &image,
                ResolveOptions {
                    prefer_thumbnail: true,
                    progress: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(path, cache.path_for(FULL).unwrap());
        assert_eq!(fetcher.calls_for(THUMB), 3);
        assert_eq!(fetcher.calls_for(FULL), 1);
        assert!(!cache.contains(THUMB).await.unwrap());
        assert_eq!(leftover_parts(cache.cache_dir()), 0);
    }

    #[tokio::test]
    async fn non_retryable_errors_end_the_source_early() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
        fetcher.script(
            FULL,
            [FetchStep::Fail(HttpError::HttpStatus {
                status: 404,
                message: "gone".into(),
                request_id: "r1".into(),
                retryable: false,
            })],
        );
        let cache = cache(dir.path(), fetcher.clone()).await;

        let err = cache
            .resolve(&ImageRef::new(FULL), ResolveOptions::default())
            .await
            .unwrap_err();

        let CacheError::Exhausted { failures } = err else {
            panic!("expected exhausted, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 1);
        assert!(failures[0].last_error.contains("404"));
        assert_eq!(fetcher.calls_for(FULL), 1);
    }

    #[tokio::test]
    async fn every_source_failing_lists_each_url() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
        fetcher.script(THUMB, (0..3).map(|_| FetchStep::Fail(connection_reset())));
        fetcher.script(FULL, (0..3).map(|_| FetchStep::FailAfterPartial(connection_reset())));
        let cache = cache(dir.path(), fetcher.clone()).await;
        let image = ImageRef::new(FULL).with_thumbnail(THUMB);

        let err = cache
            .resolve(
                &image,
                ResolveOptions {
                    prefer_thumbnail: true,
                    progress: None,
                },
            )
            .await
            .unwrap_err();

        match &err {
            CacheError::Exhausted { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|f| f.attempts == 3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("thumb.webp"));
        assert!(ScriptedFetcher::dest_dir_snapshot(cache.cache_dir()).is_empty());
    }

    #[tokio::test]
    async fn hung_attempts_time_out_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"ok".to_vec()));
        fetcher.script(FULL, [FetchStep::Hang]);
        let cfg = CacheConfig {
            attempt_timeout_ms: 50,
            ..config(dir.path())
        };
        let cache = ImageCache::new(cfg, fetcher.clone()).await.unwrap();

        let path = cache
            .resolve(&ImageRef::new(FULL), ResolveOptions::default())
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"ok");
        assert_eq!(fetcher.calls_for(FULL), 2);
        assert_eq!(cache.metrics().failed_attempts, 1);
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![7; 32]));
        let cache = cache(dir.path(), fetcher).await;
        let (tx, rx) = tokio::sync::watch::channel(DownloadProgress::default());

        cache
            .resolve(
                &ImageRef::new(FULL),
                ResolveOptions {
                    prefer_thumbnail: false,
                    progress: Some(tx),
                },
            )
            .await
            .unwrap();

        assert_eq!(rx.borrow().fraction(), Some(1.0));
    }

    #[tokio::test]
    async fn clear_wipes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"x".to_vec()));
        let cache = cache(dir.path(), fetcher.clone()).await;
        cache.resolve(&ImageRef::new(FULL), ResolveOptions::default()).await.unwrap();
        cache.resolve(&ImageRef::new(THUMB), ResolveOptions::default()).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(!cache.contains(FULL).await.unwrap());
        cache.resolve(&ImageRef::new(FULL), ResolveOptions::default()).await.unwrap();
        assert_eq!(fetcher.calls_for(FULL), 2);
    }

    #[tokio::test]
    async fn invalid_full_url_is_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
        let cache = cache(dir.path(), fetcher.clone()).await;
        let err = cache
            .resolve(&ImageRef::new("not a url"), ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidUrl(_)));
        assert_eq!(fetcher.total_calls(), 0);
    }

    proptest! {
        #[test]
        fn key_is_hex_digest_plus_known_extension(segment in "[a-z0-9]{1,12}", ext in "(jpg|png|webp|gif|txt)") {
            let url = ValidatedUrl::new(format!("https://vault.test/{segment}.{ext}")).unwrap();
            let key = ImageCache::key_for(&url);
            let (digest, key_ext) = key.split_once('.').unwrap();
            prop_assert_eq!(digest.len(), 64);
            prop_assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
            prop_assert!(KNOWN_EXTENSIONS.contains(&key_ext));
            prop_assert_eq!(key, ImageCache::key_for(&url));
        }
    }
}
