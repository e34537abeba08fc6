//! In-crate fakes for the backend seams.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::capabilities::{
    ApiError, DownloadProgress, HttpError, ImageFetcher, PhotoApi, ProgressSender, ValidatedUrl,
};
use crate::model::{
    ColorizeOptions, EnhancementResponse, PhotoId, RestorationOptions, SharpenOptions,
    UploadMetadata, UploadResponse,
};
use crate::sharpen::{ImageTransform, SharpenError, SharpenParams, SharpenTransform};

pub fn write_test_png(path: &Path, width: u32, height: u32) {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, ((x * 7 + y * 3) % 256) as u8, 255])
    });
    img.save(path).unwrap();
}

pub fn test_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.png");
    write_test_png(&path, width, height);
    std::fs::read(path).unwrap()
}

pub fn connection_reset() -> HttpError {
    HttpError::ConnectionError {
        host: "vault.test".into(),
        message: "connection reset by peer".into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Succeed,
    Transient,
}

/// `PhotoApi` fake. Records every upload attempt by artifact file name.
pub struct ScriptedApi {
    mode: Mutex<UploadMode>,
    /// Artifacts whose file name contains one of these markers are rejected.
    reject_markers: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    uploaded: Mutex<Vec<String>>,
    enhancements: Mutex<Vec<(PhotoId, String)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_photo_id: AtomicU64,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(UploadMode::Succeed),
            reject_markers: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
            uploaded: Mutex::new(Vec::new()),
            enhancements: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_photo_id: AtomicU64::new(100),
        }
    }

    pub fn set_mode(&self, mode: UploadMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn reject_when_named(&self, marker: &str) {
        self.reject_markers.lock().unwrap().insert(marker.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn enhancements(&self) -> Vec<(PhotoId, String)> {
        self.enhancements.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enhancement(&self, photo_id: PhotoId, op: &str) -> Result<EnhancementResponse, ApiError> {
        self.enhancements.lock().unwrap().push((photo_id, op.to_string()));
        if *self.mode.lock().unwrap() == UploadMode::Transient {
            return Err(ApiError::Network(connection_reset()));
        }
        Ok(EnhancementResponse {
            success: true,
            photo_id: Some(photo_id),
            enhanced_url: Some(format!("https://vault.test/photos/{photo_id}/{op}.jpg")),
            message: None,
        })
    }
}

#[async_trait]
impl PhotoApi for ScriptedApi {
    async fn upload_photo(
        &self,
        artifact: &Path,
        _metadata: &UploadMetadata,
    ) -> Result<UploadResponse, ApiError> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.attempts.lock().unwrap().push(name.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if !artifact.exists() {
            return Err(ApiError::Artifact {
                path: artifact.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        if self
            .reject_markers
            .lock()
            .unwrap()
            .iter()
            .any(|m| name.contains(m.as_str()))
        {
            return Err(ApiError::Rejected {
                status: 415,
                message: "unsupported content".into(),
            });
        }
        if *self.mode.lock().unwrap() == UploadMode::Transient {
            return Err(ApiError::Network(connection_reset()));
        }

        self.uploaded.lock().unwrap().push(name);
        Ok(UploadResponse {
            success: true,
            photo_id: Some(PhotoId(self.next_photo_id.fetch_add(1, Ordering::SeqCst))),
            extracted_photo_ids: Vec::new(),
        })
    }

    async fn sharpen(
        &self,
        photo_id: PhotoId,
        _options: &SharpenOptions,
    ) -> Result<EnhancementResponse, ApiError> {
        self.enhancement(photo_id, "sharpen")
    }

    async fn restore(
        &self,
        photo_id: PhotoId,
        _options: &RestorationOptions,
    ) -> Result<EnhancementResponse, ApiError> {
        self.enhancement(photo_id, "restore")
    }

    async fn colorize(
        &self,
        photo_id: PhotoId,
        _options: &ColorizeOptions,
    ) -> Result<EnhancementResponse, ApiError> {
        self.enhancement(photo_id, "colorize")
    }
}

pub enum FetchStep {
    Serve(Vec<u8>),
    /// Writes some bytes to the destination, then fails.
    FailAfterPartial(HttpError),
    Fail(HttpError),
    /// Serves the default body after a pause.
    Delay(Duration),
    Hang,
}

/// `ImageFetcher` fake driven by per-URL scripts. Unscripted calls serve
/// the default body.
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<FetchStep>>>,
    calls: Mutex<Vec<String>>,
    default_body: Vec<u8>,
}

impl ScriptedFetcher {
    pub fn new(default_body: Vec<u8>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            default_body,
        }
    }

    pub fn script(&self, url: &str, steps: impl IntoIterator<Item = FetchStep>) {
        let url = ValidatedUrl::new(url).unwrap().as_str().to_string();
        self.scripts
            .lock()
            .unwrap()
            .entry(url)
            .or_default()
            .extend(steps);
    }

    pub fn calls_for(&self, url: &str) -> usize {
        let url = ValidatedUrl::new(url).unwrap().as_str().to_string();
        self.calls.lock().unwrap().iter().filter(|c| **c == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn dest_dir_snapshot(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default();
        files.sort();
        files
    }
}

#[async_trait]
impl ImageFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &ValidatedUrl,
        dest: &Path,
        progress: Option<&ProgressSender>,
    ) -> Result<u64, HttpError> {
        self.calls.lock().unwrap().push(url.as_str().to_string());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| FetchStep::Serve(self.default_body.clone()));

        match step {
            FetchStep::Serve(body) => {
                let total = body.len() as u64;
                tokio::fs::write(dest, &body).await.unwrap();
                if let Some(tx) = progress {
                    tx.send_replace(DownloadProgress {
                        bytes_done: total,
                        total_bytes: Some(total),
                    });
                }
                Ok(total)
            }
            FetchStep::FailAfterPartial(err) => {
                tokio::fs::write(dest, b"partial").await.unwrap();
                Err(err)
            }
            FetchStep::Fail(err) => Err(err),
            FetchStep::Delay(pause) => {
                tokio::time::sleep(pause).await;
                tokio::fs::write(dest, &self.default_body).await.unwrap();
                Ok(self.default_body.len() as u64)
            }
            FetchStep::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
        }
    }
}

/// Real sharpen transform that records parameters and can be made slow or
/// failing.
pub struct RecordingTransform {
    inner: SharpenTransform,
    calls: Mutex<Vec<SharpenParams>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingTransform {
    pub fn new() -> Self {
        Self {
            inner: SharpenTransform::with_defaults(),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn calls(&self) -> Vec<SharpenParams> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ImageTransform for RecordingTransform {
    async fn apply(&self, input: &Path, params: SharpenParams) -> Result<PathBuf, SharpenError> {
        self.calls.lock().unwrap().push(params);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SharpenError::TaskFailed);
        }
        self.inner.apply(input, params).await
    }
}
