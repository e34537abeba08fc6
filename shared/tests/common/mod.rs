#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use shared::capabilities::{ApiError, HttpError, ImageFetcher, PhotoApi, ProgressSender, ValidatedUrl};
use shared::model::{
    ColorizeOptions, EnhancementResponse, PhotoId, RestorationOptions, SharpenOptions,
    UploadMetadata, UploadResponse,
};
use shared::sharpen::{ImageTransform, SharpenError, SharpenParams, SharpenTransform};

pub fn write_png(path: &Path, width: u32, height: u32) {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x * 5 % 256) as u8, (y * 3 % 256) as u8, 90, 255])
    });
    img.save(path).unwrap();
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.png");
    write_png(&path, width, height);
    std::fs::read(path).unwrap()
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|rd| rd.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

fn connection_reset() -> HttpError {
    HttpError::ConnectionError {
        host: "vault.test".into(),
        message: "connection reset".into(),
    }
}

/// Backend that accepts everything except file names containing "bad".
pub struct FakeApi {
    unreachable: AtomicBool,
    delay: Mutex<Duration>,
    attempts: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
    sharpened: Mutex<Vec<(PhotoId, f32, f32, u8)>>,
    next_id: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            unreachable: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            attempts: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
            sharpened: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn sharpened(&self) -> Vec<(PhotoId, f32, f32, u8)> {
        self.sharpened.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhotoApi for FakeApi {
    async fn upload_photo(
        &self,
        artifact: &Path,
        _metadata: &UploadMetadata,
    ) -> Result<UploadResponse, ApiError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApiError::Network(connection_reset()));
        }
        let name = artifact.file_name().unwrap().to_string_lossy().into_owned();
        if name.contains("bad") {
            return Err(ApiError::Rejected {
                status: 422,
                message: "not a photo".into(),
            });
        }
        self.uploaded.lock().unwrap().push(name);
        Ok(UploadResponse {
            success: true,
            photo_id: Some(PhotoId(self.next_id.fetch_add(1, Ordering::SeqCst))),
            extracted_photo_ids: Vec::new(),
        })
    }

    async fn sharpen(
        &self,
        photo_id: PhotoId,
        options: &SharpenOptions,
    ) -> Result<EnhancementResponse, ApiError> {
        self.sharpened.lock().unwrap().push((
            photo_id,
            options.intensity(),
            options.radius(),
            options.threshold(),
        ));
        Ok(EnhancementResponse {
            success: true,
            photo_id: Some(photo_id),
            enhanced_url: Some(format!("https://vault.test/photos/{photo_id}/sharpened.jpg")),
            message: None,
        })
    }

    async fn restore(
        &self,
        _photo_id: PhotoId,
        _options: &RestorationOptions,
    ) -> Result<EnhancementResponse, ApiError> {
        Err(ApiError::Rejected {
            status: 501,
            message: "not scripted".into(),
        })
    }

    async fn colorize(
        &self,
        _photo_id: PhotoId,
        _options: &ColorizeOptions,
    ) -> Result<EnhancementResponse, ApiError> {
        Err(ApiError::Rejected {
            status: 501,
            message: "not scripted".into(),
        })
    }
}

/// Serves `body` for every URL after that URL's scripted failures run out.
pub struct FakeFetcher {
    body: Vec<u8>,
    failures_left: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            failures_left: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_times(&self, url: &str, times: u32) {
        let url = ValidatedUrl::new(url).unwrap().as_str().to_string();
        self.failures_left.lock().unwrap().insert(url, times);
    }

    pub fn calls_for(&self, url: &str) -> usize {
        let url = ValidatedUrl::new(url).unwrap().as_str().to_string();
        self.calls.lock().unwrap().iter().filter(|c| **c == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &ValidatedUrl,
        dest: &Path,
        _progress: Option<&ProgressSender>,
    ) -> Result<u64, HttpError> {
        self.calls.lock().unwrap().push(url.as_str().to_string());
        {
            let mut failures = self.failures_left.lock().unwrap();
            if let Some(left) = failures.get_mut(url.as_str()) {
                if *left > 0 {
                    *left -= 1;
                    return Err(connection_reset());
                }
            }
        }
        tokio::fs::write(dest, &self.body).await.unwrap();
        Ok(self.body.len() as u64)
    }
}

/// Real sharpen transform that remembers the parameters of every call.
pub struct CountingTransform {
    inner: SharpenTransform,
    calls: Mutex<Vec<SharpenParams>>,
}

impl CountingTransform {
    pub fn new() -> Self {
        Self {
            inner: SharpenTransform::with_defaults(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<SharpenParams> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageTransform for CountingTransform {
    async fn apply(&self, input: &Path, params: SharpenParams) -> Result<PathBuf, SharpenError> {
        self.calls.lock().unwrap().push(params);
        self.inner.apply(input, params).await
    }
}
