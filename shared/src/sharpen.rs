//! Local preview sharpening.
//!
//! The transform approximates sharpening with a down-then-up resample: the
//! image is shrunk by a factor derived from `intensity` and scaled back to
//! its original size with a triangle filter. High intensities add a second
//! fixed-factor pass. `radius` is validated and carried through to the
//! server-side commit but does not change the local result.
//!
//! Decoding and encoding run on the blocking pool, bounded by a semaphore.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader, Limits};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::model::SharpenOptions;

/// Resample factors never go below this.
pub const MIN_FACTOR: f32 = 0.75;
const FACTOR_PER_INTENSITY: f32 = 0.15;
/// Intensities at or above this get a second, fixed-factor pass.
pub const SECOND_PASS_INTENSITY: f32 = 2.0;
const SECOND_PASS_FACTOR: f32 = 0.9;

#[derive(Debug, Error)]
pub enum SharpenError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("failed to encode {format:?} output: {source}")]
    Encode {
        format: ImageFormat,
        #[source]
        source: image::ImageError,
    },

    #[error("image has a zero dimension: {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: u64, max_size: u64 },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sharpen task failed")]
    TaskFailed,

    #[error("service overloaded, try again later")]
    Overloaded,
}

impl SharpenError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_image_pixels: u64,
    pub max_input_bytes: u64,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub max_concurrent_ops: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_image_pixels: 100_000_000,
            max_input_bytes: 50 * 1024 * 1024,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_dimension: crate::MAX_IMAGE_DIMENSION,
            jpeg_quality: 90,
            max_concurrent_ops: 2,
        }
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "sharpen.jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.max_concurrent_ops == 0 {
            return Err(ConfigError::Invalid(
                "sharpen.max_concurrent_ops must be > 0".into(),
            ));
        }
        if self.max_image_pixels == 0 || self.max_input_bytes == 0 || self.max_dimension == 0 {
            return Err(ConfigError::Invalid("sharpen limits must be > 0".into()));
        }
        Ok(())
    }
}

/// Local preview parameters. `apply` expects them inside the accepted
/// ranges; callers go through [`SharpenParams::clamped`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharpenParams {
    pub intensity: f32,
    pub radius: f32,
}

impl Default for SharpenParams {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            radius: 2.0,
        }
    }
}

impl SharpenParams {
    #[must_use]
    pub fn new(intensity: f32, radius: f32) -> Self {
        Self { intensity, radius }.clamped()
    }

    /// Pulls both values into range. Non-finite values fall back to the
    /// defaults.
    #[must_use]
    pub fn clamped(self) -> Self {
        let defaults = Self::default();
        let (lo, hi) = SharpenOptions::INTENSITY_RANGE;
        let intensity = if self.intensity.is_finite() {
            self.intensity.clamp(lo, hi)
        } else {
            defaults.intensity
        };
        let (lo, hi) = SharpenOptions::RADIUS_RANGE;
        let radius = if self.radius.is_finite() {
            self.radius.clamp(lo, hi)
        } else {
            defaults.radius
        };
        Self { intensity, radius }
    }

    #[must_use]
    pub fn is_in_range(&self) -> bool {
        let (ilo, ihi) = SharpenOptions::INTENSITY_RANGE;
        let (rlo, rhi) = SharpenOptions::RADIUS_RANGE;
        (ilo..=ihi).contains(&self.intensity) && (rlo..=rhi).contains(&self.radius)
    }
}

/// Downsample factor for the first pass. `radius` plays no part.
#[must_use]
pub fn resample_factor(intensity: f32) -> f32 {
    (1.0 - intensity * FACTOR_PER_INTENSITY).max(MIN_FACTOR)
}

/// Produces a new image file from an existing one.
#[async_trait]
pub trait ImageTransform: Send + Sync {
    /// The input is never modified and the output is always a fresh path.
    async fn apply(&self, input: &Path, params: SharpenParams) -> Result<PathBuf, SharpenError>;
}

pub struct SharpenTransform {
    config: ProcessingConfig,
    semaphore: Arc<Semaphore>,
}

impl SharpenTransform {
    pub fn new(config: ProcessingConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops));
        Self { config, semaphore }
    }

    pub fn with_defaults() -> Self {
        Self::new(ProcessingConfig::default())
    }

    fn apply_sync(
        config: &ProcessingConfig,
        input: &Path,
        params: SharpenParams,
    ) -> Result<PathBuf, SharpenError> {
        let (img, format) = decode_file(config, input)?;
        let sharpened = sharpen_image(&img, params);

        let (format, extension) = output_format(format);
        let dir = input.parent().unwrap_or_else(|| Path::new("."));
        let output = dir.join(format!("sharpen-{}.{extension}", Uuid::new_v4().simple()));
        let tmp = dir.join(format!(".{}.part", Uuid::new_v4().simple()));

        let written = write_image(&sharpened, format, config.jpeg_quality, &tmp)
            .and_then(|()| std::fs::rename(&tmp, &output).map_err(|e| SharpenError::io("rename output", &tmp, e)));
        if let Err(e) = written {
            if let Err(cleanup) = std::fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %cleanup, "failed to delete intermediate output");
                }
            }
            return Err(e);
        }
        Ok(output)
    }
}

#[async_trait]
impl ImageTransform for SharpenTransform {
    #[instrument(skip(self, input), fields(input = %input.display()))]
    async fn apply(&self, input: &Path, params: SharpenParams) -> Result<PathBuf, SharpenError> {
        debug_assert!(params.is_in_range(), "unclamped sharpen params: {params:?}");

        let _permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| SharpenError::Overloaded)?;

        let config = self.config.clone();
        let input_owned = input.to_path_buf();
        let result = tokio::task::spawn_blocking(move || Self::apply_sync(&config, &input_owned, params))
            .await
            .map_err(|_| SharpenError::TaskFailed)?;

        match &result {
            Ok(output) => debug!(output = %output.display(), "sharpen finished"),
            Err(e) => warn!(error = %e, "sharpen failed"),
        }
        result
    }
}

fn resample(img: &DynamicImage, factor: f32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let scaled = |dim: u32| ((dim as f32 * factor).round() as u32).max(1);
    img.resize_exact(scaled(width), scaled(height), FilterType::Triangle)
        .resize_exact(width, height, FilterType::Triangle)
}

fn sharpen_image(img: &DynamicImage, params: SharpenParams) -> DynamicImage {
    let first = resample(img, resample_factor(params.intensity));
    if params.intensity >= SECOND_PASS_INTENSITY {
        resample(&first, SECOND_PASS_FACTOR)
    } else {
        first
    }
}

fn decode_file(
    config: &ProcessingConfig,
    path: &Path,
) -> Result<(DynamicImage, ImageFormat), SharpenError> {
    let size = std::fs::metadata(path)
        .map_err(|e| SharpenError::io("stat input", path, e))?
        .len();
    if size == 0 {
        return Err(SharpenError::EmptyInput);
    }
    if size > config.max_input_bytes {
        return Err(SharpenError::InputTooLarge {
            size,
            max_size: config.max_input_bytes,
        });
    }
    let raw = std::fs::read(path).map_err(|e| SharpenError::io("read input", path, e))?;
    decode_image(config, &raw)
}

fn decode_image(
    config: &ProcessingConfig,
    raw_bytes: &[u8],
) -> Result<(DynamicImage, ImageFormat), SharpenError> {
    if raw_bytes.is_empty() {
        return Err(SharpenError::EmptyInput);
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| SharpenError::Decode { source: e.into() })?;
    let Some(format) = reader.format() else {
        return Err(SharpenError::UnsupportedFormat);
    };

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader.decode()?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(SharpenError::ZeroDimension { width, height });
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels > config.max_image_pixels {
        return Err(SharpenError::ImageTooLarge {
            width,
            height,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    Ok((img, format))
}

/// JPEG, PNG and WebP round-trip; anything else is written as PNG.
fn output_format(input: ImageFormat) -> (ImageFormat, &'static str) {
    match input {
        ImageFormat::Jpeg => (ImageFormat::Jpeg, "jpg"),
        ImageFormat::WebP => (ImageFormat::WebP, "webp"),
        _ => (ImageFormat::Png, "png"),
    }
}

fn write_image(
    img: &DynamicImage,
    format: ImageFormat,
    jpeg_quality: u8,
    path: &Path,
) -> Result<(), SharpenError> {
    let file = std::fs::File::create(path).map_err(|e| SharpenError::io("create output", path, e))?;
    let mut writer = BufWriter::new(file);
    let encoded = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, jpeg_quality)),
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut writer)),
        _ => img.write_with_encoder(PngEncoder::new(&mut writer)),
    };
    encoded.map_err(|source| SharpenError::Encode { format, source })?;

    let file = writer
        .into_inner()
        .map_err(|e| SharpenError::io("flush output", path, e.into_error()))?;
    file.sync_all()
        .map_err(|e| SharpenError::io("sync output", path, e))?;
    Ok(())
}
