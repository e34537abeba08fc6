use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_CAPTION_BYTES: usize = 2000;
pub const MAX_ENHANCEMENT_TYPE_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },
}

/// Explicit timestamp unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        )
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// Validated queue entry identifier - immutable after construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    const MAX_LENGTH: usize = 64;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), ModelError> {
        if id.is_empty() {
            return Err(ModelError::InvalidId("entry id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "entry id exceeds {} bytes",
                Self::MAX_LENGTH
            )));
        }
        // Ids become file names inside the queue directory.
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ModelError::InvalidId(format!(
                "entry id contains invalid characters: {id}"
            )));
        }
        Ok(())
    }
}

impl TryFrom<String> for EntryId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned photo identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(pub u64);

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Upload metadata and responses
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub caption: Option<String>,
    pub enhancement_type: Option<String>,
    pub source_photo_id: Option<PhotoId>,
}

impl UploadMetadata {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.caption.as_ref().is_some_and(|c| c.len() > MAX_CAPTION_BYTES) {
            return Err(ModelError::TooLong {
                field: "caption",
                max: MAX_CAPTION_BYTES,
            });
        }
        if self
            .enhancement_type
            .as_ref()
            .is_some_and(|t| t.len() > MAX_ENHANCEMENT_TYPE_BYTES)
        {
            return Err(ModelError::TooLong {
                field: "enhancement_type",
                max: MAX_ENHANCEMENT_TYPE_BYTES,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub photo_id: Option<PhotoId>,
    /// Sub-photos found by server-side detection. Empty is a valid success.
    #[serde(default)]
    pub extracted_photo_ids: Vec<PhotoId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancementResponse {
    pub success: bool,
    #[serde(default)]
    pub photo_id: Option<PhotoId>,
    /// Where the enhanced rendition can be fetched from.
    #[serde(default)]
    pub enhanced_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Server-side enhancement options
// ============================================================================

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ModelError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ModelError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharpenMethod {
    #[default]
    UnsharpMask,
    HighPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharpenOptions {
    intensity: f32,
    radius: f32,
    threshold: u8,
    method: SharpenMethod,
}

impl SharpenOptions {
    pub const INTENSITY_RANGE: (f32, f32) = (0.5, 3.0);
    pub const RADIUS_RANGE: (f32, f32) = (1.0, 5.0);

    pub fn new(
        intensity: f32,
        radius: f32,
        threshold: u8,
        method: SharpenMethod,
    ) -> Result<Self, ModelError> {
        let (lo, hi) = Self::INTENSITY_RANGE;
        check_range("intensity", f64::from(intensity), f64::from(lo), f64::from(hi))?;
        let (lo, hi) = Self::RADIUS_RANGE;
        check_range("radius", f64::from(radius), f64::from(lo), f64::from(hi))?;
        Ok(Self {
            intensity,
            radius,
            threshold,
            method,
        })
    }

    #[must_use]
    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    #[must_use]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    #[must_use]
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    #[must_use]
    pub fn method(&self) -> SharpenMethod {
        self.method
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorationModel {
    #[default]
    Codeformer,
    Gfpgan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorationQuality {
    Fast,
    #[default]
    Balanced,
    Best,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RestorationOptions {
    model: RestorationModel,
    quality: RestorationQuality,
    fidelity: f32,
}

impl RestorationOptions {
    pub fn new(
        model: RestorationModel,
        quality: RestorationQuality,
        fidelity: f32,
    ) -> Result<Self, ModelError> {
        check_range("fidelity", f64::from(fidelity), 0.0, 1.0)?;
        Ok(Self {
            model,
            quality,
            fidelity,
        })
    }

    #[must_use]
    pub fn model(&self) -> RestorationModel {
        self.model
    }

    #[must_use]
    pub fn quality(&self) -> RestorationQuality {
        self.quality
    }

    #[must_use]
    pub fn fidelity(&self) -> f32 {
        self.fidelity
    }
}

impl Default for RestorationOptions {
    fn default() -> Self {
        Self {
            model: RestorationModel::default(),
            quality: RestorationQuality::default(),
            fidelity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorizeMode {
    #[default]
    Auto,
    Dnn,
    Basic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorizeOptions {
    pub mode: ColorizeMode,
}
