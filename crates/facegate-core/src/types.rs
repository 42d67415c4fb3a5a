use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length (pixels) at which a detected face counts as good quality.
pub const GOOD_QUALITY_SIDE: u32 = 100;

/// Coarse quality label attached to a detected face region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Both sides at least [`GOOD_QUALITY_SIDE`] pixels.
    Good,
    Acceptable,
}

/// Axis-aligned face rectangle reported by the local presence detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub quality: QualityTier,
}

impl DetectedRegion {
    /// Build a region, deriving its quality tier from the rectangle size.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        let quality = if width >= GOOD_QUALITY_SIDE && height >= GOOD_QUALITY_SIDE {
            QualityTier::Good
        } else {
            QualityTier::Acceptable
        };
        Self {
            x,
            y,
            width,
            height,
            quality,
        }
    }

    /// Area in square pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Pick the region with the largest area. Ties keep the first one seen.
    pub fn largest(regions: &[DetectedRegion]) -> Option<&DetectedRegion> {
        regions.iter().fold(None, |best: Option<&DetectedRegion>, r| match best {
            Some(b) if b.area() >= r.area() => Some(b),
            _ => Some(r),
        })
    }
}

/// Opaque identifier the remote directory issues for one face observation.
///
/// Only meaningful to the remote service, and only for the image it was
/// issued for. Never reuse a token across images.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceToken(String);

impl FaceToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First ten characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(10) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for FaceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of the remote face collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryHandle(String);

impl DirectoryHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirectoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Best-ranked result of a directory search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub matched_token: FaceToken,
    /// Remote similarity score in [0, 100]. A fuzzy percentage, not a probability.
    pub confidence: f32,
    /// External identity bound to `matched_token`, if it could be resolved.
    pub bound_identity: Option<String>,
}

/// Why a submitted image did not yield a usable face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionFailure {
    /// The local detector found no face at all.
    NoFace,
    /// The largest local face is below the minimum area.
    TooSmall,
    /// The local detector saw a face but the remote service returned no token.
    RemoteProcessingFailed,
}

impl DetectionFailure {
    /// User-facing hint for each failure.
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoFace => {
                "No face detected in the image. Please ensure your face is clearly visible."
            }
            Self::TooSmall => "Face detected but too small. Please move closer to the camera.",
            Self::RemoteProcessingFailed => {
                "Face detected but could not be processed. Please try again."
            }
        }
    }
}

impl fmt::Display for DetectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoFace => "no_face",
            Self::TooSmall => "too_small",
            Self::RemoteProcessingFailed => "remote_processing_failed",
        };
        f.write_str(reason)
    }
}
