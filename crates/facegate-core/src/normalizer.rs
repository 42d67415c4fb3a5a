//! Image normalization for the remote face directory.
//!
//! Decodes an upload, rejects images that are too small to carry a usable
//! face, downsamples oversized images, and re-encodes everything as JPEG
//! under the remote service's upload cap.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbImage};
use thiserror::Error;

// --- Remote upload constraints ---
pub const MIN_DIMENSION: u32 = 100;
pub const MAX_DIMENSION: u32 = 2048;
pub const JPEG_QUALITY: u8 = 85;
pub const MAX_ENCODED_BYTES: usize = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("unreadable image: {0}")]
    Unreadable(String),
    #[error("image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("image too large after re-encoding: {bytes} bytes")]
    TooLarge { bytes: usize },
    #[error("failed to encode image: {0}")]
    EncodeFailed(String),
}

impl ValidationError {
    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unreadable(_) => "unreadable",
            Self::TooSmall { .. } => "too_small",
            Self::TooLarge { .. } => "too_large",
            Self::EncodeFailed(_) => "encode_failed",
        }
    }
}

/// Limits applied by [`Normalizer`].
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub max_encoded_bytes: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_dimension: MIN_DIMENSION,
            max_dimension: MAX_DIMENSION,
            jpeg_quality: JPEG_QUALITY,
            max_encoded_bytes: MAX_ENCODED_BYTES,
        }
    }
}

/// JPEG bytes ready for upload, with their pixel dimensions.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Stateless image normalizer.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Decode, validate, downsample and re-encode `input`.
    pub fn normalize(&self, input: &[u8]) -> Result<NormalizedImage, ValidationError> {
        let decoded =
            image::load_from_memory(input).map_err(|e| ValidationError::Unreadable(e.to_string()))?;

        let (width, height) = (decoded.width(), decoded.height());
        tracing::debug!(width, height, bytes = input.len(), "normalize: decoded upload");

        if width.min(height) < self.config.min_dimension {
            return Err(ValidationError::TooSmall { width, height });
        }

        let resized = match fit_within(width, height, self.config.max_dimension) {
            Some((new_w, new_h)) => {
                tracing::info!(width, height, new_w, new_h, "normalize: downsampling");
                // Triangle support scales with the reduction ratio, so every
                // source pixel is averaged into the output.
                decoded.resize_exact(new_w, new_h, FilterType::Triangle)
            }
            None => decoded,
        };

        let rgb = flatten_alpha(&resized);
        let data = encode_jpeg(&rgb, self.config.jpeg_quality)?;

        tracing::debug!(
            width = rgb.width(),
            height = rgb.height(),
            bytes = data.len(),
            "normalize: encoded"
        );

        if data.len() > self.config.max_encoded_bytes {
            return Err(ValidationError::TooLarge { bytes: data.len() });
        }

        Ok(NormalizedImage {
            data,
            width: rgb.width(),
            height: rgb.height(),
        })
    }
}

/// Target size that brings the larger side down to `max_dimension`, or `None`
/// when the image already fits.
fn fit_within(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    if width <= max_dimension && height <= max_dimension {
        return None;
    }
    let scaled = |side: u32, larger: u32| -> u32 {
        ((side as u64 * max_dimension as u64) / larger as u64).max(1) as u32
    };
    if width > height {
        Some((max_dimension, scaled(height, width)))
    } else {
        Some((scaled(width, height), max_dimension))
    }
}

/// Composite any alpha channel onto a white background.
fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as f32 / 255.0;
        let blend = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ValidationError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .map_err(|e| ValidationError::EncodeFailed(e.to_string()))?;
    Ok(buffer)
}
