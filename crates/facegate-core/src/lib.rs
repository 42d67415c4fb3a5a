//! facegate-core — Image normalization and local face presence detection.
//!
//! The normalizer reshapes raw uploads to meet the remote face directory's
//! constraints; the presence detector runs an OpenCV-format Haar cascade on
//! the CPU as a cheap gate before any remote call is made.

pub mod cascade;
pub mod detector;
pub mod normalizer;
pub mod types;

pub use cascade::{Cascade, CascadeError};
pub use detector::{CascadeDetector, DetectorConfig, PresenceDetector};
pub use normalizer::{NormalizedImage, Normalizer, NormalizerConfig, ValidationError};
pub use types::{
    DetectedRegion, DetectionFailure, DirectoryHandle, FaceToken, MatchCandidate, QualityTier,
};
