use std::sync::Arc;

use facegate_core::{
    DetectedRegion, DetectionFailure, FaceToken, MatchCandidate, NormalizedImage, Normalizer,
    PresenceDetector, ValidationError,
};
use facegate_directory::{DirectoryError, FaceDirectory};
use thiserror::Error;

/// Remote confidence a match must strictly exceed to be recognized.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 60.0;

/// Smallest local face area, in square pixels, sent on to the remote service.
pub const DEFAULT_MIN_FACE_AREA: u64 = 2500;

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("invalid image: {0}")]
    Validation(#[from] ValidationError),
    #[error("face directory: {0}")]
    Directory(#[from] DirectoryError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Terminal result of one identification attempt.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The face matched an enrolled token bound to `identity`.
    Recognized {
        identity: String,
        confidence: f32,
        observed_token: FaceToken,
    },
    /// A usable face with no confident, bound match. `observed_token` can be
    /// enrolled as-is.
    NewPerson { observed_token: FaceToken },
    DetectionFailed { reason: DetectionFailure },
    Error(IdentifyError),
}

/// Tunable thresholds for gating and deciding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub confidence_threshold: f32,
    pub min_face_area: u64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            min_face_area: DEFAULT_MIN_FACE_AREA,
        }
    }
}

impl DecisionPolicy {
    /// Local presence gate: the largest region must reach `min_face_area`.
    pub fn gate(&self, regions: &[DetectedRegion]) -> Result<DetectedRegion, DetectionFailure> {
        let largest = DetectedRegion::largest(regions).ok_or(DetectionFailure::NoFace)?;
        if largest.area() < self.min_face_area {
            return Err(DetectionFailure::TooSmall);
        }
        Ok(*largest)
    }

    /// Map a search result to an outcome.
    pub fn decide(&self, observed: FaceToken, candidate: Option<MatchCandidate>) -> PipelineOutcome {
        match candidate {
            Some(MatchCandidate {
                confidence,
                bound_identity: Some(identity),
                ..
            }) if confidence > self.confidence_threshold => PipelineOutcome::Recognized {
                identity,
                confidence,
                observed_token: observed,
            },
            _ => PipelineOutcome::NewPerson {
                observed_token: observed,
            },
        }
    }
}

/// Normalize, gate, tokenize, search, decide.
pub struct IdentificationEngine {
    normalizer: Normalizer,
    detector: Arc<dyn PresenceDetector>,
    directory: Arc<dyn FaceDirectory>,
    policy: DecisionPolicy,
}

impl IdentificationEngine {
    pub fn new(
        detector: Arc<dyn PresenceDetector>,
        directory: Arc<dyn FaceDirectory>,
        policy: DecisionPolicy,
    ) -> Self {
        Self {
            normalizer: Normalizer::default(),
            detector,
            directory,
            policy,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn policy(&self) -> DecisionPolicy {
        self.policy
    }

    pub fn directory(&self) -> Arc<dyn FaceDirectory> {
        Arc::clone(&self.directory)
    }

    /// Run the full pipeline on an uploaded image.
    ///
    /// Every failure is folded into the returned outcome.
    pub async fn identify(&self, image: Vec<u8>) -> PipelineOutcome {
        match self.run(image).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "identify: pipeline error");
                PipelineOutcome::Error(err)
            }
        }
    }

    async fn run(&self, image: Vec<u8>) -> Result<PipelineOutcome, IdentifyError> {
        let normalizer = self.normalizer.clone();
        let detector = Arc::clone(&self.detector);
        let policy = self.policy;

        let gated = tokio::task::spawn_blocking(move || {
            let normalized = normalizer.normalize(&image)?;
            let regions = detector.detect(&normalized.data);
            tracing::debug!(regions = regions.len(), "identify: local detection");
            Ok::<_, ValidationError>(policy.gate(&regions).map(|face| (normalized, face)))
        })
        .await
        .map_err(|e| IdentifyError::Worker(e.to_string()))??;

        let (normalized, face) = match gated {
            Ok(passed) => passed,
            Err(reason) => {
                tracing::info!(%reason, "identify: rejected by local gate");
                return Ok(PipelineOutcome::DetectionFailed { reason });
            }
        };
        tracing::debug!(
            width = face.width,
            height = face.height,
            quality = ?face.quality,
            "identify: face passed local gate"
        );

        let Some(token) = self.directory.tokenize(&normalized.data).await? else {
            return Ok(PipelineOutcome::DetectionFailed {
                reason: DetectionFailure::RemoteProcessingFailed,
            });
        };

        let directory = self.directory.ensure_directory().await?;
        let candidate = self.directory.search(&token, &directory).await?;

        let outcome = self.policy.decide(token, candidate);
        match &outcome {
            PipelineOutcome::Recognized {
                identity,
                confidence,
                observed_token,
            } => tracing::info!(
                identity = %identity,
                confidence,
                token = observed_token.short(),
                "identify: recognized"
            ),
            PipelineOutcome::NewPerson { observed_token } => {
                tracing::info!(token = observed_token.short(), "identify: new person")
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Normalize and tokenize without the local presence gate.
    pub async fn tokenize_image(&self, image: Vec<u8>) -> Result<Option<FaceToken>, IdentifyError> {
        let normalized = self.normalize(image).await?;
        Ok(self.directory.tokenize(&normalized.data).await?)
    }

    async fn normalize(&self, image: Vec<u8>) -> Result<NormalizedImage, IdentifyError> {
        let normalizer = self.normalizer.clone();
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&image))
            .await
            .map_err(|e| IdentifyError::Worker(e.to_string()))??;
        Ok(normalized)
    }
}
