use std::sync::Arc;

use facegate_core::{DetectionFailure, FaceToken};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{IdentificationEngine, IdentifyError, PipelineOutcome};
use crate::linker::{EnrollmentLinker, LinkError};
use crate::store::{IdentityStore, Person, PersonProfile, StoreError};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Identify(#[from] IdentifyError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("employee number {0} is already registered")]
    DuplicateNumber(i64),
    #[error("no face found in the registration image")]
    NoFace,
    #[error(transparent)]
    Identify(#[from] IdentifyError),
    #[error("failed to link face to the new record: {0}")]
    LinkFailed(#[source] LinkError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
}

/// What the front desk should do with a scanned visitor.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanResult {
    Welcome {
        person: Person,
        confidence: f32,
        token: FaceToken,
    },
    /// Unknown face. `token` is the observation to enroll on registration.
    NeedsRegistration { token: FaceToken },
    DetectionFailed {
        reason: DetectionFailure,
        message: &'static str,
    },
}

/// Scan and registration flows over the pipeline and the identity store.
pub struct Reception {
    engine: IdentificationEngine,
    linker: EnrollmentLinker,
    store: Arc<dyn IdentityStore>,
}

impl Reception {
    pub fn new(engine: IdentificationEngine, store: Arc<dyn IdentityStore>) -> Self {
        let linker = EnrollmentLinker::new(engine.directory());
        Self {
            engine,
            linker,
            store,
        }
    }

    pub fn engine(&self) -> &IdentificationEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub async fn scan(&self, image: Vec<u8>) -> Result<ScanResult, ScanError> {
        match self.engine.identify(image).await {
            PipelineOutcome::Recognized {
                identity,
                confidence,
                observed_token,
            } => match self.store.get(&identity).await? {
                Some(person) => {
                    if let Err(e) = self.store.touch_last_seen(&person.id).await {
                        tracing::warn!(id = %person.id, error = %e, "scan: last_seen not updated");
                    }
                    tracing::info!(id = %person.id, confidence, "scan: welcome");
                    Ok(ScanResult::Welcome {
                        person,
                        confidence,
                        token: observed_token,
                    })
                }
                None => {
                    tracing::warn!(identity = %identity, "scan: recognized identity has no record");
                    Ok(ScanResult::NeedsRegistration {
                        token: observed_token,
                    })
                }
            },
            PipelineOutcome::NewPerson { observed_token } => Ok(ScanResult::NeedsRegistration {
                token: observed_token,
            }),
            PipelineOutcome::DetectionFailed { reason } => Ok(ScanResult::DetectionFailed {
                reason,
                message: reason.message(),
            }),
            PipelineOutcome::Error(err) => Err(err.into()),
        }
    }

    /// Create a record for `profile` and enroll the face in `image` under it.
    ///
    /// The record is removed again if the face cannot be linked.
    pub async fn register(
        &self,
        profile: PersonProfile,
        image: Vec<u8>,
    ) -> Result<Person, RegisterError> {
        let number = profile.employee_number;
        if self.store.find_by_number(number).await?.is_some() {
            return Err(RegisterError::DuplicateNumber(number));
        }

        let token = self
            .engine
            .tokenize_image(image)
            .await?
            .ok_or(RegisterError::NoFace)?;

        let person = self.store.create(profile).await?;

        if let Err(err) = self.linker.link(&token, &person.id).await {
            tracing::warn!(id = %person.id, error = %err, "register: link failed, removing record");
            if let Err(e) = self.store.delete(&person.id).await {
                tracing::error!(id = %person.id, error = %e, "register: could not remove record");
            }
            return Err(RegisterError::LinkFailed(err));
        }

        self.store.attach_face(&person.id, &token).await?;
        tracing::info!(id = %person.id, token = token.short(), "register: enrolled");

        Ok(Person {
            face_token: Some(token),
            ..person
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DecisionPolicy;
    use crate::store::SqliteIdentityStore;
    use crate::testing::{png, FakeDirectory, FixedDetector};

    async fn reception(detector: FixedDetector, directory: Arc<FakeDirectory>) -> Reception {
        let engine = IdentificationEngine::new(Arc::new(detector), directory, DecisionPolicy::default());
        let store = SqliteIdentityStore::open_in_memory().await.unwrap();
        Reception::new(engine, Arc::new(store))
    }

    fn profile(number: i64) -> PersonProfile {
        PersonProfile {
            name: "Grace Hopper".to_string(),
            email: format!("grace{number}@example.com"),
            employee_number: number,
            position: Some("Rear Admiral".to_string()),
            department: Some("Navy".to_string()),
            phone_number: None,
        }
    }

    #[tokio::test]
    async fn test_register_then_welcome() {
        let directory = Arc::new(FakeDirectory::default());
        let reception = reception(FixedDetector::square(150), directory.clone()).await;
        let image = png(640, 480, 11);

        let first = reception.scan(image.clone()).await.unwrap();
        assert!(matches!(first, ScanResult::NeedsRegistration { .. }));

        let person = reception.register(profile(416), image.clone()).await.unwrap();
        assert!(person.face_token.is_some());
        assert_eq!(directory.enrolled(), 1);
        assert_eq!(
            directory.binding(person.face_token.as_ref().unwrap()).as_deref(),
            Some(person.id.as_str())
        );

        match reception.scan(image).await.unwrap() {
            ScanResult::Welcome { person: seen, confidence, .. } => {
                assert_eq!(seen.id, person.id);
                assert!(confidence > 60.0);
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
        let stored = reception.store().get(&person.id).await.unwrap().unwrap();
        assert!(stored.last_seen.is_some());
        assert_eq!(stored.face_token, person.face_token);
    }

    #[tokio::test]
    async fn test_duplicate_number_rejected_before_remote() {
        let directory = Arc::new(FakeDirectory::default());
        let reception = reception(FixedDetector::square(150), directory.clone()).await;

        reception.register(profile(7), png(300, 300, 1)).await.unwrap();
        let calls = directory.tokenize_calls();

        let err = reception.register(profile(7), png(300, 300, 2)).await.unwrap_err();
        assert!(matches!(err, RegisterError::DuplicateNumber(7)));
        assert_eq!(directory.tokenize_calls(), calls);
    }

    #[tokio::test]
    async fn test_link_failure_removes_record() {
        let directory = Arc::new(FakeDirectory {
            reject_add: true,
            ..FakeDirectory::default()
        });
        let reception = reception(FixedDetector::square(150), directory.clone()).await;

        let err = reception.register(profile(9), png(300, 300, 1)).await.unwrap_err();
        assert!(matches!(err, RegisterError::LinkFailed(LinkError::AddRejected)));
        assert!(reception.store().find_by_number(9).await.unwrap().is_none());
        assert_eq!(directory.bind_calls(), 0);
    }

    #[tokio::test]
    async fn test_register_without_remote_face() {
        let directory = Arc::new(FakeDirectory {
            no_remote_face: true,
            ..FakeDirectory::default()
        });
        let reception = reception(FixedDetector::square(150), directory).await;

        let err = reception.register(profile(5), png(300, 300, 1)).await.unwrap_err();
        assert!(matches!(err, RegisterError::NoFace));
        assert!(reception.store().find_by_number(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recognized_without_record_needs_registration() {
        let directory = Arc::new(FakeDirectory::default());
        let reception = reception(FixedDetector::square(150), directory).await;
        let image = png(640, 480, 3);

        let person = reception.register(profile(12), image.clone()).await.unwrap();
        assert!(reception.store().delete(&person.id).await.unwrap());

        let result = reception.scan(image).await.unwrap();
        assert!(matches!(result, ScanResult::NeedsRegistration { .. }));
    }

    #[tokio::test]
    async fn test_scan_detection_failure() {
        let reception = reception(FixedDetector::square(40), Arc::new(FakeDirectory::default())).await;

        match reception.scan(png(400, 400, 1)).await.unwrap() {
            ScanResult::DetectionFailed { reason, message } => {
                assert_eq!(reason, DetectionFailure::TooSmall);
                assert!(message.contains("move closer"));
            }
            other => panic!("expected DetectionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scan_pipeline_error() {
        let reception = reception(FixedDetector::square(150), Arc::new(FakeDirectory::default())).await;
        let err = reception.scan(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, ScanError::Identify(IdentifyError::Validation(_))));
    }

    #[test]
    fn test_scan_result_json() {
        let json = serde_json::to_value(ScanResult::NeedsRegistration {
            token: FaceToken::new("tok"),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"status": "needs_registration", "token": "tok"}));
    }
}
