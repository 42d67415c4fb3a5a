//! facegate-engine — Face identification and enrollment pipeline.
//!
//! [`IdentificationEngine`] turns an uploaded image into a
//! [`PipelineOutcome`]: normalize, gate on local presence detection, obtain a
//! remote face token, search the directory and apply the decision policy.
//! [`EnrollmentLinker`] registers a token with an identity. [`Reception`]
//! combines both with an [`IdentityStore`] for the scan/register flows.

pub mod config;
pub mod engine;
pub mod linker;
pub mod reception;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, ConfigError};
pub use engine::{
    DecisionPolicy, IdentificationEngine, IdentifyError, PipelineOutcome,
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MIN_FACE_AREA,
};
pub use linker::{EnrollmentLinker, LinkError};
pub use reception::{Reception, RegisterError, ScanError, ScanResult};
pub use store::{IdentityStore, Person, PersonProfile, SqliteIdentityStore, StoreError};
