//! facegate-directory — Remote face directory access.
//!
//! The remote service owns all face matching: it issues a token per observed
//! face, keeps a single collection ("faceset") of enrolled tokens, and binds
//! each enrolled token to an external identity id. [`FaceDirectory`] is the
//! narrow protocol the pipeline depends on; [`FacePlusPlusClient`] speaks it
//! over HTTP.

pub mod client;
mod protocol;

pub use client::{ClientConfig, DirectoryError, FacePlusPlusClient, Operation, DEFAULT_API_BASE};

use async_trait::async_trait;
use facegate_core::{DirectoryHandle, FaceToken, MatchCandidate};

/// The five remote operations the identification pipeline relies on.
///
/// No method retries. Any transport or protocol failure is returned as a
/// [`DirectoryError`]; an empty result set is never an error.
#[async_trait]
pub trait FaceDirectory: Send + Sync {
    /// Look up the deployment's face collection, creating it if none exists.
    async fn ensure_directory(&self) -> Result<DirectoryHandle, DirectoryError>;

    /// Submit a normalized image and return the first face token, if any.
    async fn tokenize(&self, image: &[u8]) -> Result<Option<FaceToken>, DirectoryError>;

    /// Search `directory` for the best match of `token`.
    async fn search(
        &self,
        token: &FaceToken,
        directory: &DirectoryHandle,
    ) -> Result<Option<MatchCandidate>, DirectoryError>;

    /// Add `token` to `directory`. `true` iff exactly one face was newly added.
    async fn add_face(
        &self,
        token: &FaceToken,
        directory: &DirectoryHandle,
    ) -> Result<bool, DirectoryError>;

    /// Bind an enrolled token to an external identity id.
    async fn bind_identity(&self, token: &FaceToken, identity_id: &str)
        -> Result<bool, DirectoryError>;
}
