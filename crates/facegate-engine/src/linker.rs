use std::sync::Arc;

use facegate_core::FaceToken;
use facegate_directory::{DirectoryError, FaceDirectory};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("face directory did not add the face")]
    AddRejected,
    #[error("face directory did not bind the identity")]
    BindRejected,
    #[error("face directory: {0}")]
    Directory(#[from] DirectoryError),
}

/// Enrolls an observed face token and binds it to an identity id.
///
/// Identity records are the caller's concern. A token that is already in the
/// directory is rejected by the remote service, so each token links at most once.
pub struct EnrollmentLinker {
    directory: Arc<dyn FaceDirectory>,
}

impl EnrollmentLinker {
    pub fn new(directory: Arc<dyn FaceDirectory>) -> Self {
        Self { directory }
    }

    pub async fn link(&self, token: &FaceToken, identity_id: &str) -> Result<(), LinkError> {
        let directory = self.directory.ensure_directory().await?;

        if !self.directory.add_face(token, &directory).await? {
            tracing::warn!(token = token.short(), "link: face not added");
            return Err(LinkError::AddRejected);
        }

        if !self.directory.bind_identity(token, identity_id).await? {
            tracing::warn!(token = token.short(), identity_id, "link: identity not bound");
            return Err(LinkError::BindRejected);
        }

        tracing::info!(token = token.short(), identity_id, "link: face enrolled");
        Ok(())
    }
}
