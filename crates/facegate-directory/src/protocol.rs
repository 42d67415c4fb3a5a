//! Face++ v3 response bodies. Only the fields the client reads are modeled.

use serde::Deserialize;

/// Remote error code returned by `search` against a collection with no faces.
pub(crate) const EMPTY_FACESET: &str = "EMPTY_FACESET";

/// Remote error code returned by `faceset/create` when the outer id is taken.
pub(crate) const FACESET_EXIST: &str = "FACESET_EXIST";

#[derive(Debug, Deserialize)]
pub(crate) struct FaceSetsResponse {
    #[serde(default)]
    pub facesets: Vec<FaceSetEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FaceSetEntry {
    pub faceset_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateFaceSetResponse {
    pub faceset_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetectResponse {
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetectedFace {
    pub face_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResult {
    pub face_token: String,
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddFaceResponse {
    #[serde(default)]
    pub face_added: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SetUserIdResponse {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FaceDetailResponse {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Treat an empty `user_id` the same as an absent one.
pub(crate) fn non_empty(user_id: Option<String>) -> Option<String> {
    user_id.filter(|id| !id.is_empty())
}
