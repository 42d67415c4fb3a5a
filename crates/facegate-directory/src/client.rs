//! HTTP client for the Face++ v3 faceset API.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use facegate_core::{DirectoryHandle, FaceToken, MatchCandidate};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::protocol::{self, non_empty};
use crate::FaceDirectory;

pub const DEFAULT_API_BASE: &str = "https://api-us.faceplusplus.com/facepp/v3";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote endpoints used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetFaceSets,
    CreateFaceSet,
    Detect,
    Search,
    GetDetail,
    AddFace,
    SetUserId,
}

impl Operation {
    /// Path relative to the API base.
    pub fn path(&self) -> &'static str {
        match self {
            Self::GetFaceSets => "faceset/getfacesets",
            Self::CreateFaceSet => "faceset/create",
            Self::Detect => "detect",
            Self::Search => "search",
            Self::GetDetail => "face/getdetail",
            Self::AddFace => "faceset/addface",
            Self::SetUserId => "face/setuserid",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("{operation} timed out")]
    Timeout { operation: Operation },
    #[error("{operation} request failed: {source}")]
    Transport {
        operation: Operation,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation} rejected (HTTP {status}): {message}")]
    Remote {
        operation: Operation,
        status: u16,
        message: String,
    },
    #[error("{operation} returned a malformed response: {detail}")]
    Malformed { operation: Operation, detail: String },
}

impl DirectoryError {
    fn transport(operation: Operation, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { operation }
        } else {
            Self::Transport { operation, source }
        }
    }

    /// True when the remote service rejected the call with `code`.
    fn is_remote_code(&self, code: &str) -> bool {
        matches!(self, Self::Remote { message, .. } if message.starts_with(code))
    }
}

/// Connection settings for [`FacePlusPlusClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Display name given to the face collection when it has to be created.
    pub display_name: String,
    /// Stable external id of the face collection.
    pub outer_id: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            display_name: "facegate_reception_faceset".to_string(),
            outer_id: "facegate_reception".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// [`FaceDirectory`] backed by the Face++ v3 HTTP API.
///
/// The directory handle is resolved once per client and then reused.
pub struct FacePlusPlusClient {
    http: reqwest::Client,
    config: ClientConfig,
    directory: OnceCell<DirectoryHandle>,
}

impl FacePlusPlusClient {
    pub fn new(config: ClientConfig) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(DirectoryError::Client)?;

        Ok(Self {
            http,
            config,
            directory: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, operation: Operation) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            operation.path()
        )
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        operation: Operation,
        fields: &[(&str, &str)],
    ) -> Result<T, DirectoryError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("api_key", self.config.api_key.as_str()),
            ("api_secret", self.config.api_secret.as_str()),
        ];
        form.extend_from_slice(fields);

        let request = self.http.post(self.url(operation)).form(&form);
        self.execute(operation, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: Operation,
        request: RequestBuilder,
    ) -> Result<T, DirectoryError> {
        let started = Instant::now();

        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::transport(operation, e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| DirectoryError::transport(operation, e))?;

        tracing::info!(
            operation = %operation,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "face directory call"
        );

        decode(operation, status, &body)
    }

    async fn lookup_or_create(&self) -> Result<DirectoryHandle, DirectoryError> {
        if let Some(handle) = self.first_faceset().await? {
            tracing::info!(handle = %handle, "using existing face directory");
            return Ok(handle);
        }

        let created: Result<protocol::CreateFaceSetResponse, _> = self
            .post_form(
                Operation::CreateFaceSet,
                &[
                    ("display_name", self.config.display_name.as_str()),
                    ("outer_id", self.config.outer_id.as_str()),
                ],
            )
            .await;

        match created {
            Ok(body) => {
                tracing::info!(handle = %body.faceset_token, "created face directory");
                Ok(DirectoryHandle::new(body.faceset_token))
            }
            // Another process created it between our lookup and create.
            Err(e) if e.is_remote_code(protocol::FACESET_EXIST) => {
                tracing::warn!("face directory appeared concurrently, re-reading");
                self.first_faceset()
                    .await?
                    .ok_or_else(|| DirectoryError::Malformed {
                        operation: Operation::GetFaceSets,
                        detail: "faceset reported as existing but not listed".to_string(),
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn first_faceset(&self) -> Result<Option<DirectoryHandle>, DirectoryError> {
        let body: protocol::FaceSetsResponse =
            self.post_form(Operation::GetFaceSets, &[]).await?;
        Ok(body
            .facesets
            .into_iter()
            .next()
            .map(|entry| DirectoryHandle::new(entry.faceset_token)))
    }

    /// Resolve the identity bound to `token`. Failures are logged, not returned.
    async fn bound_identity(&self, token: &str) -> Option<String> {
        let detail: Result<protocol::FaceDetailResponse, _> = self
            .post_form(Operation::GetDetail, &[("face_token", token)])
            .await;
        match detail {
            Ok(body) => non_empty(body.user_id),
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve bound identity");
                None
            }
        }
    }
}

/// Parse a response body, surfacing `error_message` as [`DirectoryError::Remote`].
fn decode<T: DeserializeOwned>(
    operation: Operation,
    status: StatusCode,
    body: &[u8],
) -> Result<T, DirectoryError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| DirectoryError::Malformed {
            operation,
            detail: e.to_string(),
        })?;

    if let Some(message) = value.get("error_message").and_then(|m| m.as_str()) {
        return Err(DirectoryError::Remote {
            operation,
            status: status.as_u16(),
            message: message.to_string(),
        });
    }
    if !status.is_success() {
        return Err(DirectoryError::Remote {
            operation,
            status: status.as_u16(),
            message: format!("HTTP {status}"),
        });
    }

    serde_json::from_value(value).map_err(|e| DirectoryError::Malformed {
        operation,
        detail: e.to_string(),
    })
}

#[async_trait]
impl FaceDirectory for FacePlusPlusClient {
    async fn ensure_directory(&self) -> Result<DirectoryHandle, DirectoryError> {
        self.directory
            .get_or_try_init(|| self.lookup_or_create())
            .await
            .cloned()
    }

    async fn tokenize(&self, image: &[u8]) -> Result<Option<FaceToken>, DirectoryError> {
        let part = Part::bytes(image.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| DirectoryError::transport(Operation::Detect, e))?;
        let form = Form::new()
            .text("api_key", self.config.api_key.clone())
            .text("api_secret", self.config.api_secret.clone())
            .part("image_file", part);

        let request = self.http.post(self.url(Operation::Detect)).multipart(form);
        let body: protocol::DetectResponse = self.execute(Operation::Detect, request).await?;

        let token = body
            .faces
            .into_iter()
            .next()
            .map(|face| FaceToken::new(face.face_token));
        match &token {
            Some(t) => tracing::debug!(token = t.short(), "face tokenized"),
            None => tracing::info!("remote detector returned no faces"),
        }
        Ok(token)
    }

    async fn search(
        &self,
        token: &FaceToken,
        directory: &DirectoryHandle,
    ) -> Result<Option<MatchCandidate>, DirectoryError> {
        let searched: Result<protocol::SearchResponse, _> = self
            .post_form(
                Operation::Search,
                &[
                    ("face_token", token.as_str()),
                    ("faceset_token", directory.as_str()),
                ],
            )
            .await;

        let body = match searched {
            Ok(body) => body,
            Err(e) if e.is_remote_code(protocol::EMPTY_FACESET) => {
                tracing::debug!("face directory is empty");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(top) = body.results.into_iter().next() else {
            return Ok(None);
        };

        let bound_identity = self.bound_identity(&top.face_token).await;
        tracing::debug!(
            token = token.short(),
            confidence = top.confidence,
            bound = bound_identity.is_some(),
            "search hit"
        );

        Ok(Some(MatchCandidate {
            matched_token: FaceToken::new(top.face_token),
            confidence: top.confidence,
            bound_identity,
        }))
    }

    async fn add_face(
        &self,
        token: &FaceToken,
        directory: &DirectoryHandle,
    ) -> Result<bool, DirectoryError> {
        let body: protocol::AddFaceResponse = self
            .post_form(
                Operation::AddFace,
                &[
                    ("faceset_token", directory.as_str()),
                    ("face_tokens", token.as_str()),
                ],
            )
            .await?;
        Ok(body.face_added == 1)
    }

    async fn bind_identity(
        &self,
        token: &FaceToken,
        identity_id: &str,
    ) -> Result<bool, DirectoryError> {
        let body: protocol::SetUserIdResponse = self
            .post_form(
                Operation::SetUserId,
                &[("face_token", token.as_str()), ("user_id", identity_id)],
            )
            .await?;
        Ok(body.user_id.as_deref() == Some(identity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn client(server: &ServerGuard) -> FacePlusPlusClient {
        let mut config = ClientConfig::new("key", "secret");
        config.base_url = server.url();
        FacePlusPlusClient::new(config).unwrap()
    }

    fn credentials() -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("api_key".into(), "key".into()),
            Matcher::UrlEncoded("api_secret".into(), "secret".into()),
        ])
    }

    #[tokio::test]
    async fn test_ensure_directory_reuses_existing() {
        let mut server = Server::new_async().await;
        let list = server
            .mock("POST", "/faceset/getfacesets")
            .match_body(credentials())
            .with_header("content-type", "application/json")
            .with_body(r#"{"facesets":[{"faceset_token":"fs-1","outer_id":"facegate_reception"},{"faceset_token":"fs-2"}]}"#)
            .expect(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/faceset/create")
            .expect(0)
            .create_async()
            .await;

        let client = client(&server);
        assert_eq!(client.ensure_directory().await.unwrap().as_str(), "fs-1");
        assert_eq!(client.ensure_directory().await.unwrap().as_str(), "fs-1");

        list.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_directory_creates_once() {
        let mut server = Server::new_async().await;
        let list = server
            .mock("POST", "/faceset/getfacesets")
            .with_body(r#"{"facesets":[]}"#)
            .expect(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/faceset/create")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("outer_id".into(), "facegate_reception".into()),
                Matcher::UrlEncoded("display_name".into(), "facegate_reception_faceset".into()),
            ]))
            .with_body(r#"{"faceset_token":"fs-new","outer_id":"facegate_reception"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server);
        let (a, b) = tokio::join!(client.ensure_directory(), client.ensure_directory());
        assert_eq!(a.unwrap().as_str(), "fs-new");
        assert_eq!(b.unwrap().as_str(), "fs-new");

        list.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_directory_rereads_when_create_races() {
        let mut server = Server::new_async().await;
        let listings = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&listings);
        let list = server
            .mock("POST", "/faceset/getfacesets")
            .with_body_from_request(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    br#"{"facesets":[]}"#.to_vec()
                } else {
                    br#"{"facesets":[{"faceset_token":"fs-other"}]}"#.to_vec()
                }
            })
            .expect(2)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/faceset/create")
            .with_status(400)
            .with_body(r#"{"error_message":"FACESET_EXIST"}"#)
            .expect(1)
            .create_async()
            .await;

        let handle = client(&server).ensure_directory().await.unwrap();
        assert_eq!(handle.as_str(), "fs-other");
        assert_eq!(listings.load(Ordering::SeqCst), 2);

        list.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_tokenize_returns_first_face() {
        let mut server = Server::new_async().await;
        let detect = server
            .mock("POST", "/detect")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="image_file""#.into()),
                Matcher::Regex(r#"name="api_key""#.into()),
            ]))
            .with_body(r#"{"faces":[{"face_token":"tok-a"},{"face_token":"tok-b"}]}"#)
            .create_async()
            .await;

        let token = client(&server).tokenize(b"jpeg-bytes").await.unwrap();
        assert_eq!(token, Some(FaceToken::new("tok-a")));
        detect.assert_async().await;
    }

    #[tokio::test]
    async fn test_tokenize_no_faces() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/detect")
            .with_body(r#"{"faces":[],"image_id":"img"}"#)
            .create_async()
            .await;

        assert_eq!(client(&server).tokenize(b"jpeg-bytes").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_search_resolves_bound_identity() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/search")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("face_token".into(), "probe".into()),
                Matcher::UrlEncoded("faceset_token".into(), "fs-1".into()),
            ]))
            .with_body(r#"{"results":[{"face_token":"enrolled","confidence":87.5,"user_id":""},{"face_token":"other","confidence":40.1}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/face/getdetail")
            .match_body(Matcher::UrlEncoded("face_token".into(), "enrolled".into()))
            .with_body(r#"{"face_token":"enrolled","user_id":"42"}"#)
            .create_async()
            .await;

        let candidate = client(&server)
            .search(&FaceToken::new("probe"), &DirectoryHandle::new("fs-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.matched_token.as_str(), "enrolled");
        assert_eq!(candidate.confidence, 87.5);
        assert_eq!(candidate.bound_identity.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_search_detail_failure_leaves_identity_unresolved() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/search")
            .with_body(r#"{"results":[{"face_token":"enrolled","confidence":91.0}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/face/getdetail")
            .with_status(400)
            .with_body(r#"{"error_message":"INVALID_FACE_TOKEN"}"#)
            .create_async()
            .await;

        let candidate = client(&server)
            .search(&FaceToken::new("probe"), &DirectoryHandle::new("fs-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.bound_identity, None);
    }

    #[tokio::test]
    async fn test_search_empty_user_id_is_unbound() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/search")
            .with_body(r#"{"results":[{"face_token":"enrolled","confidence":75.0}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/face/getdetail")
            .with_body(r#"{"face_token":"enrolled","user_id":""}"#)
            .create_async()
            .await;

        let candidate = client(&server)
            .search(&FaceToken::new("probe"), &DirectoryHandle::new("fs-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.bound_identity, None);
    }

    #[tokio::test]
    async fn test_search_no_results() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/search")
            .with_body(r#"{"results":[]}"#)
            .create_async()
            .await;
        let detail = server
            .mock("POST", "/face/getdetail")
            .expect(0)
            .create_async()
            .await;

        let result = client(&server)
            .search(&FaceToken::new("probe"), &DirectoryHandle::new("fs-1"))
            .await
            .unwrap();
        assert!(result.is_none());
        detail.assert_async().await;
    }

    #[tokio::test]
    async fn test_search_empty_faceset_is_no_match() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/search")
            .with_status(400)
            .with_body(r#"{"error_message":"EMPTY_FACESET","request_id":"r"}"#)
            .create_async()
            .await;

        let result = client(&server)
            .search(&FaceToken::new("probe"), &DirectoryHandle::new("fs-1"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_add_face_requires_exactly_one() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/faceset/addface")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("faceset_token".into(), "fs-1".into()),
                Matcher::UrlEncoded("face_tokens".into(), "new".into()),
            ]))
            .with_body(r#"{"face_added":1,"face_count":3}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/faceset/addface")
            .match_body(Matcher::UrlEncoded("face_tokens".into(), "dup".into()))
            .with_body(r#"{"face_added":0,"face_count":3}"#)
            .create_async()
            .await;

        let client = client(&server);
        let directory = DirectoryHandle::new("fs-1");
        assert!(client.add_face(&FaceToken::new("new"), &directory).await.unwrap());
        assert!(!client.add_face(&FaceToken::new("dup"), &directory).await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_identity_checks_echo() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/face/setuserid")
            .match_body(Matcher::UrlEncoded("user_id".into(), "7".into()))
            .with_body(r#"{"face_token":"tok","user_id":"7"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/face/setuserid")
            .match_body(Matcher::UrlEncoded("user_id".into(), "8".into()))
            .with_body(r#"{"face_token":"tok"}"#)
            .create_async()
            .await;

        let client = client(&server);
        let token = FaceToken::new("tok");
        assert!(client.bind_identity(&token, "7").await.unwrap());
        assert!(!client.bind_identity(&token, "8").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_message_is_remote_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/faceset/addface")
            .with_status(403)
            .with_body(r#"{"error_message":"AUTHENTICATION_ERROR"}"#)
            .create_async()
            .await;

        let err = client(&server)
            .add_face(&FaceToken::new("tok"), &DirectoryHandle::new("fs-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DirectoryError::Remote { operation: Operation::AddFace, status: 403, ref message }
                if message == "AUTHENTICATION_ERROR"
        ));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/detect")
            .with_status(502)
            .with_body("<html>bad gateway</html>")
            .create_async()
            .await;

        let err = client(&server).tokenize(b"jpeg-bytes").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Malformed { operation: Operation::Detect, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        let mut config = ClientConfig::new("key", "secret");
        config.base_url = "http://127.0.0.1:1".to_string();
        let client = FacePlusPlusClient::new(config).unwrap();

        let err = client.ensure_directory().await.unwrap_err();
        assert!(matches!(
            err,
            DirectoryError::Transport { operation: Operation::GetFaceSets, .. }
                | DirectoryError::Timeout { .. }
        ));
    }

    #[test]
    fn test_url_joins_base() {
        let mut config = ClientConfig::new("k", "s");
        config.base_url = "http://localhost:9000/facepp/v3/".to_string();
        let client = FacePlusPlusClient::new(config).unwrap();
        assert_eq!(
            client.url(Operation::AddFace),
            "http://localhost:9000/facepp/v3/faceset/addface"
        );
    }
}
