//! In-memory stand-ins for the remote directory and the cascade detector.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::Mutex;

use async_trait::async_trait;
use facegate_core::{
    DetectedRegion, DirectoryHandle, FaceToken, MatchCandidate, PresenceDetector,
};
use facegate_directory::{DirectoryError, FaceDirectory, Operation};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};

/// Detector that reports the same regions for every image.
pub struct FixedDetector(pub Vec<DetectedRegion>);

impl FixedDetector {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn square(side: u32) -> Self {
        Self(vec![DetectedRegion::new(20, 20, side, side)])
    }
}

impl PresenceDetector for FixedDetector {
    fn detect_gray(&self, _gray: &GrayImage) -> Vec<DetectedRegion> {
        self.0.clone()
    }
}

#[derive(Default)]
pub(crate) struct State {
    issued: u32,
    /// Token -> fingerprint of the image it was issued for.
    observed: HashMap<String, u64>,
    /// Enrolled tokens, in insertion order.
    enrolled: Vec<String>,
    bindings: HashMap<String, String>,
    directories_created: u32,
    add_calls: u32,
    bind_calls: u32,
    tokenize_calls: u32,
}

/// Face directory that "recognizes" byte-identical normalized images.
pub struct FakeDirectory {
    pub(crate) state: Mutex<State>,
    pub match_confidence: f32,
    pub miss_confidence: f32,
    pub no_remote_face: bool,
    pub reject_add: bool,
    pub reject_bind: bool,
    pub fail_search: bool,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            match_confidence: 92.0,
            miss_confidence: 18.0,
            no_remote_face: false,
            reject_add: false,
            reject_bind: false,
            fail_search: false,
        }
    }
}

impl FakeDirectory {
    pub fn directories_created(&self) -> u32 {
        self.state.lock().unwrap().directories_created
    }

    pub fn tokenize_calls(&self) -> u32 {
        self.state.lock().unwrap().tokenize_calls
    }

    pub fn add_calls(&self) -> u32 {
        self.state.lock().unwrap().add_calls
    }

    pub fn bind_calls(&self) -> u32 {
        self.state.lock().unwrap().bind_calls
    }

    pub fn enrolled(&self) -> usize {
        self.state.lock().unwrap().enrolled.len()
    }

    pub fn binding(&self, token: &FaceToken) -> Option<String> {
        self.state.lock().unwrap().bindings.get(token.as_str()).cloned()
    }
}

fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl FaceDirectory for FakeDirectory {
    async fn ensure_directory(&self) -> Result<DirectoryHandle, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        if state.directories_created == 0 {
            state.directories_created = 1;
        }
        Ok(DirectoryHandle::new("fs-test"))
    }

    async fn tokenize(&self, image: &[u8]) -> Result<Option<FaceToken>, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        state.tokenize_calls += 1;
        if self.no_remote_face {
            return Ok(None);
        }
        state.issued += 1;
        let token = format!("tok-{:04}-observed", state.issued);
        state.observed.insert(token.clone(), fingerprint(image));
        Ok(Some(FaceToken::new(token)))
    }

    async fn search(
        &self,
        token: &FaceToken,
        _directory: &DirectoryHandle,
    ) -> Result<Option<MatchCandidate>, DirectoryError> {
        if self.fail_search {
            return Err(DirectoryError::Remote {
                operation: Operation::Search,
                status: 500,
                message: "INTERNAL_ERROR".to_string(),
            });
        }
        let state = self.state.lock().unwrap();
        let probe = state.observed.get(token.as_str()).copied();
        let same_face = state
            .enrolled
            .iter()
            .find(|t| state.observed.get(t.as_str()).copied() == probe);

        let (matched, confidence) = match (same_face, state.enrolled.first()) {
            (Some(t), _) => (t, self.match_confidence),
            (None, Some(t)) => (t, self.miss_confidence),
            (None, None) => return Ok(None),
        };
        Ok(Some(MatchCandidate {
            matched_token: FaceToken::new(matched.clone()),
            confidence,
            bound_identity: state.bindings.get(matched).cloned(),
        }))
    }

    async fn add_face(
        &self,
        token: &FaceToken,
        _directory: &DirectoryHandle,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        state.add_calls += 1;
        if self.reject_add || state.enrolled.iter().any(|t| t == token.as_str()) {
            return Ok(false);
        }
        state.enrolled.push(token.as_str().to_string());
        Ok(true)
    }

    async fn bind_identity(
        &self,
        token: &FaceToken,
        identity_id: &str,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        state.bind_calls += 1;
        if self.reject_bind {
            return Ok(false);
        }
        state
            .bindings
            .insert(token.as_str().to_string(), identity_id.to_string());
        Ok(true)
    }
}

/// A `width`x`height` PNG whose pixels depend on `seed`.
pub fn png(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 251) as u8 ^ seed, (y % 241) as u8, seed])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}
