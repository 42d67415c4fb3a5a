use std::path::{Path, PathBuf};
use std::time::Duration;

use facegate_core::{CascadeDetector, CascadeError, DetectorConfig};
use facegate_directory::{ClientConfig, DirectoryError, FacePlusPlusClient, DEFAULT_API_BASE};
use thiserror::Error;

use crate::engine::{DecisionPolicy, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MIN_FACE_AREA};

/// Where OpenCV packages usually install the frontal face cascade.
const CASCADE_SEARCH_PATHS: &[&str] = &[
    "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
    "/usr/share/opencv/haarcascades/haarcascade_frontalface_default.xml",
    "/usr/local/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
    "haarcascade_frontalface_default.xml",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("FACEGATE_API_KEY and FACEGATE_API_SECRET must be set")]
    MissingCredentials,
    #[error("cascade: {0}")]
    Cascade(#[from] CascadeError),
    #[error("directory client: {0}")]
    Directory(#[from] DirectoryError),
}

/// Pipeline configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_secret: String,
    /// Face++ v3 endpoint root.
    pub api_base: String,
    /// Display name of the face collection, used only when creating it.
    pub directory_name: String,
    pub directory_outer_id: String,
    /// Per-request timeout for remote calls.
    pub request_timeout_secs: u64,
    /// OpenCV Haar cascade XML for local presence detection.
    pub cascade_path: PathBuf,
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Remote confidence a match must exceed to count as recognized.
    pub confidence_threshold: f32,
    /// Smallest local face area (square pixels) worth a remote call.
    pub min_face_area: u64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    pub min_window: u32,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<f64>().ok());

        Self {
            api_key: var("FACEGATE_API_KEY").unwrap_or_default(),
            api_secret: var("FACEGATE_API_SECRET").unwrap_or_default(),
            api_base: var("FACEGATE_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            directory_name: var("FACEGATE_DIRECTORY_NAME")
                .unwrap_or_else(|| "facegate_reception_faceset".to_string()),
            directory_outer_id: var("FACEGATE_DIRECTORY_OUTER_ID")
                .unwrap_or_else(|| "facegate_reception".to_string()),
            request_timeout_secs: parsed("FACEGATE_REQUEST_TIMEOUT_SECS")
                .filter(|v| *v >= 1.0)
                .map(|v| v as u64)
                .unwrap_or(10),
            cascade_path: var("FACEGATE_CASCADE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_cascade_path),
            db_path: var("FACEGATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("people.db")),
            confidence_threshold: parsed("FACEGATE_CONFIDENCE_THRESHOLD")
                .map(|v| v as f32)
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            min_face_area: parsed("FACEGATE_MIN_FACE_AREA")
                .map(|v| v as u64)
                .unwrap_or(DEFAULT_MIN_FACE_AREA),
            scale_factor: parsed("FACEGATE_SCALE_FACTOR")
                .unwrap_or(facegate_core::detector::DEFAULT_SCALE_FACTOR),
            min_neighbors: parsed("FACEGATE_MIN_NEIGHBORS")
                .map(|v| v as u32)
                .unwrap_or(facegate_core::detector::DEFAULT_MIN_NEIGHBORS),
            min_window: parsed("FACEGATE_MIN_WINDOW")
                .map(|v| v as u32)
                .unwrap_or(facegate_core::detector::DEFAULT_MIN_WINDOW),
        }
    }

    pub fn policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            confidence_threshold: self.confidence_threshold,
            min_face_area: self.min_face_area,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_window: self.min_window,
        }
    }

    /// Remote client settings. Fails when credentials are missing.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(ClientConfig {
            base_url: self.api_base.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            display_name: self.directory_name.clone(),
            outer_id: self.directory_outer_id.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }

    pub fn build_directory(&self) -> Result<FacePlusPlusClient, ConfigError> {
        Ok(FacePlusPlusClient::new(self.client_config()?)?)
    }

    pub fn load_detector(&self) -> Result<CascadeDetector, ConfigError> {
        Ok(CascadeDetector::load(&self.cascade_path, self.detector_config())?)
    }
}

fn default_cascade_path() -> PathBuf {
    CASCADE_SEARCH_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new(CASCADE_SEARCH_PATHS[0]))
        .to_path_buf()
}
