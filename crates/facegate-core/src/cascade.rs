//! OpenCV Haar cascade model.
//!
//! Loads the "new" OpenCV cascade XML layout (`<opencv_storage><cascade>`,
//! `stageType = BOOST`, `featureType = HAAR`) such as
//! `haarcascade_frontalface_default.xml`, and evaluates a single detection
//! window against it.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// OpenCV subtracts this from every stage threshold when loading.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;
/// OpenCV HAAR features have at most three weighted rectangles.
const MAX_FEATURE_RECTS: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0} (install OpenCV data or set FACEGATE_CASCADE_PATH)")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade: {0}")]
    Parse(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

// --- XML layout ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
struct CascadeXml {
    #[serde(rename = "stageType")]
    stage_type: String,
    #[serde(rename = "featureType")]
    feature_type: String,
    height: u32,
    width: u32,
    stages: ListXml<StageXml>,
    features: ListXml<FeatureXml>,
}

/// OpenCV serializes sequences as repeated `<_>` children.
#[derive(Deserialize)]
struct ListXml<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct StageXml {
    #[serde(rename = "stageThreshold")]
    stage_threshold: String,
    #[serde(rename = "weakClassifiers")]
    weak_classifiers: ListXml<WeakXml>,
}

#[derive(Deserialize)]
struct WeakXml {
    #[serde(rename = "internalNodes")]
    internal_nodes: String,
    #[serde(rename = "leafValues")]
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: ListXml<String>,
    #[serde(default)]
    tilted: Option<String>,
}

// --- Evaluated model ---

#[derive(Debug, Clone, Copy)]
pub(crate) struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// One split of a weak classifier tree. Children `<= 0` index the leaf table
/// as `-child`.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// A boosted Haar cascade ready for evaluation.
#[derive(Debug, Clone)]
pub struct Cascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl Cascade {
    /// Load a cascade XML file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from its XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let storage: StorageXml =
            quick_xml::de::from_str(xml).map_err(|e| CascadeError::Parse(e.to_string()))?;
        let raw = storage.cascade;

        if raw.stage_type.trim() != "BOOST" {
            return Err(CascadeError::Unsupported(format!(
                "stage type {}",
                raw.stage_type.trim()
            )));
        }
        if raw.feature_type.trim() != "HAAR" {
            return Err(CascadeError::Unsupported(format!(
                "feature type {}",
                raw.feature_type.trim()
            )));
        }
        if raw.width < 3 || raw.height < 3 {
            return Err(CascadeError::Parse(format!(
                "window {}x{} too small",
                raw.width, raw.height
            )));
        }

        let features = raw
            .features
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| parse_feature(i, f, raw.width, raw.height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = raw
            .stages
            .items
            .iter()
            .enumerate()
            .map(|(i, s)| parse_stage(i, s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Parse("cascade has no stages".into()));
        }

        Ok(Self {
            window_width: raw.width,
            window_height: raw.height,
            stages,
            features,
        })
    }

    /// Training window size (width, height).
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run all stages on the window at (`x`, `y`) of `integral`.
    ///
    /// Returns `true` only if every stage accepts the window.
    pub(crate) fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        // Variance normalization over the window shrunk by one pixel per side.
        let inner_w = self.window_width - 2;
        let inner_h = self.window_height - 2;
        let area = (inner_w * inner_h) as f64;
        let sum = integral.sum(x + 1, y + 1, inner_w, inner_h) as f64;
        let sq_sum = integral.sq_sum(x + 1, y + 1, inner_w, inner_h) as f64;
        let nf = area * sq_sum - sum * sum;
        let norm = if nf > 0.0 { nf.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut score = 0.0f32;
            for classifier in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &classifier.nodes[idx as usize];
                    let value = self.feature_value(node.feature, integral, x, y) / norm;
                    idx = if (value as f32) < node.threshold {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break;
                    }
                }
                score += classifier.leaves[(-idx) as usize];
            }
            if score < stage.threshold {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, feature: usize, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight as f64 * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

fn parse_numbers<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>, CascadeError> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|_| CascadeError::Parse(format!("{what}: bad number {tok:?}")))
        })
        .collect()
}

/// Finite, non-negative and integral.
fn is_index(v: f64) -> bool {
    v.is_finite() && v >= 0.0 && v.fract() == 0.0
}

fn parse_feature(
    index: usize,
    raw: &FeatureXml,
    window_width: u32,
    window_height: u32,
) -> Result<HaarFeature, CascadeError> {
    if raw.tilted.as_deref().map(str::trim).is_some_and(|t| t != "0") {
        return Err(CascadeError::Unsupported(format!(
            "feature {index} is tilted"
        )));
    }
    if raw.rects.items.is_empty() || raw.rects.items.len() > MAX_FEATURE_RECTS {
        return Err(CascadeError::Parse(format!(
            "feature {index} has {} rects",
            raw.rects.items.len()
        )));
    }

    let rects = raw
        .rects
        .items
        .iter()
        .map(|text| {
            let v: Vec<f32> = parse_numbers(text, "rect")?;
            if v.len() != 5 {
                return Err(CascadeError::Parse(format!(
                    "feature {index}: rect needs 5 values, got {}",
                    v.len()
                )));
            }
            let limit = window_width.max(window_height) as f32;
            if v[..4].iter().any(|c| !is_index(*c as f64) || *c > limit) || !v[4].is_finite() {
                return Err(CascadeError::Parse(format!(
                    "feature {index}: bad rect {text:?}"
                )));
            }
            let rect = WeightedRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4],
            };
            let fits = |start: u32, len: u32, bound: u32| {
                start.checked_add(len).is_some_and(|end| end <= bound)
            };
            if !fits(rect.x, rect.width, window_width) || !fits(rect.y, rect.height, window_height) {
                return Err(CascadeError::Parse(format!(
                    "feature {index}: rect outside {window_width}x{window_height} window"
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarFeature { rects })
}

fn parse_stage(index: usize, raw: &StageXml, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold = raw
        .stage_threshold
        .trim()
        .parse::<f32>()
        .map_err(|_| CascadeError::Parse(format!("stage {index}: bad threshold")))?
        - STAGE_THRESHOLD_EPS;

    let classifiers = raw
        .weak_classifiers
        .items
        .iter()
        .map(|weak| parse_weak(index, weak, feature_count))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak(
    stage: usize,
    raw: &WeakXml,
    feature_count: usize,
) -> Result<WeakClassifier, CascadeError> {
    let values: Vec<f64> = parse_numbers(&raw.internal_nodes, "internalNodes")?;
    let leaves: Vec<f32> = parse_numbers(&raw.leaf_values, "leafValues")?;

    if values.is_empty() || values.len() % 4 != 0 {
        return Err(CascadeError::Parse(format!(
            "stage {stage}: internalNodes length {} is not a multiple of 4",
            values.len()
        )));
    }

    let node_count = values.len() / 4;
    let mut nodes = Vec::with_capacity(node_count);
    for c in values.chunks_exact(4) {
        let child_ok = |v: f64| v.fract() == 0.0 && v.abs() <= node_count.max(leaves.len()) as f64;
        if !child_ok(c[0]) || !child_ok(c[1]) || !is_index(c[2]) || !c[3].is_finite() {
            return Err(CascadeError::Parse(format!(
                "stage {stage}: bad internal node {:?}",
                &c[..]
            )));
        }
        nodes.push(Node {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3] as f32,
        });
    }

    for (i, node) in nodes.iter().enumerate() {
        if node.feature >= feature_count {
            return Err(CascadeError::Parse(format!(
                "stage {stage}: feature index {} out of range",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            // Splits are stored parent-first, so a forward reference rules out cycles.
            let ok = if child > 0 {
                (child as usize) > i && (child as usize) < nodes.len()
            } else {
                ((-child) as usize) < leaves.len()
            };
            if !ok {
                return Err(CascadeError::Parse(format!(
                    "stage {stage}: dangling child {child}"
                )));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

/// Summed-area tables of a grayscale image and of its squares.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &[u8], width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = gray[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            stride,
            sum,
            sq_sum,
        }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }

    pub fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    pub fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }
}
