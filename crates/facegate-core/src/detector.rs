//! Local face presence detection with a Haar cascade.
//!
//! Multi-scale sliding-window scan over an image pyramid, followed by
//! neighbor-consensus grouping of the raw hits. Purely local and CPU-bound;
//! intended as a cheap gate in front of the remote face directory.

use crate::cascade::{Cascade, IntegralImage};
use crate::types::DetectedRegion;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use std::path::Path;

// --- Named constants ---
pub const DEFAULT_SCALE_FACTOR: f64 = 1.1;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 5;
pub const DEFAULT_MIN_WINDOW: u32 = 30;
/// Relative tolerance for two hits to count as the same face.
const GROUP_EPS: f64 = 0.2;

/// Something that can find face-like regions in a grayscale image.
pub trait PresenceDetector: Send + Sync {
    /// Detect faces in a single-channel luminance image.
    fn detect_gray(&self, gray: &GrayImage) -> Vec<DetectedRegion>;

    /// Decode `image` and detect faces in it.
    ///
    /// Undecodable input yields no regions rather than an error.
    fn detect(&self, image: &[u8]) -> Vec<DetectedRegion> {
        match image::load_from_memory(image) {
            Ok(decoded) => self.detect_gray(&luminance(&decoded)),
            Err(err) => {
                tracing::warn!(error = %err, "presence detector could not decode image");
                Vec::new()
            }
        }
    }
}

/// Scan parameters for [`CascadeDetector`].
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Pyramid step between consecutive scales (> 1.0).
    pub scale_factor: f64,
    /// Raw hits a face needs besides itself to be reported. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest window side, in source pixels, worth scanning.
    pub min_window: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_window: DEFAULT_MIN_WINDOW,
        }
    }
}

/// Haar cascade face detector.
pub struct CascadeDetector {
    cascade: Cascade,
    config: DetectorConfig,
}

impl CascadeDetector {
    pub fn new(cascade: Cascade, config: DetectorConfig) -> Self {
        let config = DetectorConfig {
            // A factor of 1.0 or less would never leave the first scale.
            scale_factor: if config.scale_factor > 1.0 {
                config.scale_factor
            } else {
                tracing::warn!(
                    scale_factor = config.scale_factor,
                    "scale factor must exceed 1.0; using default"
                );
                DEFAULT_SCALE_FACTOR
            },
            ..config
        };
        Self { cascade, config }
    }

    /// Load the cascade XML at `path`.
    pub fn load(
        path: impl AsRef<Path>,
        config: DetectorConfig,
    ) -> Result<Self, crate::cascade::CascadeError> {
        Ok(Self::new(Cascade::load(path)?, config))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Every window the cascade accepts, in source-image coordinates.
    fn scan(&self, gray: &GrayImage) -> Vec<Rect> {
        let (win_w, win_h) = self.cascade.window_size();
        let (img_w, img_h) = gray.dimensions();
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_win_w = (win_w as f64 * factor).round() as u32;
            let scaled_win_h = (win_h as f64 * factor).round() as u32;
            if scaled_win_w > img_w || scaled_win_h > img_h {
                break;
            }
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            if scaled_win_w >= self.config.min_window && scaled_win_h >= self.config.min_window {
                let resized;
                let level = if scaled_w == img_w && scaled_h == img_h {
                    gray
                } else {
                    resized = image::imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle);
                    &resized
                };
                let integral = IntegralImage::new(level.as_raw(), scaled_w, scaled_h);
                let step = if factor > 2.0 { 1 } else { 2 };
                let before = hits.len();

                for y in (0..=scaled_h - win_h).step_by(step) {
                    for x in (0..=scaled_w - win_w).step_by(step) {
                        if self.cascade.evaluate(&integral, x, y) {
                            hits.push(Rect {
                                x: (x as f64 * factor).round() as i64,
                                y: (y as f64 * factor).round() as i64,
                                width: scaled_win_w as i64,
                                height: scaled_win_h as i64,
                            });
                        }
                    }
                }

                tracing::trace!(factor, hits = hits.len() - before, "cascade scale scanned");
            }

            factor *= self.config.scale_factor;
        }

        hits
    }
}

impl PresenceDetector for CascadeDetector {
    fn detect_gray(&self, gray: &GrayImage) -> Vec<DetectedRegion> {
        let hits = self.scan(gray);
        let raw = hits.len();
        let grouped = group_rectangles(hits, self.config.min_neighbors, GROUP_EPS);

        let (img_w, img_h) = gray.dimensions();
        let regions: Vec<DetectedRegion> = grouped
            .into_iter()
            .filter_map(|r| clip(r, img_w, img_h))
            .collect();

        tracing::info!(raw_hits = raw, faces = regions.len(), "local presence detection");
        regions
    }
}

/// Convert to 8-bit luminance with BT.601 weights (the cascade's training space).
pub fn luminance(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        // Fixed-point 0.299 R + 0.587 G + 0.114 B, rounded.
        let v = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14;
        image::Luma([v.min(255) as u8])
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i64,
    y: i64,
    width: i64,
    height: i64,
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * ((a.width.min(b.width) + a.height.min(b.height)) as f64) * 0.5;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.x + a.width - b.x - b.width).abs() as f64 <= delta
        && (a.y + a.height - b.y - b.height).abs() as f64 <= delta
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster overlapping hits and keep clusters with more than `min_neighbors`
/// members, averaged into one rectangle each. Clusters that sit inside a
/// better-supported cluster are dropped.
fn group_rectangles(hits: Vec<Rect>, min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits;
    }

    let n = hits.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&hits[i], &hits[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // root -> (sum rect, members)
    let mut clusters: Vec<(usize, Rect, i64)> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let root = find(&mut parent, i);
        match clusters.iter_mut().find(|(r, _, _)| *r == root) {
            Some((_, sum, count)) => {
                sum.x += hit.x;
                sum.y += hit.y;
                sum.width += hit.width;
                sum.height += hit.height;
                *count += 1;
            }
            None => clusters.push((root, *hit, 1)),
        }
    }

    let averaged: Vec<(Rect, i64)> = clusters
        .into_iter()
        .filter(|(_, _, count)| *count > min_neighbors as i64)
        .map(|(_, sum, count)| {
            let avg = |v: i64| (v as f64 / count as f64).round() as i64;
            (
                Rect {
                    x: avg(sum.x),
                    y: avg(sum.y),
                    width: avg(sum.width),
                    height: avg(sum.height),
                },
                count,
            )
        })
        .collect();

    averaged
        .iter()
        .enumerate()
        .filter(|(i, (inner, inner_n))| {
            !averaged.iter().enumerate().any(|(j, (outer, outer_n))| {
                if *i == j {
                    return false;
                }
                let dx = (outer.width as f64 * eps).round() as i64;
                let dy = (outer.height as f64 * eps).round() as i64;
                let inside = inner.x >= outer.x - dx
                    && inner.y >= outer.y - dy
                    && inner.x + inner.width <= outer.x + outer.width + dx
                    && inner.y + inner.height <= outer.y + outer.height + dy;
                inside && (*outer_n > (*inner_n).max(3) || *inner_n < 3)
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}

/// Clamp a rectangle to the image; drops it if nothing is left.
fn clip(r: Rect, img_w: u32, img_h: u32) -> Option<DetectedRegion> {
    let x0 = r.x.clamp(0, img_w as i64);
    let y0 = r.y.clamp(0, img_h as i64);
    let x1 = (r.x + r.width).clamp(0, img_w as i64);
    let y1 = (r.y + r.height).clamp(0, img_h as i64);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(DetectedRegion::new(
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    ))
}
