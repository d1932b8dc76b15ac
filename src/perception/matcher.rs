//! Template matching.
//!
//! The similarity search itself is a pluggable [`SimilaritySearch`]
//! backend; the [`Matcher`] owns everything around it: region cropping,
//! scale tolerance, peak picking, thresholding, overlap policy and
//! result ordering.

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{match_template_parallel, MatchTemplateMethod};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::geometry::Rect;
use crate::capture::Frame;

/// What to do with several hits of the same template that overlap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Greedy non-max suppression: drop a hit whose IoU with a stronger
    /// kept hit exceeds `iou`.
    Suppress { iou: f32 },
    /// Return every local peak above threshold.
    KeepAll,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        OverlapPolicy::Suppress { iou: 0.3 }
    }
}

/// A named reference image plus how to search for it.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub image: GrayImage,
    /// Minimum confidence for a hit, in (0, 1]
    pub threshold: f32,
    /// Region-of-interest hint used when the caller gives no region
    pub region: Option<Rect>,
    /// Scale factors tried to absorb resolution drift
    pub scales: Vec<f32>,
    pub overlap: OverlapPolicy,
    pub max_matches: usize,
}

impl Template {
    pub fn new(id: impl Into<String>, image: GrayImage, threshold: f32) -> Self {
        Self {
            id: id.into(),
            image,
            threshold,
            region: None,
            scales: vec![1.0],
            overlap: OverlapPolicy::default(),
            max_matches: 8,
        }
    }

    pub fn with_region(mut self, region: Rect) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_scales(mut self, scales: Vec<f32>) -> Self {
        self.scales = scales;
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_max_matches(mut self, max_matches: usize) -> Self {
        self.max_matches = max_matches;
        self
    }

    /// Load the reference image from disk, converted to luma.
    pub fn load(id: impl Into<String>, path: &Path, threshold: f32) -> Result<Self, MatchError> {
        let image = image::open(path)
            .map_err(|e| MatchError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .to_luma8();
        if image.width() == 0 || image.height() == 0 {
            return Err(MatchError::EmptyTemplate(path.display().to_string()));
        }
        Ok(Self::new(id, image, threshold))
    }
}

/// Template loading errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchError {
    #[error("Failed to load template {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Template image is empty: {0}")]
    EmptyTemplate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub template_id: String,
    pub bbox: Rect,
    pub confidence: f32,
    pub frame_timestamp: DateTime<Utc>,
}

/// Dense similarity scores: one value per placement of the needle's
/// top-left corner inside the haystack.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMap {
    pub width: u32,
    pub height: u32,
    pub scores: Vec<f32>,
}

impl ScoreMap {
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            scores: Vec::new(),
        }
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.scores[(y * self.width + x) as usize]
    }

    /// True when no neighbour in the 3x3 window scores higher.
    fn is_peak(&self, x: u32, y: u32) -> bool {
        let center = self.get(x, y);
        let x0 = x.saturating_sub(1);
        let y0 = y.saturating_sub(1);
        let x1 = (x + 1).min(self.width - 1);
        let y1 = (y + 1).min(self.height - 1);
        for ny in y0..=y1 {
            for nx in x0..=x1 {
                if self.get(nx, ny) > center {
                    return false;
                }
            }
        }
        true
    }
}

/// Similarity-search capability provider.
pub trait SimilaritySearch: Send + Sync {
    fn name(&self) -> &str;

    /// Scores in [0, 1]. Returns an empty map when the needle does not fit.
    fn score_map(&self, haystack: &GrayImage, needle: &GrayImage) -> ScoreMap;
}

/// Zero-mean normalized cross-correlation. imageproc computes the raw
/// correlation surface (in parallel) and the integral images that give each
/// window's mean and variance. Negative correlation is clamped to 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizedCrossCorrelation;

/// Sum over the `w` x `h` window at (x, y) of an integral image.
fn window_sum(table: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> f64 {
    let at = |x: u32, y: u32| table.get_pixel(x, y)[0];
    ((at(x + w, y + h) - at(x + w, y)) - (at(x, y + h) - at(x, y))) as f64
}

impl SimilaritySearch for NormalizedCrossCorrelation {
    fn name(&self) -> &str {
        "ncc"
    }

    fn score_map(&self, haystack: &GrayImage, needle: &GrayImage) -> ScoreMap {
        let (hw, hh) = haystack.dimensions();
        let (nw, nh) = needle.dimensions();
        if nw == 0 || nh == 0 || nw > hw || nh > hh {
            return ScoreMap::empty();
        }

        let n = (nw * nh) as f64;
        let needle_mean = needle.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
        let needle_norm = needle
            .pixels()
            .map(|p| (p[0] as f64 - needle_mean).powi(2))
            .sum::<f64>()
            .sqrt();

        let cross = match_template_parallel(haystack, needle, MatchTemplateMethod::CrossCorrelation);
        let sums: Image<Luma<u64>> = integral_image::<_, u64>(haystack);
        let squares: Image<Luma<u64>> = integral_squared_image::<_, u64>(haystack);

        let (out_w, out_h) = cross.dimensions();
        let mut scores = Vec::with_capacity((out_w * out_h) as usize);
        for y in 0..out_h {
            for x in 0..out_w {
                let sum = window_sum(&sums, x, y, nw, nh);
                let window_var = (window_sum(&squares, x, y, nw, nh) - sum * sum / n).max(0.0);

                let score = if needle_norm < 1e-9 {
                    // Flat needle: compare brightness only
                    if window_var < 1e-6 {
                        1.0 - ((sum / n - needle_mean).abs() / 255.0)
                    } else {
                        0.0
                    }
                } else if window_var < 1e-6 {
                    0.0
                } else {
                    // sum(I * (T - mean_T)) = sum(I * T) - mean_T * sum(I)
                    let centred = cross.get_pixel(x, y)[0] as f64 - needle_mean * sum;
                    centred / (needle_norm * window_var.sqrt())
                };
                scores.push(score.clamp(0.0, 1.0) as f32);
            }
        }

        ScoreMap {
            width: out_w,
            height: out_h,
            scores,
        }
    }
}

/// Finds templates in frames.
pub struct Matcher {
    backend: Box<dyn SimilaritySearch>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Box::new(NormalizedCrossCorrelation))
    }
}

impl Matcher {
    pub fn new(backend: Box<dyn SimilaritySearch>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Search every template. `region` overrides each template's own hint.
    /// Results are sorted by descending confidence, ties broken by smaller
    /// box area. No hits is an empty vector, never an error.
    pub fn find(&self, frame: &Frame, templates: &[Template], region: Option<Rect>) -> Vec<MatchResult> {
        let mut results: Vec<MatchResult> = templates
            .iter()
            .flat_map(|t| self.find_one(frame.luma(), t, region, frame.captured_at()))
            .collect();
        sort_results(&mut results);
        results
    }

    pub fn find_one(
        &self,
        luma: &GrayImage,
        template: &Template,
        region: Option<Rect>,
        frame_timestamp: DateTime<Utc>,
    ) -> Vec<MatchResult> {
        let search = region
            .or(template.region)
            .unwrap_or_else(|| Rect::new(0, 0, luma.width(), luma.height()));
        let search = match search.clamp_to(luma.width(), luma.height()) {
            Some(r) => r,
            None => return Vec::new(),
        };

        let haystack = imageops::crop_imm(luma, search.x as u32, search.y as u32, search.width, search.height)
            .to_image();

        let mut candidates = Vec::new();
        for &scale in &template.scales {
            let needle = match scaled(&template.image, scale) {
                Some(needle) => needle,
                None => continue,
            };
            let map = self.backend.score_map(&haystack, &needle);
            for y in 0..map.height {
                for x in 0..map.width {
                    let confidence = map.get(x, y);
                    if confidence < template.threshold || !map.is_peak(x, y) {
                        continue;
                    }
                    candidates.push(MatchResult {
                        template_id: template.id.clone(),
                        bbox: Rect::new(x as i32, y as i32, needle.width(), needle.height())
                            .translate(search.x, search.y),
                        confidence,
                        frame_timestamp,
                    });
                }
            }
        }

        sort_results(&mut candidates);
        let mut kept = match template.overlap {
            OverlapPolicy::Suppress { iou } => suppress(candidates, iou),
            OverlapPolicy::KeepAll => candidates,
        };
        kept.truncate(template.max_matches);
        kept
    }
}

fn scaled(image: &GrayImage, scale: f32) -> Option<GrayImage> {
    if !(scale.is_finite() && scale > 0.0) {
        return None;
    }
    if (scale - 1.0).abs() < f32::EPSILON {
        return Some(image.clone());
    }
    let w = (image.width() as f32 * scale).round() as u32;
    let h = (image.height() as f32 * scale).round() as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::resize(image, w, h, FilterType::Triangle))
}

/// Greedy NMS over results already sorted best-first.
fn suppress(sorted: Vec<MatchResult>, max_iou: f32) -> Vec<MatchResult> {
    let mut kept: Vec<MatchResult> = Vec::new();
    for candidate in sorted {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

/// Descending confidence, then smaller area, then a stable positional order.
pub(crate) fn sort_results(results: &mut [MatchResult]) {
    results.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.bbox.area().cmp(&b.bbox.area()))
            .then_with(|| a.template_id.cmp(&b.template_id))
            .then_with(|| (a.bbox.y, a.bbox.x).cmp(&(b.bbox.y, b.bbox.x)))
    });
}
