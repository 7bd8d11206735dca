//! Detection decoding and weighted non-max suppression.
//!
//! The detector emits one record per anchor: `[dx, dy, w, h, kp0x, kp0y, ...]` in
//! input-pixel units relative to the anchor center, plus one raw logit per anchor.

use std::cmp::Ordering;

use facemesh_utils::{Point, config::DetectorSettings};

use crate::anchors::{AnchorConfig, AnchorGrid};
use crate::error::{FaceMeshError, Stage};

/// Keypoints emitted by the BlazeFace detectors, named from the subject's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaceKeypoint {
    RightEye = 0,
    LeftEye = 1,
    NoseTip = 2,
    Mouth = 3,
    RightEarTragion = 4,
    LeftEarTragion = 5,
}

impl FaceKeypoint {
    pub const ALL: [FaceKeypoint; 6] = [
        FaceKeypoint::RightEye,
        FaceKeypoint::LeftEye,
        FaceKeypoint::NoseTip,
        FaceKeypoint::Mouth,
        FaceKeypoint::RightEarTragion,
        FaceKeypoint::LeftEarTragion,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Default logit clamp applied before the sigmoid.
pub const DEFAULT_SCORE_CLIP: f32 = 100.0;

/// Candidate count above which NMS buckets candidates into a spatial grid.
const GRID_THRESHOLD: usize = 8;
const GRID_CELLS: usize = 10;

/// Axis-aligned rectangle in normalized `[0, 1]` image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NormalizedRect {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl NormalizedRect {
    pub const fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn from_center(xc: f32, yc: f32, width: f32, height: f32) -> Self {
        Self {
            xmin: xc - width * 0.5,
            ymin: yc - height * 0.5,
            xmax: xc + width * 0.5,
            ymax: yc + height * 0.5,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Finite with positive extent on both axes.
    pub fn is_valid(&self) -> bool {
        [self.xmin, self.ymin, self.xmax, self.ymax]
            .iter()
            .all(|v| v.is_finite())
            && self.xmin < self.xmax
            && self.ymin < self.ymax
    }

    /// Horizontal mirror around `x = 0.5`.
    pub fn mirrored(&self) -> Self {
        Self {
            xmin: 1.0 - self.xmax,
            ymin: self.ymin,
            xmax: 1.0 - self.xmin,
            ymax: self.ymax,
        }
    }
}

/// Intersection over union; zero when either area is non-positive.
pub fn iou(a: &NormalizedRect, b: &NormalizedRect) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let iw = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)).max(0.0);
    let ih = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)).max(0.0);
    let intersection = iw * ih;
    if intersection <= 0.0 {
        return 0.0;
    }

    let union = area_a + area_b - intersection;
    if union <= 0.0 { 0.0 } else { intersection / union }
}

/// A decoded face detection in normalized coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bounding_box: NormalizedRect,
    pub score: f32,
    /// Interleaved `x, y` pairs, one per keypoint.
    pub keypoints: Vec<f32>,
}

impl Detection {
    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len() / 2
    }

    pub fn keypoint_at(&self, index: usize) -> Option<Point> {
        let x = *self.keypoints.get(index * 2)?;
        let y = *self.keypoints.get(index * 2 + 1)?;
        Some(Point::new(x, y))
    }

    pub fn keypoint(&self, keypoint: FaceKeypoint) -> Option<Point> {
        self.keypoint_at(keypoint.index())
    }

    /// Keypoint scaled into pixel coordinates of a `width x height` image.
    pub fn keypoint_px(&self, keypoint: FaceKeypoint, width: u32, height: u32) -> Option<Point> {
        self.keypoint(keypoint)
            .map(|p| Point::new(p.x * width as f32, p.y * height as f32))
    }

    /// New detection with every coordinate passed through `map`.
    pub fn map_points(&self, mut map: impl FnMut(Point) -> Point) -> Detection {
        let min = map(Point::new(self.bounding_box.xmin, self.bounding_box.ymin));
        let max = map(Point::new(self.bounding_box.xmax, self.bounding_box.ymax));
        let mut keypoints = Vec::with_capacity(self.keypoints.len());
        for pair in self.keypoints.chunks_exact(2) {
            let p = map(Point::new(pair[0], pair[1]));
            keypoints.extend_from_slice(&[p.x, p.y]);
        }
        Detection {
            bounding_box: NormalizedRect::new(
                min.x.min(max.x),
                min.y.min(max.y),
                min.x.max(max.x),
                min.y.max(max.y),
            ),
            score: self.score,
            keypoints,
        }
    }

    /// Horizontal mirror (`x -> 1 - x`) of the rect and every keypoint.
    pub fn mirrored(&self) -> Detection {
        self.map_points(|p| Point::new(1.0 - p.x, p.y))
    }
}

/// Parameters for turning raw detector tensors into candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeConfig {
    pub num_keypoints: usize,
    /// Divisor applied to every raw box channel; the detector's input height.
    pub box_scale: f32,
    pub min_score: f32,
    pub nms_threshold: f32,
    pub score_clip: f32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            num_keypoints: FaceKeypoint::ALL.len(),
            box_scale: 128.0,
            min_score: 0.5,
            nms_threshold: 0.3,
            score_clip: DEFAULT_SCORE_CLIP,
        }
    }
}

impl DecodeConfig {
    pub fn from_settings(settings: &DetectorSettings, anchors: &AnchorConfig) -> Self {
        Self {
            box_scale: anchors.input_height as f32,
            min_score: settings.min_score,
            nms_threshold: settings.nms_threshold,
            ..Self::default()
        }
    }

    /// Values per anchor in the box tensor.
    pub fn channels(&self) -> usize {
        4 + 2 * self.num_keypoints
    }
}

/// `1 / (1 + e^-x)` with `x` clamped to `[-limit, limit]`.
pub fn sigmoid_clamped(x: f32, limit: f32) -> f32 {
    let x = x.clamp(-limit, limit);
    1.0 / (1.0 + (-x).exp())
}

/// Decode raw detector output into scored candidates, in anchor order.
///
/// Anchors below `config.min_score` are skipped before their boxes are decoded, and
/// candidates with a degenerate rect are dropped.
pub fn decode_detections(
    raw_boxes: &[f32],
    raw_scores: &[f32],
    anchors: &AnchorGrid,
    config: &DecodeConfig,
) -> Result<Vec<Detection>, FaceMeshError> {
    let channels = config.channels();
    if raw_scores.len() != anchors.len() {
        return Err(FaceMeshError::invalid_output(
            Stage::Detection,
            format!(
                "score tensor has {} values for {} anchors",
                raw_scores.len(),
                anchors.len()
            ),
        ));
    }
    if raw_boxes.len() != anchors.len() * channels {
        return Err(FaceMeshError::invalid_output(
            Stage::Detection,
            format!(
                "box tensor has {} values, expected {} anchors x {} channels",
                raw_boxes.len(),
                anchors.len(),
                channels
            ),
        ));
    }
    if config.box_scale.is_nan() || config.box_scale <= 0.0 {
        return Err(FaceMeshError::invalid_output(
            Stage::Detection,
            "box scale must be positive",
        ));
    }

    let inv_scale = config.box_scale.recip();
    let mut detections = Vec::new();
    for ((anchor, raw), &logit) in anchors
        .as_slice()
        .iter()
        .zip(raw_boxes.chunks_exact(channels))
        .zip(raw_scores)
    {
        let score = sigmoid_clamped(logit, config.score_clip);
        if !score.is_finite() || score < config.min_score {
            continue;
        }

        let xc = raw[0].mul_add(inv_scale, anchor.x_center);
        let yc = raw[1].mul_add(inv_scale, anchor.y_center);
        let bounding_box =
            NormalizedRect::from_center(xc, yc, raw[2] * inv_scale, raw[3] * inv_scale);
        if !bounding_box.is_valid() {
            continue;
        }

        let mut keypoints = Vec::with_capacity(config.num_keypoints * 2);
        for pair in raw[4..].chunks_exact(2) {
            keypoints.push(pair[0].mul_add(inv_scale, anchor.x_center));
            keypoints.push(pair[1].mul_add(inv_scale, anchor.y_center));
        }

        detections.push(Detection {
            bounding_box,
            score,
            keypoints,
        });
    }
    Ok(detections)
}

/// Weighted non-max suppression.
///
/// Candidates are clustered around the highest-scoring remaining seed; every candidate
/// with IoU at or above `threshold` joins the cluster. Single-member clusters are kept
/// unchanged. Larger clusters yield the score-weighted mean rect with the seed's score
/// and keypoints. Output is sorted by score, descending.
pub fn weighted_non_max_suppression(
    mut candidates: Vec<Detection>,
    threshold: f32,
) -> Vec<Detection> {
    candidates.retain(|d| d.score.is_finite() && d.bounding_box.is_valid());
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    if candidates.len() <= 1 {
        return candidates;
    }

    let grid = (candidates.len() > GRID_THRESHOLD && threshold > 0.0)
        .then(|| SpatialGrid::build(&candidates));
    let mut removed = vec![false; candidates.len()];
    let mut kept = Vec::new();
    let mut neighbours = Vec::new();

    for seed in 0..candidates.len() {
        if removed[seed] {
            continue;
        }
        removed[seed] = true;

        neighbours.clear();
        match &grid {
            Some(grid) => grid.neighbours_of(seed, &mut neighbours),
            None => neighbours.extend(seed + 1..candidates.len()),
        }

        let seed_rect = candidates[seed].bounding_box;
        let mut cluster = vec![seed];
        for &other in &neighbours {
            if !removed[other] && iou(&seed_rect, &candidates[other].bounding_box) >= threshold {
                removed[other] = true;
                cluster.push(other);
            }
        }

        kept.push(merge_cluster(&candidates, &cluster));
    }
    kept
}

fn merge_cluster(candidates: &[Detection], cluster: &[usize]) -> Detection {
    let seed = &candidates[cluster[0]];
    if cluster.len() == 1 {
        return seed.clone();
    }

    let mut total = 0.0f32;
    let mut acc = [0.0f32; 4];
    for &index in cluster {
        let d = &candidates[index];
        let r = d.bounding_box;
        total += d.score;
        acc[0] = r.xmin.mul_add(d.score, acc[0]);
        acc[1] = r.ymin.mul_add(d.score, acc[1]);
        acc[2] = r.xmax.mul_add(d.score, acc[2]);
        acc[3] = r.ymax.mul_add(d.score, acc[3]);
    }
    if total <= 0.0 {
        return seed.clone();
    }

    Detection {
        bounding_box: NormalizedRect::new(
            acc[0] / total,
            acc[1] / total,
            acc[2] / total,
            acc[3] / total,
        ),
        score: seed.score,
        keypoints: seed.keypoints.clone(),
    }
}

/// Uniform grid over `[0, 1]^2`; each candidate is registered in every cell it overlaps,
/// so any two intersecting rects share at least one cell.
struct SpatialGrid {
    cells: Vec<Vec<usize>>,
    spans: Vec<CellSpan>,
}

#[derive(Clone, Copy)]
struct CellSpan {
    col0: usize,
    col1: usize,
    row0: usize,
    row1: usize,
}

impl SpatialGrid {
    fn build(candidates: &[Detection]) -> Self {
        let mut cells = vec![Vec::new(); GRID_CELLS * GRID_CELLS];
        let spans: Vec<CellSpan> = candidates
            .iter()
            .map(|d| Self::span(&d.bounding_box))
            .collect();
        for (index, span) in spans.iter().enumerate() {
            for row in span.row0..=span.row1 {
                for col in span.col0..=span.col1 {
                    cells[row * GRID_CELLS + col].push(index);
                }
            }
        }
        Self { cells, spans }
    }

    fn cell_of(v: f32) -> usize {
        let scaled = (v * GRID_CELLS as f32).floor();
        if scaled.is_nan() || scaled <= 0.0 {
            0
        } else {
            (scaled as usize).min(GRID_CELLS - 1)
        }
    }

    fn span(rect: &NormalizedRect) -> CellSpan {
        CellSpan {
            col0: Self::cell_of(rect.xmin),
            col1: Self::cell_of(rect.xmax),
            row0: Self::cell_of(rect.ymin),
            row1: Self::cell_of(rect.ymax),
        }
    }

    /// Lower-scored candidates sharing a cell with `seed`, ascending and deduplicated.
    fn neighbours_of(&self, seed: usize, out: &mut Vec<usize>) {
        let span = self.spans[seed];
        for row in span.row0..=span.row1 {
            for col in span.col0..=span.col1 {
                out.extend(
                    self.cells[row * GRID_CELLS + col]
                        .iter()
                        .copied()
                        .filter(|&i| i > seed),
                );
            }
        }
        out.sort_unstable();
        out.dedup();
    }
}
