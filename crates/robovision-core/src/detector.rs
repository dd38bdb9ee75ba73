//! Face detection seam and the SCRFD detector that ships with RoboVision.
//!
//! Training and recognition only depend on the [`Detector`] trait; the
//! SCRFD model (anchor-free, three strides, NMS) is one implementation of it.

use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0} (place det_10g.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can locate faces in a grayscale frame.
///
/// Returned regions must lie within `frame`; extraction treats any region
/// that does not as a contract violation.
pub trait Detector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Placement of the resized frame inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    new_width: u32,
    new_height: u32,
    offset_x: u32,
    offset_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            new_width,
            new_height,
            offset_x: (size - new_width) / 2,
            offset_y: (size - new_height) / 2,
        }
    }

    /// Map a point from model-input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Decoded detection in frame coordinates, before clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Clamp to the frame and round outward to whole pixels.
    fn to_region(self, width: u32, height: u32) -> Option<FaceRegion> {
        let x1 = self.x1.max(0.0).floor() as u32;
        let y1 = self.y1.max(0.0).floor() as u32;
        let x2 = (self.x2.min(width as f32).ceil().max(0.0) as u32).min(width);
        let y2 = (self.y2.min(height as f32).ceil().max(0.0) as u32).min(height);
        (x2 > x1 && y2 > y1).then(|| FaceRegion::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Output tensor positions for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD face detector running on ONNX Runtime.
pub struct ScrfdDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = discover_outputs(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded SCRFD detector");

        Ok(Self {
            session,
            outputs,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn input_tensor(frame: &GrayImage, lb: &Letterbox) -> Array4<f32> {
        let resized = image::imageops::resize(frame, lb.new_width, lb.new_height, FilterType::Triangle);
        let size = SCRFD_INPUT_SIZE as usize;
        // Padding is filled with zero, which is what SCRFD_MEAN normalizes to.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in resized.enumerate_pixels() {
            let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (ty, tx) = ((y + lb.offset_y) as usize, (x + lb.offset_x) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }
        tensor
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let lb = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let input = Self::input_tensor(frame, &lb);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, _kps_idx) = self.outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores at stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes at stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, bboxes, stride, &lb, self.confidence_threshold));
        }

        let regions: Vec<FaceRegion> = nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|c| c.to_region(width, height))
            .collect();
        tracing::debug!(faces = regions.len(), width, height, "SCRFD detection");
        Ok(regions)
    }
}

/// Map output tensors to strides by name (`score_8`, `bbox_16`, ...),
/// falling back to the conventional `[scores, bboxes, kps]` layout.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: u32| names.iter().position(|n| *n == format!("{kind}_{stride}"));

    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match by_name {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: u32,
    lb: &Letterbox,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > threshold)
        .filter_map(|i| {
            let off = bboxes.get(i * 4..i * 4 + 4)?;
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;
            let (x1, y1) = lb.to_frame(cx - off[0] * step, cy - off[1] * step);
            let (x2, y2) = lb.to_frame(cx + off[2] * step, cy + off[3] * step);
            Some(Candidate { x1, y1, x2, y2, score: scores[i] })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by descending score.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter = Candidate {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}
