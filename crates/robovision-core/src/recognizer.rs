//! Face recognizer seam and a Local Binary Pattern Histogram (LBPH) implementation.
//!
//! LBPH describes a face crop as a grid of per-cell histograms of circular
//! LBP codes and predicts the identity of the nearest training histogram
//! under a chi-square distance.

use crate::types::{IdentityId, Prediction};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

const LBPH_FORMAT: &str = "lbph";
const LBPH_FORMAT_VERSION: u32 = 1;
const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer has not been trained")]
    NotTrained,
    #[error("cannot train on an empty sample set")]
    EmptyTrainingSet,
    #[error("{samples} samples but {ids} identity ids")]
    LengthMismatch { samples: usize, ids: usize },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("corrupt model artifact {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A trainable face recognizer.
pub trait Recognizer {
    /// Replace any previous state with a model of `samples`, where `ids[i]` labels `samples[i]`.
    fn train(&mut self, samples: &[GrayImage], ids: &[IdentityId]) -> Result<(), RecognizerError>;

    /// Nearest known identity for `sample`.
    fn predict(&self, sample: &GrayImage) -> Result<Prediction, RecognizerError>;

    fn save(&self, path: &Path) -> Result<(), RecognizerError>;

    fn load(path: &Path) -> Result<Self, RecognizerError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn validate(&self) -> Result<(), String> {
        if self.radius == 0 {
            return Err("radius must be at least 1".into());
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(format!("neighbors must be in 1..={MAX_NEIGHBORS}"));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err("grid must have at least one cell".into());
        }
        Ok(())
    }

    fn patterns(&self) -> usize {
        1usize << self.neighbors
    }

    fn histogram_len(&self) -> usize {
        self.patterns() * (self.grid_x * self.grid_y) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainedHistogram {
    id: IdentityId,
    histogram: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct LbphModelFile {
    format: String,
    version: u32,
    params: LbphParams,
    entries: Vec<TrainedHistogram>,
}

#[derive(Debug, Clone)]
pub struct LbphRecognizer {
    params: LbphParams,
    trained: Vec<TrainedHistogram>,
}

impl Default for LbphRecognizer {
    fn default() -> Self {
        Self {
            params: LbphParams::default(),
            trained: Vec::new(),
        }
    }
}

impl LbphRecognizer {
    pub fn new(params: LbphParams) -> Result<Self, RecognizerError> {
        params.validate().map_err(RecognizerError::InvalidParams)?;
        Ok(Self {
            params,
            trained: Vec::new(),
        })
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn is_trained(&self) -> bool {
        !self.trained.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.trained.len()
    }

    fn histogram(&self, sample: &GrayImage) -> Vec<f32> {
        let (codes, w, h) = lbp_codes(sample, self.params.radius, self.params.neighbors);
        spatial_histogram(&codes, w, h, &self.params)
    }
}

impl Recognizer for LbphRecognizer {
    fn train(&mut self, samples: &[GrayImage], ids: &[IdentityId]) -> Result<(), RecognizerError> {
        if samples.len() != ids.len() {
            return Err(RecognizerError::LengthMismatch {
                samples: samples.len(),
                ids: ids.len(),
            });
        }
        if samples.is_empty() {
            return Err(RecognizerError::EmptyTrainingSet);
        }

        let trained: Vec<TrainedHistogram> = samples
            .iter()
            .zip(ids)
            .map(|(s, &id)| TrainedHistogram {
                id,
                histogram: self.histogram(s),
            })
            .collect();
        self.trained = trained;
        tracing::debug!(samples = self.trained.len(), params = ?self.params, "LBPH trained");
        Ok(())
    }

    fn predict(&self, sample: &GrayImage) -> Result<Prediction, RecognizerError> {
        let query = self.histogram(sample);
        self.trained
            .iter()
            .map(|t| Prediction {
                id: t.id,
                distance: chi_square_alt(&t.histogram, &query),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .ok_or(RecognizerError::NotTrained)
    }

    fn save(&self, path: &Path) -> Result<(), RecognizerError> {
        if !self.is_trained() {
            return Err(RecognizerError::NotTrained);
        }
        let io_err = |source: std::io::Error| RecognizerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::File::create(path).map_err(io_err)?;
        let doc = LbphModelFile {
            format: LBPH_FORMAT.to_string(),
            version: LBPH_FORMAT_VERSION,
            params: self.params,
            entries: self.trained.clone(),
        };
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &doc).map_err(|e| io_err(e.into()))?;
        std::io::Write::flush(&mut writer).map_err(io_err)?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Self, RecognizerError> {
        let corrupt = |reason: String| RecognizerError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        let file = std::fs::File::open(path).map_err(|source| RecognizerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: LbphModelFile =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;

        if doc.format != LBPH_FORMAT || doc.version != LBPH_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format {} v{}", doc.format, doc.version)));
        }
        doc.params.validate().map_err(corrupt)?;
        if doc.entries.is_empty() {
            return Err(corrupt("no trained histograms".into()));
        }
        let expected = doc.params.histogram_len();
        if let Some(bad) = doc.entries.iter().find(|e| e.histogram.len() != expected) {
            return Err(corrupt(format!(
                "histogram for identity {} has {} bins, expected {expected}",
                bad.id,
                bad.histogram.len()
            )));
        }

        tracing::info!(path = %path.display(), samples = doc.entries.len(), "loaded LBPH model");
        Ok(Self {
            params: doc.params,
            trained: doc.entries,
        })
    }
}

/// Circular LBP codes of every pixel at least `radius` away from the border.
///
/// Returns the codes row-major together with their width and height.
fn lbp_codes(img: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let r = radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let (out_w, out_h) = (w - 2 * r, h - 2 * r);
    let px = |row: usize, col: usize| img.get_pixel(col as u32, row as u32).0[0] as f64;

    let mut codes = vec![0u32; out_w * out_h];
    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f64 / neighbors as f64;
        let x = radius as f64 * angle.cos();
        let y = -(radius as f64) * angle.sin();
        let (fx, fy) = (x.floor(), y.floor());
        let (cx, cy) = (x.ceil(), y.ceil());
        let (tx, ty) = (x - fx, y - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let at = |base: usize, delta: f64| (base as i64 + delta as i64) as usize;

        for i in r..h - r {
            for j in r..w - r {
                let t = w1 * px(at(i, fy), at(j, fx))
                    + w2 * px(at(i, fy), at(j, cx))
                    + w3 * px(at(i, cy), at(j, fx))
                    + w4 * px(at(i, cy), at(j, cx));
                let c = px(i, j);
                if t > c || (t - c).abs() < f32::EPSILON as f64 {
                    codes[(i - r) * out_w + (j - r)] |= 1 << n;
                }
            }
        }
    }
    (codes, out_w, out_h)
}

/// Concatenated, per-cell normalized histograms over a `grid_x`×`grid_y` grid.
fn spatial_histogram(codes: &[u32], w: usize, h: usize, params: &LbphParams) -> Vec<f32> {
    let bins = params.patterns();
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let (cell_w, cell_h) = (w / gx, h / gy);
    let mut out = vec![0.0f32; params.histogram_len()];
    if cell_w == 0 || cell_h == 0 {
        return out;
    }

    let total = (cell_w * cell_h) as f32;
    for row in 0..gy {
        for col in 0..gx {
            let hist = &mut out[(row * gx + col) * bins..][..bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for &code in &codes[y * w + col * cell_w..y * w + (col + 1) * cell_w] {
                    hist[code as usize] += 1.0;
                }
            }
            hist.iter_mut().for_each(|v| *v /= total);
        }
    }
    out
}

/// Symmetric chi-square distance: `2 * Σ (a - b)² / (a + b)`.
fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            let (a, b) = (a as f64, b as f64);
            let sum = a + b;
            if sum > f64::EPSILON {
                2.0 * (a - b).powi(2) / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stripes(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, _| Luma([if (x / 2) % 2 == 0 { 30 } else { 220 }]))
    }

    fn checker(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| Luma([if (x / 3 + y / 3) % 2 == 0 { 10 } else { 240 }]))
    }

    fn noise(size: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let v = (x * 7919 + y * 104729 + seed * 31).wrapping_mul(2654435761);
            Luma([(v >> 24) as u8])
        })
    }

    #[test]
    fn test_lbp_code_right_neighbor_only() {
        let mut img = GrayImage::from_pixel(3, 3, Luma([0]));
        img.put_pixel(1, 1, Luma([100]));
        img.put_pixel(2, 1, Luma([200]));
        let (codes, w, h) = lbp_codes(&img, 1, 8);
        assert_eq!((w, h), (1, 1));
        assert_eq!(codes, vec![1]);
    }

    #[test]
    fn test_lbp_code_extremes() {
        let mut dark_center = GrayImage::from_pixel(3, 3, Luma([200]));
        dark_center.put_pixel(1, 1, Luma([10]));
        assert_eq!(lbp_codes(&dark_center, 1, 8).0, vec![255]);

        let mut bright_center = GrayImage::from_pixel(3, 3, Luma([10]));
        bright_center.put_pixel(1, 1, Luma([200]));
        assert_eq!(lbp_codes(&bright_center, 1, 8).0, vec![0]);

        // Equal neighbours count as "not darker".
        assert_eq!(lbp_codes(&GrayImage::from_pixel(3, 3, Luma([50])), 1, 8).0, vec![255]);
    }

    #[test]
    fn test_lbp_too_small_image() {
        let (codes, w, h) = lbp_codes(&GrayImage::new(2, 9), 1, 8);
        assert!(codes.is_empty());
        assert_eq!((w, h), (0, 0));
    }

    #[test]
    fn test_cell_histograms_are_normalized() {
        let params = LbphParams::default();
        let (codes, w, h) = lbp_codes(&noise(34, 1), params.radius, params.neighbors);
        let hist = spatial_histogram(&codes, w, h, &params);
        assert_eq!(hist.len(), params.histogram_len());
        for cell in hist.chunks(params.patterns()) {
            let sum: f32 = cell.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "cell sums to {sum}");
        }
    }

    #[test]
    fn test_chi_square_alt() {
        assert_eq!(chi_square_alt(&[0.5, 0.5], &[0.5, 0.5]), 0.0);
        // 2 * (1 / 1 + 1 / 1) = 4
        assert!((chi_square_alt(&[1.0, 0.0], &[0.0, 1.0]) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_predict_nearest_identity() {
        let mut rec = LbphRecognizer::default();
        rec.train(
            &[stripes(40), checker(40), noise(40, 3)],
            &[IdentityId(0), IdentityId(1), IdentityId(2)],
        )
        .unwrap();

        let p = rec.predict(&checker(40)).unwrap();
        assert_eq!(p.id, IdentityId(1));
        assert!(p.distance.abs() < 1e-9);

        let p = rec.predict(&stripes(40)).unwrap();
        assert_eq!(p.id, IdentityId(0));
    }

    #[test]
    fn test_predict_untrained() {
        let rec = LbphRecognizer::default();
        assert!(matches!(rec.predict(&stripes(16)), Err(RecognizerError::NotTrained)));
    }

    #[test]
    fn test_train_validates_input() {
        let mut rec = LbphRecognizer::default();
        assert!(matches!(
            rec.train(&[stripes(16)], &[]),
            Err(RecognizerError::LengthMismatch { samples: 1, ids: 0 })
        ));
        assert!(matches!(rec.train(&[], &[]), Err(RecognizerError::EmptyTrainingSet)));
    }

    #[test]
    fn test_invalid_params() {
        let params = LbphParams { neighbors: 20, ..LbphParams::default() };
        assert!(matches!(LbphRecognizer::new(params), Err(RecognizerError::InvalidParams(_))));
    }

    #[test]
    fn test_save_load_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut rec = LbphRecognizer::default();
        rec.train(&[stripes(32), checker(32)], &[IdentityId(4), IdentityId(9)]).unwrap();
        rec.save(&path).unwrap();

        let loaded = LbphRecognizer::load(&path).unwrap();
        assert_eq!(loaded.params(), rec.params());
        assert_eq!(loaded.sample_count(), 2);
        let probe = noise(32, 8);
        assert_eq!(loaded.predict(&probe).unwrap(), rec.predict(&probe).unwrap());
    }

    #[test]
    fn test_load_rejects_truncated_histograms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(
            &path,
            r#"{"format":"lbph","version":1,
               "params":{"radius":1,"neighbors":8,"grid_x":8,"grid_y":8},
               "entries":[{"id":0,"histogram":[0.5,0.5]}]}"#,
        )
        .unwrap();
        assert!(matches!(LbphRecognizer::load(&path), Err(RecognizerError::Corrupt { .. })));
    }

    #[test]
    fn test_save_untrained_refused() {
        let dir = tempfile::tempdir().unwrap();
        let rec = LbphRecognizer::default();
        assert!(matches!(
            rec.save(&dir.path().join("m.json")),
            Err(RecognizerError::NotTrained)
        ));
    }
}
