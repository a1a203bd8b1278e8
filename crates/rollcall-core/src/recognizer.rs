//! LBPH face recognizer.
//!
//! Faces are described by circular local binary patterns, summarised as a
//! grid of per-cell histograms, and matched to the training set by
//! chi-square distance. The distance is reported as the confidence.

use crate::types::{ChiSquareMatcher, FaceSize, Histogram, Matcher, RecognitionResult, TrainedFace};
use image::GrayImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const LBPH_RADIUS: u32 = 1;
const LBPH_NEIGHBORS: u32 = 8;
const LBPH_GRID: u32 = 8;
/// Interpolated samples this close to the centre pixel count as equal to it.
const SAMPLE_EPS: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("trained model not found: {0} — run `rollcall train` first")]
    ModelNotFound(String),
    #[error("failed to read trained model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("trained model is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
}

/// Local binary pattern sampling and histogram grid layout.
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
            radius: LBPH_RADIUS,
            neighbors: LBPH_NEIGHBORS,
            grid_x: LBPH_GRID,
            grid_y: LBPH_GRID,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), RecognizerError> {
        if self.radius == 0 || self.neighbors == 0 || self.neighbors > 16 {
            return Err(RecognizerError::InvalidParams(format!(
                "radius {} / neighbors {} (need radius >= 1 and 1..=16 neighbors)",
                self.radius, self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(RecognizerError::InvalidParams("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Spatial LBP histogram for an already size-normalised face.
    pub fn histogram(&self, face: &GrayImage) -> Histogram {
        let codes = lbp_codes(face, self.radius, self.neighbors);
        spatial_histogram(&codes, self.bins(), self.grid_x as usize, self.grid_y as usize)
    }
}

/// Serialized training output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    pub params: LbphParams,
    pub face_size: FaceSize,
    pub faces: Vec<TrainedFace>,
}

impl LbphModel {
    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| RecognizerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let model: LbphModel = serde_json::from_str(&text)?;
        model.params.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<(), RecognizerError> {
        let io_err = |source| RecognizerError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string(self)?;
        std::fs::write(path, text).map_err(io_err)
    }
}

/// Anything that maps a normalised face image to a closest identity and distance.
pub trait Recognizer {
    fn predict(&self, face: &GrayImage) -> RecognitionResult;
}

/// Nearest-neighbour LBPH recognizer over a trained model.
pub struct LbphRecognizer {
    model: LbphModel,
}

impl LbphRecognizer {
    pub fn new(model: LbphModel) -> Self {
        Self { model }
    }

    /// Load a model previously written by training.
    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        let model = LbphModel::load(path)?;
        tracing::info!(
            path = %path.display(),
            faces = model.faces.len(),
            face_size = %model.face_size,
            "loaded LBPH model"
        );
        Ok(Self::new(model))
    }

    /// Face size the model was trained with; queries must match it.
    pub fn face_size(&self) -> FaceSize {
        self.model.face_size
    }
}

impl Recognizer for LbphRecognizer {
    fn predict(&self, face: &GrayImage) -> RecognitionResult {
        let query = self.model.params.histogram(face);
        ChiSquareMatcher.nearest(&query, &self.model.faces)
    }
}

/// Extended (circular) LBP codes with bilinear neighbour sampling.
///
/// The output is `radius` pixels smaller than the input on every side.
fn lbp_codes(src: &GrayImage, radius: u32, neighbors: u32) -> Array2<u32> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let r = radius as i64;
    let out_w = (w - 2 * r).max(0) as usize;
    let out_h = (h - 2 * r).max(0) as usize;
    let mut codes = Array2::<u32>::zeros((out_h, out_w));
    if out_w == 0 || out_h == 0 {
        return codes;
    }

    let px = |x: i64, y: i64| src.get_pixel(x as u32, y as u32)[0] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / neighbors as f64;
        let x = (radius as f64 * angle.cos()) as f32;
        let y = (-(radius as f64) * angle.sin()) as f32;
        let (fx, fy) = (x.floor() as i64, y.floor() as i64);
        let (cx, cy) = (x.ceil() as i64, y.ceil() as i64);
        let (tx, ty) = (x - fx as f32, y - fy as f32);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..(h - r) {
            for j in r..(w - r) {
                let t = w1 * px(j + fx, i + fy) + w2 * px(j + cx, i + fy) + w3 * px(j + fx, i + cy) + w4 * px(j + cx, i + cy);
                let center = px(j, i);
                if t > center || (t - center).abs() < SAMPLE_EPS {
                    codes[[(i - r) as usize, (j - r) as usize]] += 1 << n;
                }
            }
        }
    }
    codes
}

/// Concatenate `grid_x * grid_y` per-cell histograms, each normalised by cell area.
fn spatial_histogram(codes: &Array2<u32>, bins: usize, grid_x: usize, grid_y: usize) -> Histogram {
    let (rows, cols) = codes.dim();
    let cell_w = cols / grid_x;
    let cell_h = rows / grid_y;
    let mut values = vec![0.0f32; grid_x * grid_y * bins];
    if cell_w == 0 || cell_h == 0 {
        return Histogram { values };
    }

    let cell_total = (cell_w * cell_h) as f32;
    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let base = (gy * grid_x + gx) * bins;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    let code = codes[[y, x]] as usize;
                    if code < bins {
                        values[base + code] += 1.0;
                    }
                }
            }
            for v in &mut values[base..base + bins] {
                *v /= cell_total;
            }
        }
    }
    Histogram { values }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(w: u32, h: u32, phase: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 3 + phase) % 256) as u8]))
    }

    fn checker(w: u32, h: u32, cell: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Luma([30])
            } else {
                Luma([220])
            }
        })
    }

    #[test]
    fn test_lbp_flat_image_sets_all_bits() {
        // Every neighbour equals the centre, which counts as "not darker".
        let codes = lbp_codes(&GrayImage::from_pixel(5, 5, Luma([100])), 1, 8);
        assert_eq!(codes.dim(), (3, 3));
        assert!(codes.iter().all(|&c| c == 255));
    }

    #[test]
    fn test_lbp_bright_center_is_zero() {
        let mut img = GrayImage::from_pixel(3, 3, Luma([10]));
        img.put_pixel(1, 1, Luma([200]));
        let codes = lbp_codes(&img, 1, 8);
        assert_eq!(codes[[0, 0]], 0);
    }

    #[test]
    fn test_histogram_cells_are_normalised() {
        let params = LbphParams::default();
        let hist = params.histogram(&gradient(66, 66, 0));
        assert_eq!(hist.values.len(), 64 * 256);
        for cell in hist.values.chunks(256) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "cell sums to {total}");
        }
    }

    #[test]
    fn test_histogram_tiny_image_is_empty() {
        let hist = LbphParams::default().histogram(&GrayImage::new(4, 4));
        assert!(hist.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_predict_prefers_matching_texture() {
        let params = LbphParams::default();
        let size = FaceSize::new(64, 64);
        let model = LbphModel {
            params,
            face_size: size,
            faces: vec![
                TrainedFace { label: 0, histogram: params.histogram(&gradient(64, 64, 0)) },
                TrainedFace { label: 1, histogram: params.histogram(&checker(64, 64, 4)) },
            ],
        };
        let recognizer = LbphRecognizer::new(model);

        let result = recognizer.predict(&checker(64, 64, 4));
        assert_eq!(result.identity_id, Some(1));
        assert!(result.confidence < 1e-9);

        let result = recognizer.predict(&gradient(64, 64, 5));
        assert_eq!(result.identity_id, Some(0));
    }

    #[test]
    fn test_model_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer").join("trainer.json");
        let params = LbphParams::default();
        let model = LbphModel {
            params,
            face_size: FaceSize::new(32, 32),
            faces: vec![TrainedFace { label: 4, histogram: params.histogram(&gradient(32, 32, 1)) }],
        };
        model.save(&path).unwrap();

        let recognizer = LbphRecognizer::load(&path).unwrap();
        assert_eq!(recognizer.face_size(), FaceSize::new(32, 32));
        assert_eq!(recognizer.predict(&gradient(32, 32, 1)).identity_id, Some(4));
    }

    #[test]
    fn test_load_missing_model() {
        let err = LbphRecognizer::load(Path::new("/nonexistent/trainer.json")).err().unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
        assert!(err.to_string().contains("rollcall train"));
    }

    #[test]
    fn test_load_corrupt_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(LbphModel::load(&path), Err(RecognizerError::Corrupt(_))));
    }

    #[test]
    fn test_params_validate() {
        assert!(LbphParams::default().validate().is_ok());
        assert!(LbphParams { neighbors: 20, ..LbphParams::default() }.validate().is_err());
        assert!(LbphParams { grid_x: 0, ..LbphParams::default() }.validate().is_err());
    }
}
