use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric identity label assigned at training time.
pub type IdentityId = u32;

/// Rectangle around a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Intersect with a `width` x `height` frame. Returns `None` when nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRegion> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(FaceRegion::new(self.x, self.y, w, h))
    }
}

/// A person known to the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
}

/// Raw recognizer output for one face.
///
/// `confidence` is a distance: lower means a closer match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognitionResult {
    pub identity_id: Option<IdentityId>,
    pub confidence: f64,
}

impl RecognitionResult {
    pub fn unknown() -> Self {
        Self {
            identity_id: None,
            confidence: f64::MAX,
        }
    }
}

/// Canonical face size (width x height) used for training and recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FaceSize {
    pub width: u32,
    pub height: u32,
}

impl FaceSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for FaceSize {
    fn default() -> Self {
        Self::new(200, 200)
    }
}

impl fmt::Display for FaceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for FaceSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width: u32 = w.trim().parse().map_err(|e| format!("bad width {w:?}: {e}"))?;
        let height: u32 = h.trim().parse().map_err(|e| format!("bad height {h:?}: {e}"))?;
        if width == 0 || height == 0 {
            return Err(format!("face size must be non-zero, got {s:?}"));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for FaceSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FaceSize> for String {
    fn from(size: FaceSize) -> Self {
        size.to_string()
    }
}

/// Concatenated per-cell LBP histograms for one face image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub values: Vec<f32>,
}

impl Histogram {
    /// Alternative chi-square distance, `sum(2 (a - b)^2 / (a + b))`.
    ///
    /// Zero for identical histograms; bins empty in both are skipped.
    pub fn chi_square(&self, other: &Histogram) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                let (a, b) = (a as f64, b as f64);
                let sum = a + b;
                if sum.abs() > f64::EPSILON {
                    (a - b).powi(2) / sum
                } else {
                    0.0
                }
            })
            .sum::<f64>()
            * 2.0
    }
}

/// A training sample: the label it was trained under and its histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedFace {
    pub label: IdentityId,
    pub histogram: Histogram,
}

/// Strategy for picking the closest trained face for a query histogram.
pub trait Matcher {
    fn nearest(&self, query: &Histogram, gallery: &[TrainedFace]) -> RecognitionResult;
}

/// Nearest neighbour by chi-square distance.
pub struct ChiSquareMatcher;

impl Matcher for ChiSquareMatcher {
    fn nearest(&self, query: &Histogram, gallery: &[TrainedFace]) -> RecognitionResult {
        gallery
            .iter()
            .map(|face| (face.label, query.chi_square(&face.histogram)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(label, distance)| RecognitionResult {
                identity_id: Some(label),
                confidence: distance,
            })
            .unwrap_or_else(RecognitionResult::unknown)
    }
}
