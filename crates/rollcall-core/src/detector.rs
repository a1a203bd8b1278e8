//! Haar cascade face detector.
//!
//! Evaluates boosted Haar cascades stored in OpenCV's cascade XML format over
//! an image pyramid, following `CascadeClassifier::detectMultiScale`: window
//! variance normalisation, stage rejection, then `groupRectangles` clustering.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Relative tolerance used when clustering raw detections.
const GROUP_EPS: f64 = 0.2;
/// Slack subtracted from stage thresholds, as OpenCV does.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;
/// Past this pyramid factor every window position is scanned.
const DENSE_SCAN_FACTOR: f64 = 2.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade definition not found: {0} — place the Haar cascade XML files in the models directory")]
    DefinitionNotFound(String),
    #[error("failed to read cascade definition {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade definition: {0}")]
    InvalidDefinition(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// Tuning for one multi-scale detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Pyramid step between scales; must be greater than 1.
    pub scale_factor: f64,
    /// Raw hits a cluster needs (strictly more than this) to be reported.
    pub min_neighbors: u32,
    /// Smallest window side, in frame pixels, that is scanned.
    pub min_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            min_neighbors: 5,
            min_size: 80,
        }
    }
}

/// Anything that finds face rectangles in a grayscale image.
pub trait RegionDetector {
    fn detect(&self, gray: &GrayImage, params: &DetectionParams) -> Vec<FaceRegion>;
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

#[derive(Debug, Clone)]
struct Feature {
    rects: Vec<(Rect, f64)>,
    tilted: bool,
}

/// Decision tree node. Child indices `<= 0` point at leaf `-index`.
#[derive(Debug, Clone)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<Feature>,
    has_tilted: bool,
}

impl HaarCascade {
    /// Load a cascade definition file.
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::DefinitionNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| DetectorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::parse(&xml)?;

        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?cascade.window_size(),
            tilted = cascade.has_tilted,
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse the XML text of a cascade definition.
    pub fn parse(xml: &str) -> Result<Self, DetectorError> {
        let doc = roxmltree::Document::parse(xml)?;

        if doc
            .descendants()
            .any(|n| n.attribute("type_id") == Some("opencv-haar-classifier"))
        {
            return Err(DetectorError::Unsupported(
                "legacy opencv-haar-classifier layout; use a cascade saved by OpenCV 2.4 or newer".into(),
            ));
        }

        let cascade = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| DetectorError::InvalidDefinition("missing <cascade> element".into()))?;

        let stage_type = child_text(cascade, "stageType")?;
        if stage_type != "BOOST" {
            return Err(DetectorError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = child_text(cascade, "featureType")?;
        if feature_type != "HAAR" {
            return Err(DetectorError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = parse_value(child_text(cascade, "width")?)?;
        let window_height: u32 = parse_value(child_text(cascade, "height")?)?;
        if window_width < 3 || window_height < 3 {
            return Err(DetectorError::InvalidDefinition(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let mut stages = Vec::new();
        for stage in items(child(cascade, "stages")?) {
            let threshold: f64 = parse_value(child_text(stage, "stageThreshold")?)?;
            let mut classifiers = Vec::new();
            for weak in items(child(stage, "weakClassifiers")?) {
                classifiers.push(parse_weak_classifier(weak)?);
            }
            stages.push(Stage { threshold, classifiers });
        }

        let mut features = Vec::new();
        for feature in items(child(cascade, "features")?) {
            let mut rects = Vec::new();
            for rect in items(child(feature, "rects")?) {
                let fields: Vec<&str> = rect.text().unwrap_or("").split_whitespace().collect();
                if fields.len() != 5 {
                    return Err(DetectorError::InvalidDefinition(format!(
                        "feature rect needs 5 values, got {}",
                        fields.len()
                    )));
                }
                let r = Rect {
                    x: parse_value(fields[0])?,
                    y: parse_value(fields[1])?,
                    w: parse_value(fields[2])?,
                    h: parse_value(fields[3])?,
                };
                rects.push((r, parse_value::<f64>(fields[4])?));
            }
            let tilted = match child(feature, "tilted") {
                Ok(node) => node.text().map(str::trim) == Some("1"),
                Err(_) => false,
            };
            features.push(Feature { rects, tilted });
        }

        if stages.is_empty() {
            return Err(DetectorError::InvalidDefinition("no stages".into()));
        }

        let cascade = Self {
            window_width,
            window_height,
            has_tilted: features.iter().any(|f| f.tilted),
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Window size the cascade was trained on.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    fn validate(&self) -> Result<(), DetectorError> {
        let (ww, wh) = (self.window_width as i64, self.window_height as i64);

        for (i, feature) in self.features.iter().enumerate() {
            for (r, _) in &feature.rects {
                let inside = if feature.tilted {
                    r.y >= 0 && r.y + r.w + r.h <= wh && r.x - r.h >= -wh && r.x + r.w <= ww + wh
                } else {
                    r.x >= 0 && r.y >= 0 && r.x + r.w <= ww && r.y + r.h <= wh
                };
                if r.w <= 0 || r.h <= 0 || !inside {
                    return Err(DetectorError::InvalidDefinition(format!(
                        "feature {i} rect {r:?} lies outside the {ww}x{wh} window"
                    )));
                }
            }
        }

        for stage in &self.stages {
            for weak in &stage.classifiers {
                for node in &weak.nodes {
                    if node.feature >= self.features.len() {
                        return Err(DetectorError::InvalidDefinition(format!(
                            "node references feature {} of {}",
                            node.feature,
                            self.features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child > 0 {
                            (child as usize) < weak.nodes.len()
                        } else {
                            ((-child) as usize) < weak.leaves.len()
                        };
                        if !ok {
                            return Err(DetectorError::InvalidDefinition(format!(
                                "node child {child} out of range"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every stage on the window with top-left `(x, y)`.
    fn accepts(&self, images: &IntegralImages, x: i64, y: i64) -> bool {
        let (ww, wh) = (self.window_width as i64, self.window_height as i64);
        let norm = Rect { x: x + 1, y: y + 1, w: ww - 2, h: wh - 2 };
        let area = (norm.w * norm.h) as f64;
        let sum = images.sum(norm) as f64;
        let sq_sum = images.sq_sum(norm) as f64;
        let nf = area * sq_sum - sum * sum;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut total = 0.0;
            for weak in &stage.classifiers {
                let mut idx = 0i32;
                let leaf = loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.feature_value(images, node.feature, x, y) * inv_norm;
                    let next = if value < node.threshold { node.left } else { node.right };
                    if next <= 0 {
                        break (-next) as usize;
                    }
                    idx = next;
                };
                total += weak.leaves[leaf];
            }
            if total < stage.threshold - STAGE_THRESHOLD_EPS {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, images: &IntegralImages, feature: usize, x: i64, y: i64) -> f64 {
        let feature = &self.features[feature];
        feature
            .rects
            .iter()
            .map(|(r, weight)| {
                let shifted = Rect { x: r.x + x, y: r.y + y, ..*r };
                let sum = if feature.tilted {
                    images.tilted_sum(shifted)
                } else {
                    images.sum(shifted)
                };
                sum as f64 * weight
            })
            .sum()
    }
}

impl RegionDetector for HaarCascade {
    fn detect(&self, gray: &GrayImage, params: &DetectionParams) -> Vec<FaceRegion> {
        if params.scale_factor <= 1.0 {
            tracing::warn!(scale_factor = params.scale_factor, "scale factor must exceed 1.0; skipping detection");
            return Vec::new();
        }

        let (img_w, img_h) = gray.dimensions();
        let (ww, wh) = self.window_size();
        let mut candidates = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w < ww || scaled_h < wh {
                break;
            }
            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;

            if win_w >= params.min_size && win_h >= params.min_size {
                let resized;
                let level = if factor == 1.0 {
                    gray
                } else {
                    resized = imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle);
                    &resized
                };
                let images = IntegralImages::new(level, self.has_tilted);
                let step = if factor > DENSE_SCAN_FACTOR { 1 } else { 2 };

                for y in (0..=(scaled_h - wh) as i64).step_by(step) {
                    for x in (0..=(scaled_w - ww) as i64).step_by(step) {
                        if self.accepts(&images, x, y) {
                            candidates.push(FaceRegion::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                win_w,
                                win_h,
                            ));
                        }
                    }
                }
            }

            factor *= params.scale_factor;
        }

        tracing::trace!(raw = candidates.len(), "cascade candidates before grouping");
        group_rectangles(&candidates, params.min_neighbors, GROUP_EPS)
    }
}

/// Upright, squared and (optionally) 45-degree rotated summed-area tables.
struct IntegralImages {
    sum: Array2<i64>,
    sq_sum: Array2<i64>,
    tilted: Option<TiltedIntegral>,
}

impl IntegralImages {
    fn new(img: &GrayImage, with_tilted: bool) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let mut sum = Array2::<i64>::zeros((h + 1, w + 1));
        let mut sq_sum = Array2::<i64>::zeros((h + 1, w + 1));

        for y in 0..h {
            let mut row = 0i64;
            let mut sq_row = 0i64;
            for x in 0..w {
                let p = img.get_pixel(x as u32, y as u32)[0] as i64;
                row += p;
                sq_row += p * p;
                sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row;
                sq_sum[[y + 1, x + 1]] = sq_sum[[y, x + 1]] + sq_row;
            }
        }

        Self {
            sum,
            sq_sum,
            tilted: with_tilted.then(|| TiltedIntegral::new(img)),
        }
    }

    fn sum(&self, r: Rect) -> i64 {
        rect_sum(&self.sum, r)
    }

    fn sq_sum(&self, r: Rect) -> i64 {
        rect_sum(&self.sq_sum, r)
    }

    fn tilted_sum(&self, r: Rect) -> i64 {
        match &self.tilted {
            Some(t) => {
                t.get(r.x, r.y) - t.get(r.x - r.h, r.y + r.h) - t.get(r.x + r.w, r.y + r.w)
                    + t.get(r.x + r.w - r.h, r.y + r.w + r.h)
            }
            None => 0,
        }
    }
}

fn rect_sum(table: &Array2<i64>, r: Rect) -> i64 {
    let (x0, y0) = (r.x as usize, r.y as usize);
    let (x1, y1) = ((r.x + r.w) as usize, (r.y + r.h) as usize);
    table[[y1, x1]] - table[[y0, x1]] - table[[y1, x0]] + table[[y0, x0]]
}

/// Rotated summed-area table:
/// `T(X, Y) = sum of I(x, y) for y < Y and |x - X + 1| <= Y - y - 1`.
///
/// Columns extend `height + 1` beyond both image edges so the recurrence
/// never has to special-case triangles that overhang the image.
struct TiltedIntegral {
    data: Array2<i64>,
    offset: i64,
}

impl TiltedIntegral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as i64, img.height() as i64);
        let offset = h + 1;
        let cols = (w + 2 * offset + 1) as usize;
        let mut table = Self {
            data: Array2::<i64>::zeros((h as usize + 1, cols)),
            offset,
        };

        let pixel = |x: i64, y: i64| -> i64 {
            if x >= 0 && y >= 0 && x < w && y < h {
                img.get_pixel(x as u32, y as u32)[0] as i64
            } else {
                0
            }
        };

        for y in 1..=h {
            for x in -offset..=(w + offset) {
                let value = table.get(x - 1, y - 1) + table.get(x + 1, y - 1) - table.get(x, y - 2)
                    + pixel(x - 1, y - 1)
                    + pixel(x - 1, y - 2);
                table.data[[y as usize, (x + offset) as usize]] = value;
            }
        }
        table
    }

    fn get(&self, x: i64, y: i64) -> i64 {
        let col = x + self.offset;
        if y < 0 || col < 0 || y as usize >= self.data.nrows() || col as usize >= self.data.ncols() {
            return 0;
        }
        self.data[[y as usize, col as usize]]
    }
}

/// Cluster raw hits and drop clusters with `min_neighbors` or fewer members.
///
/// A zero threshold returns the input unchanged.
pub fn group_rectangles(rects: &[FaceRegion], min_neighbors: u32, eps: f64) -> Vec<FaceRegion> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut class_index = vec![usize::MAX; n];
    let mut totals: Vec<([i64; 4], u32)> = Vec::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_index[root] == usize::MAX {
            class_index[root] = totals.len();
            totals.push(([0; 4], 0));
        }
        let entry = &mut totals[class_index[root]];
        let r = &rects[i];
        entry.0[0] += r.x as i64;
        entry.0[1] += r.y as i64;
        entry.0[2] += r.width as i64;
        entry.0[3] += r.height as i64;
        entry.1 += 1;
    }

    let clusters: Vec<(FaceRegion, u32)> = totals
        .iter()
        .map(|(sum, count)| {
            let s = 1.0 / *count as f64;
            let avg = |v: i64| (v as f64 * s).round() as u32;
            (FaceRegion::new(avg(sum[0]), avg(sum[1]), avg(sum[2]), avg(sum[3])), *count)
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, &(r1, n1)) in clusters.iter().enumerate() {
        if n1 <= min_neighbors {
            continue;
        }
        let swallowed = clusters.iter().enumerate().any(|(j, &(r2, n2))| {
            if i == j || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            r1.x as i64 >= r2.x as i64 - dx
                && r1.y as i64 >= r2.y as i64 - dy
                && r1.right() as i64 <= r2.right() as i64 + dx
                && r1.bottom() as i64 <= r2.bottom() as i64 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !swallowed {
            grouped.push(r1);
        }
    }
    grouped
}

fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn parse_weak_classifier(node: roxmltree::Node<'_, '_>) -> Result<WeakClassifier, DetectorError> {
    let internal: Vec<&str> = child_text(node, "internalNodes")?.split_whitespace().collect();
    if internal.is_empty() || internal.len() % 4 != 0 {
        return Err(DetectorError::InvalidDefinition(format!(
            "internalNodes must hold groups of 4 values, got {}",
            internal.len()
        )));
    }
    let nodes = internal
        .chunks(4)
        .map(|c| {
            Ok(Node {
                left: parse_value(c[0])?,
                right: parse_value(c[1])?,
                feature: parse_value(c[2])?,
                threshold: parse_value(c[3])?,
            })
        })
        .collect::<Result<Vec<_>, DetectorError>>()?;
    let leaves = child_text(node, "leafValues")?
        .split_whitespace()
        .map(parse_value::<f64>)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(WeakClassifier { nodes, leaves })
}

fn child<'a, 'i>(node: roxmltree::Node<'a, 'i>, tag: &str) -> Result<roxmltree::Node<'a, 'i>, DetectorError> {
    node.children()
        .find(|c| c.has_tag_name(tag))
        .ok_or_else(|| DetectorError::InvalidDefinition(format!("missing <{tag}>")))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, tag: &str) -> Result<&'a str, DetectorError> {
    Ok(child(node, tag)?.text().unwrap_or("").trim())
}

/// Element children (`<_>` entries in OpenCV sequences).
fn items<'a, 'i>(node: roxmltree::Node<'a, 'i>) -> impl Iterator<Item = roxmltree::Node<'a, 'i>> {
    node.children().filter(|c| c.is_element())
}

fn parse_value<T: std::str::FromStr>(s: &str) -> Result<T, DetectorError> {
    s.trim()
        .parse()
        .map_err(|_| DetectorError::InvalidDefinition(format!("unparseable value {s:?}")))
}
