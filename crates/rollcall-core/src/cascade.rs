//! Prioritised detector fallback: primary frontal, alternate frontal, profile.

use crate::detector::{DetectionParams, DetectorError, HaarCascade, RegionDetector};
use crate::types::FaceRegion;
use image::GrayImage;
use std::fmt;
use std::path::Path;

/// Fixed role of each detector in the fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorRole {
    PrimaryFrontal,
    AlternateFrontal,
    Profile,
}

impl DetectorRole {
    /// All roles, in the order they are tried.
    pub const ALL: [DetectorRole; 3] = [
        DetectorRole::PrimaryFrontal,
        DetectorRole::AlternateFrontal,
        DetectorRole::Profile,
    ];

    /// File name of the cascade definition for this role.
    pub fn file_name(self) -> &'static str {
        match self {
            DetectorRole::PrimaryFrontal => "haarcascade_frontalface_default.xml",
            DetectorRole::AlternateFrontal => "haarcascade_frontalface_alt2.xml",
            DetectorRole::Profile => "haarcascade_profileface.xml",
        }
    }
}

impl fmt::Display for DetectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorRole::PrimaryFrontal => "primary-frontal",
            DetectorRole::AlternateFrontal => "alternate-frontal",
            DetectorRole::Profile => "profile",
        })
    }
}

/// Ordered detectors; the first non-empty result wins.
pub struct DetectorCascade {
    detectors: Vec<(DetectorRole, Box<dyn RegionDetector + Send>)>,
    params: DetectionParams,
}

impl DetectorCascade {
    pub fn new(detectors: Vec<(DetectorRole, Box<dyn RegionDetector + Send>)>, params: DetectionParams) -> Self {
        Self { detectors, params }
    }

    /// Load the three role cascades from `model_dir`.
    ///
    /// Every definition file is checked for existence before any is parsed,
    /// so a missing file is reported without spending time on the others.
    pub fn load(model_dir: &Path, params: DetectionParams) -> Result<Self, DetectorError> {
        for role in DetectorRole::ALL {
            let path = model_dir.join(role.file_name());
            if !path.exists() {
                return Err(DetectorError::DefinitionNotFound(path.display().to_string()));
            }
        }

        let mut detectors: Vec<(DetectorRole, Box<dyn RegionDetector + Send>)> = Vec::with_capacity(3);
        for role in DetectorRole::ALL {
            let cascade = HaarCascade::load(&model_dir.join(role.file_name()))?;
            detectors.push((role, Box::new(cascade)));
        }

        Ok(Self::new(detectors, params))
    }

    /// Detect faces, falling back through the roles until one finds something.
    pub fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        for (role, detector) in &self.detectors {
            let regions = detector.detect(gray, &self.params);
            if !regions.is_empty() {
                tracing::trace!(%role, count = regions.len(), "faces detected");
                return regions;
            }
        }
        Vec::new()
    }
}
