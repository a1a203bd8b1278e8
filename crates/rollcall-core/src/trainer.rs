//! Offline training: turn a `dataset/<person>/*.jpg` tree into gallery artifacts.

use crate::gallery::IdentityGallery;
use crate::recognizer::{LbphModel, LbphParams};
use crate::types::{FaceSize, Identity, IdentityId, TrainedFace};
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fewer usable images than this and training refuses to run.
pub const MIN_TRAINING_IMAGES: usize = 10;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("dataset directory not found: {0}")]
    DatasetNotFound(String),
    #[error("no person folders in {0} — register faces first")]
    NoPersons(String),
    #[error("not enough face images to train ({found}, need at least {MIN_TRAINING_IMAGES}) — register 10-20 images per person")]
    TooFewImages { found: usize },
    #[error("dataset I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Normalised faces gathered from a dataset directory.
pub struct TrainingSet {
    pub faces: Vec<(IdentityId, GrayImage)>,
    pub gallery: IdentityGallery,
    /// Files ignored for having the wrong extension or failing to decode.
    pub skipped: usize,
}

impl TrainingSet {
    /// Collect every person folder under `dataset_dir`, sorted by name.
    ///
    /// Empty folders are skipped and ids are assigned densely over the rest.
    pub fn collect(dataset_dir: &Path, face_size: FaceSize) -> Result<Self, TrainingError> {
        if !dataset_dir.is_dir() {
            return Err(TrainingError::DatasetNotFound(dataset_dir.display().to_string()));
        }

        let mut persons: Vec<(String, PathBuf)> = read_dir(dataset_dir)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                Some((name, p))
            })
            .collect();
        persons.sort();

        if persons.is_empty() {
            return Err(TrainingError::NoPersons(dataset_dir.display().to_string()));
        }

        let mut faces = Vec::new();
        let mut identities = Vec::new();
        let mut skipped = 0usize;

        for (name, dir) in persons {
            let mut files = read_dir(&dir)?;
            files.sort();
            if files.is_empty() {
                tracing::warn!(person = %name, "skipping empty folder");
                continue;
            }

            let id = identities.len() as IdentityId;
            identities.push(Identity { id, name: name.clone() });

            for file in files {
                if !has_image_extension(&file) {
                    skipped += 1;
                    continue;
                }
                match image::open(&file) {
                    Ok(img) => {
                        let gray = img.to_luma8();
                        let face = imageops::resize(&gray, face_size.width, face_size.height, FilterType::Triangle);
                        faces.push((id, face));
                    }
                    Err(e) => {
                        tracing::warn!(path = %file.display(), error = %e, "unreadable image skipped");
                        skipped += 1;
                    }
                }
            }
        }

        Ok(Self {
            faces,
            gallery: IdentityGallery::new(identities),
            skipped,
        })
    }

    /// Build the LBPH model. Fails when the set is too small to be useful.
    pub fn train(&self, params: LbphParams, face_size: FaceSize) -> Result<LbphModel, TrainingError> {
        if self.faces.len() < MIN_TRAINING_IMAGES {
            return Err(TrainingError::TooFewImages { found: self.faces.len() });
        }
        let faces = self
            .faces
            .iter()
            .map(|(label, face)| TrainedFace {
                label: *label,
                histogram: params.histogram(face),
            })
            .collect();
        Ok(LbphModel { params, face_size, faces })
    }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let io_err = |source| TrainingError::Io {
        path: dir.display().to_string(),
        source,
    };
    std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()).map_err(io_err))
        .collect()
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
