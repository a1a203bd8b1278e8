//! Snapshots of frames containing unrecognized faces.

use chrono::NaiveDateTime;
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to create unknown-face directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write snapshot {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

pub struct UnknownFaceSink {
    dir: PathBuf,
}

impl UnknownFaceSink {
    pub fn open(dir: &Path) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir).map_err(|source| SinkError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn path_for(&self, at: NaiveDateTime) -> PathBuf {
        self.dir
            .join(format!("unknown_{}.jpg", at.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// Write the whole frame as JPEG and return where it went.
    pub fn capture(&self, frame: &RgbImage, at: NaiveDateTime) -> Result<PathBuf, SinkError> {
        let path = self.path_for(at);
        frame
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| SinkError::Encode {
                path: path.display().to_string(),
                source,
            })?;
        tracing::info!(path = %path.display(), "unknown face captured");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use image::Rgb;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(9, 15, 7).unwrap()
    }

    #[test]
    fn test_capture_writes_timestamped_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let sink = UnknownFaceSink::open(&dir.path().join("unknown")).unwrap();

        let path = sink.capture(&RgbImage::from_pixel(32, 24, Rgb([10, 200, 30])), at()).unwrap();

        assert_eq!(path.file_name().unwrap(), "unknown_2026-03-02_09-15-07.jpg");
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (32, 24));
    }

    #[test]
    fn test_capture_into_removed_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("unknown");
        let sink = UnknownFaceSink::open(&target).unwrap();
        std::fs::remove_dir(&target).unwrap();
        assert!(matches!(sink.capture(&RgbImage::new(8, 8), at()), Err(SinkError::Encode { .. })));
    }
}
