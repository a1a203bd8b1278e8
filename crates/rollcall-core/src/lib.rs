//! rollcall-core — Face detection and recognition engine.
//!
//! Uses a three-stage Haar cascade fallback for face detection and LBPH
//! histograms for recognition, both evaluated in pure Rust on the CPU.

pub mod cascade;
pub mod config;
pub mod detector;
pub mod gallery;
pub mod recognizer;
pub mod trainer;
pub mod types;

pub use cascade::{DetectorCascade, DetectorRole};
pub use config::{Config, ConfigError};
pub use detector::{DetectionParams, HaarCascade, RegionDetector};
pub use gallery::{IdentityGallery, Recognition};
pub use recognizer::{LbphModel, LbphParams, LbphRecognizer, Recognizer};
pub use types::{FaceRegion, FaceSize, Identity, IdentityId, RecognitionResult};
