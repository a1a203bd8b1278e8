//! Shared configuration for the daemon and the CLI.

use crate::detector::DetectionParams;
use crate::types::FaceSize;
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const CONFIG_ENV: &str = "ROLLCALL_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "rollcall.toml";
const MAX_DEBOUNCE_SECS: u64 = 86_400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may negotiate another.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Root for the default directory layout.
    pub data_dir: PathBuf,
    /// Training images, one folder per person (default: `<data_dir>/dataset`).
    pub dataset_dir: Option<PathBuf>,
    /// Haar cascade definitions (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// `trainer.json` + `labels.txt` (default: `<data_dir>/trainer`).
    pub trainer_dir: Option<PathBuf>,
    /// Daily ledgers (default: `<data_dir>/attendance`).
    pub attendance_dir: Option<PathBuf>,
    /// Unknown-face snapshots (default: `<data_dir>/unknown`).
    pub unknown_dir: Option<PathBuf>,
    /// Arrivals strictly after this are Late.
    #[serde(deserialize_with = "de_hhmm")]
    pub office_start: NaiveTime,
    /// Canonical recognizer input size; must match the trained model.
    pub face_size: FaceSize,
    /// LBPH distance below which a prediction is accepted.
    pub confidence_threshold: f64,
    /// Throttle window in seconds.
    pub debounce_secs: u64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Smallest face, in pixels, the detectors report.
    pub min_face_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            data_dir: PathBuf::from("."),
            dataset_dir: None,
            model_dir: None,
            trainer_dir: None,
            attendance_dir: None,
            unknown_dir: None,
            office_start: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            face_size: FaceSize::default(),
            confidence_threshold: 70.0,
            debounce_secs: 10,
            scale_factor: 1.2,
            min_neighbors: 5,
            min_face_size: 80,
        }
    }
}

impl Config {
    /// Load `$ROLLCALL_CONFIG` (or `./rollcall.toml` when present), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var(CONFIG_ENV) {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };

        let mut config = match file {
            Some(path) => {
                let config = Self::from_file(&path)?;
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables resolved through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = env("ROLLCALL_CAMERA") {
            self.camera_device = v;
        }
        if let Some(v) = env("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        for (key, slot) in [
            ("ROLLCALL_DATASET_DIR", &mut self.dataset_dir),
            ("ROLLCALL_MODEL_DIR", &mut self.model_dir),
            ("ROLLCALL_TRAINER_DIR", &mut self.trainer_dir),
            ("ROLLCALL_ATTENDANCE_DIR", &mut self.attendance_dir),
            ("ROLLCALL_UNKNOWN_DIR", &mut self.unknown_dir),
        ] {
            if let Some(v) = env(key) {
                *slot = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = env("ROLLCALL_OFFICE_START") {
            match parse_hhmm(&v) {
                Ok(t) => self.office_start = t,
                Err(e) => tracing::warn!(key = "ROLLCALL_OFFICE_START", value = %v, error = %e, "ignoring malformed override"),
            }
        }
        env_parse(&env, "ROLLCALL_FRAME_WIDTH", &mut self.frame_width);
        env_parse(&env, "ROLLCALL_FRAME_HEIGHT", &mut self.frame_height);
        env_parse(&env, "ROLLCALL_FACE_SIZE", &mut self.face_size);
        env_parse(&env, "ROLLCALL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse(&env, "ROLLCALL_DEBOUNCE_SECS", &mut self.debounce_secs);
        env_parse(&env, "ROLLCALL_SCALE_FACTOR", &mut self.scale_factor);
        env_parse(&env, "ROLLCALL_MIN_NEIGHBORS", &mut self.min_neighbors);
        env_parse(&env, "ROLLCALL_MIN_FACE_SIZE", &mut self.min_face_size);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scale_factor.is_nan() || self.scale_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "scale_factor must be greater than 1.0, got {}",
                self.scale_factor
            )));
        }
        if self.confidence_threshold.is_nan() || self.confidence_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be positive, got {}",
                self.confidence_threshold
            )));
        }
        if self.debounce_secs > MAX_DEBOUNCE_SECS {
            return Err(ConfigError::Invalid(format!(
                "debounce_secs must be at most {MAX_DEBOUNCE_SECS}, got {}",
                self.debounce_secs
            )));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid("frame size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.dir_or_default(&self.dataset_dir, "dataset")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.dir_or_default(&self.model_dir, "models")
    }

    pub fn trainer_dir(&self) -> PathBuf {
        self.dir_or_default(&self.trainer_dir, "trainer")
    }

    pub fn attendance_dir(&self) -> PathBuf {
        self.dir_or_default(&self.attendance_dir, "attendance")
    }

    pub fn unknown_dir(&self) -> PathBuf {
        self.dir_or_default(&self.unknown_dir, "unknown")
    }

    /// Path to the serialized LBPH model.
    pub fn model_path(&self) -> PathBuf {
        self.trainer_dir().join("trainer.json")
    }

    /// Path to the `id,name` label mapping.
    pub fn labels_path(&self) -> PathBuf {
        self.trainer_dir().join("labels.txt")
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
        }
    }

    pub fn debounce_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.debounce_secs.min(MAX_DEBOUNCE_SECS) as i64)
    }

    fn dir_or_default(&self, dir: &Option<PathBuf>, name: &str) -> PathBuf {
        dir.clone().unwrap_or_else(|| self.data_dir.join(name))
    }
}

fn env_parse<T: FromStr>(env: impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T::Err: std::fmt::Display,
{
    if let Some(v) = env(key) {
        match v.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(e) => tracing::warn!(key, value = %v, error = %e, "ignoring malformed override"),
        }
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
}

fn de_hhmm<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_hhmm(&s).map_err(|e| serde::de::Error::custom(format!("expected HH:MM, got {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.office_start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(c.face_size, FaceSize::new(200, 200));
        assert_eq!(c.confidence_threshold, 70.0);
        assert_eq!(c.debounce_window(), chrono::Duration::seconds(10));
        assert_eq!(c.attendance_dir(), PathBuf::from("./attendance"));
        assert_eq!(c.dataset_dir(), PathBuf::from("./dataset"));
        assert_eq!(c.labels_path(), PathBuf::from("./trainer/labels.txt"));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let c = Config::from_toml(
            r#"
            office_start = "08:45"
            face_size = "100x120"
            data_dir = "/srv/rollcall"
            unknown_dir = "/var/spool/unknown"
            "#,
        )
        .unwrap();
        assert_eq!(c.office_start, NaiveTime::from_hms_opt(8, 45, 0).unwrap());
        assert_eq!(c.face_size, FaceSize::new(100, 120));
        assert_eq!(c.model_dir(), PathBuf::from("/srv/rollcall/models"));
        assert_eq!(c.unknown_dir(), PathBuf::from("/var/spool/unknown"));
        assert_eq!(c.min_neighbors, 5);
    }

    #[test]
    fn test_from_toml_rejects_bad_time() {
        assert!(Config::from_toml(r#"office_start = "half past nine""#).is_err());
        assert!(Config::from_toml(r#"no_such_key = 1"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env_from(lookup(&[
            ("ROLLCALL_CAMERA", "/dev/video2"),
            ("ROLLCALL_OFFICE_START", "10:00"),
            ("ROLLCALL_DEBOUNCE_SECS", "30"),
            ("ROLLCALL_FACE_SIZE", "64x64"),
            ("ROLLCALL_TRAINER_DIR", "/opt/trainer"),
            ("ROLLCALL_DATASET_DIR", "/srv/faces"),
        ]));
        assert_eq!(c.dataset_dir(), PathBuf::from("/srv/faces"));
        assert_eq!(c.camera_device, "/dev/video2");
        assert_eq!(c.office_start, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(c.debounce_secs, 30);
        assert_eq!(c.face_size, FaceSize::new(64, 64));
        assert_eq!(c.model_path(), PathBuf::from("/opt/trainer/trainer.json"));
    }

    #[test]
    fn test_malformed_env_keeps_previous_value() {
        let mut c = Config::default();
        c.apply_env_from(lookup(&[
            ("ROLLCALL_CONFIDENCE_THRESHOLD", "very"),
            ("ROLLCALL_OFFICE_START", "25:99"),
            ("ROLLCALL_MIN_NEIGHBORS", ""),
        ]));
        assert_eq!(c.confidence_threshold, 70.0);
        assert_eq!(c.office_start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(c.min_neighbors, 5);
    }

    #[test]
    fn test_validate_rejects_scale_factor() {
        let c = Config { scale_factor: 1.0, ..Config::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }
}
