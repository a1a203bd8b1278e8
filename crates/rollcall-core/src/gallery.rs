//! Identity gallery: the `id,name` label mapping written at training time.

use crate::types::{Identity, IdentityId, RecognitionResult};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("label mapping not found: {0} — run `rollcall train` again (it writes labels.txt)")]
    LabelsNotFound(String),
    #[error("label mapping I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of applying the acceptance policy to a recognizer result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognition<'a> {
    Known(&'a Identity),
    Unknown,
}

/// Immutable id → identity map.
#[derive(Debug, Clone, Default)]
pub struct IdentityGallery {
    identities: BTreeMap<IdentityId, Identity>,
}

impl IdentityGallery {
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            identities: identities.into_iter().map(|i| (i.id, i)).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        if !path.exists() {
            return Err(GalleryError::LabelsNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let gallery = Self::parse(&text);
        tracing::info!(path = %path.display(), identities = gallery.len(), "loaded identity gallery");
        Ok(gallery)
    }

    /// Parse `id,name` lines. Blank and malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut identities = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split(',').collect();
            let parsed = match parts.as_slice() {
                [id, name] => id.trim().parse::<IdentityId>().ok().map(|id| Identity {
                    id,
                    name: name.to_string(),
                }),
                _ => None,
            };
            match parsed {
                Some(identity) => identities.push(identity),
                None => tracing::warn!(line = lineno + 1, content = line, "skipping malformed label line"),
            }
        }
        Self::new(identities)
    }

    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text: String = self
            .identities
            .values()
            .map(|i| format!("{},{}\n", i.id, i.name))
            .collect();
        std::fs::write(path, text).map_err(io_err)
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    /// Accept a result only when it is below `threshold` and names a gallery entry.
    pub fn classify(&self, result: &RecognitionResult, threshold: f64) -> Recognition<'_> {
        match result.identity_id {
            Some(id) if result.confidence < threshold => {
                self.get(id).map_or(Recognition::Unknown, Recognition::Known)
            }
            _ => Recognition::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gallery() -> IdentityGallery {
        IdentityGallery::parse("0,Asha\n1,Ravi\n")
    }

    #[test]
    fn test_parse_labels() {
        let g = gallery();
        assert_eq!(g.len(), 2);
        assert_eq!(g.get(0).map(|i| i.name.as_str()), Some("Asha"));
        assert_eq!(g.get(1).map(|i| i.name.as_str()), Some("Ravi"));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let g = IdentityGallery::parse("\n0,Asha\nnot a label\nx,Bad\n2,Too,Many\n 3 ,Meera\r\n");
        assert_eq!(g.len(), 2);
        assert_eq!(g.get(3).map(|i| i.name.as_str()), Some("Meera"));
        assert!(g.get(2).is_none());
    }

    #[test]
    fn test_classify_accepts_confident_known_id() {
        let g = gallery();
        let result = RecognitionResult { identity_id: Some(0), confidence: 42.0 };
        assert_eq!(g.classify(&result, 70.0), Recognition::Known(g.get(0).unwrap()));
    }

    #[test]
    fn test_classify_rejects_at_or_above_threshold() {
        let g = gallery();
        for confidence in [70.0, 70.5, 250.0] {
            let result = RecognitionResult { identity_id: Some(0), confidence };
            assert_eq!(g.classify(&result, 70.0), Recognition::Unknown);
        }
    }

    #[test]
    fn test_classify_rejects_id_outside_gallery() {
        let result = RecognitionResult { identity_id: Some(9), confidence: 1.0 };
        assert_eq!(gallery().classify(&result, 70.0), Recognition::Unknown);
    }

    #[test]
    fn test_classify_rejects_missing_id() {
        let result = RecognitionResult { identity_id: None, confidence: 0.0 };
        assert_eq!(gallery().classify(&result, 70.0), Recognition::Unknown);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        gallery().save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0,Asha\n1,Ravi\n");
        assert_eq!(IdentityGallery::load(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_load_missing_labels() {
        let err = IdentityGallery::load(Path::new("/nonexistent/labels.txt")).unwrap_err();
        assert!(matches!(err, GalleryError::LabelsNotFound(_)));
    }
}
