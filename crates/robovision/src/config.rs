use anyhow::Result;
use robovision_core::gate::{DEFAULT_ACCEPT_HIGH, DEFAULT_ACCEPT_LOW};
use robovision_core::{AcceptanceBand, ArtifactPaths};
use std::path::PathBuf;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the `<person>/<image>` training tree.
    pub dataset_dir: PathBuf,
    /// Directory the trained label registry and model are committed to.
    pub data_dir: PathBuf,
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// Lower (exclusive) bound of the accepted match distance.
    pub accept_low: f64,
    /// Upper (inclusive) bound of the accepted match distance.
    pub accept_high: f64,
    /// Minimum SCRFD score for a detection to count as a face.
    pub detect_confidence: f32,
}

impl Config {
    /// Load configuration from `ROBOVISION_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("ROBOVISION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("robovision")
            });

        let model_dir = var("ROBOVISION_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse().ok());

        Self {
            dataset_dir: var("ROBOVISION_DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dataset/faces")),
            data_dir,
            model_dir,
            accept_low: parsed("ROBOVISION_ACCEPT_LOW").unwrap_or(DEFAULT_ACCEPT_LOW),
            accept_high: parsed("ROBOVISION_ACCEPT_HIGH").unwrap_or(DEFAULT_ACCEPT_HIGH),
            detect_confidence: var("ROBOVISION_DETECT_CONFIDENCE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(robovision_core::detector::DEFAULT_CONFIDENCE_THRESHOLD),
        }
    }

    pub fn artifacts(&self) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.data_dir)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    pub fn band(&self) -> Result<AcceptanceBand> {
        Ok(AcceptanceBand::new(self.accept_low, self.accept_high)?)
    }
}
