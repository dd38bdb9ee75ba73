//! Loading a trained registry/model pair and running recognition on frames.

use crate::detector::{Detector, DetectorError};
use crate::extract::{extract_gray, ExtractError};
use crate::gate::{AcceptanceBand, GateError, RecognitionDecision, RecognitionGate};
use crate::labels::{InverseRegistry, LabelRegistry, RegistryError};
use crate::recognizer::{LbphRecognizer, Recognizer, RecognizerError};
use crate::types::FaceRegion;
use image::GrayImage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub const LABELS_FILE: &str = "face_trainer_labels.json";
pub const MODEL_FILE: &str = "face_trainer_model.json";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("label registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{labels} was not committed together with {model}; retrain to produce a matching pair")]
    MismatchedArtifacts { labels: PathBuf, model: PathBuf },
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("extract: {0}")]
    Extract(#[from] ExtractError),
    #[error("gate: {0}")]
    Gate(#[from] GateError),
}

/// Locations of the two artifacts one training run produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub labels: PathBuf,
    pub model: PathBuf,
}

impl ArtifactPaths {
    /// Conventional file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            labels: dir.join(LABELS_FILE),
            model: dir.join(MODEL_FILE),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Recognition result for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    pub region: FaceRegion,
    pub decision: RecognitionDecision,
}

/// Read-only recognizer + inverse registry + acceptance band.
///
/// All methods take `&self`; share it across threads behind an `Arc`.
#[derive(Debug)]
pub struct RecognitionModel<R = LbphRecognizer> {
    recognizer: R,
    registry: InverseRegistry,
    band: AcceptanceBand,
}

impl<R: Recognizer> RecognitionModel<R> {
    pub fn new(recognizer: R, registry: InverseRegistry, band: AcceptanceBand) -> Self {
        Self {
            recognizer,
            registry,
            band,
        }
    }

    /// Load and verify an artifact pair written by one training run.
    pub fn load(paths: &ArtifactPaths, band: AcceptanceBand) -> Result<Self, ModelError> {
        let registry = LabelRegistry::load(&paths.labels)?;

        match registry.model_sha256() {
            Some(expected) => {
                let bytes = std::fs::read(&paths.model).map_err(|source| RecognizerError::Io {
                    path: paths.model.clone(),
                    source,
                })?;
                if sha256_hex(&bytes) != expected {
                    return Err(ModelError::MismatchedArtifacts {
                        labels: paths.labels.clone(),
                        model: paths.model.clone(),
                    });
                }
            }
            None => tracing::warn!(
                labels = %paths.labels.display(),
                "registry has no model digest; cannot verify it matches the model"
            ),
        }

        let recognizer = R::load(&paths.model)?;
        tracing::info!(
            identities = registry.len(),
            trained_at = registry.trained_at().unwrap_or("unknown"),
            low = band.low(),
            high = band.high(),
            "recognition model loaded"
        );
        Ok(Self::new(recognizer, registry, band))
    }

    pub fn registry(&self) -> &InverseRegistry {
        &self.registry
    }

    pub fn band(&self) -> AcceptanceBand {
        self.band
    }

    pub fn gate(&self) -> RecognitionGate<'_> {
        RecognitionGate::new(self.band, &self.registry)
    }

    /// Predict and gate a single grayscale face crop.
    pub fn classify(&self, sample: &GrayImage) -> Result<RecognitionDecision, ModelError> {
        let prediction = self.recognizer.predict(sample)?;
        Ok(self.gate().decide_prediction(prediction)?)
    }

    /// Classify every `region` of `frame`, in region order.
    pub fn recognize(&self, frame: &GrayImage, regions: &[FaceRegion]) -> Result<Vec<FaceMatch>, ModelError> {
        let crops = extract_gray(frame, regions)?;
        regions
            .iter()
            .zip(crops.iter())
            .map(|(region, crop)| {
                Ok(FaceMatch {
                    region: *region,
                    decision: self.classify(crop)?,
                })
            })
            .collect()
    }

    /// Detect faces with `detector`, then [`recognize`](Self::recognize) them.
    pub fn detect_and_recognize<D: Detector + ?Sized>(
        &self,
        detector: &mut D,
        frame: &GrayImage,
    ) -> Result<Vec<FaceMatch>, ModelError> {
        let regions = detector.detect(frame)?;
        self.recognize(frame, &regions)
    }
}

/// Holds the model recognition callers currently use.
///
/// A replacement is fully loaded before [`publish`](Self::publish) swaps it
/// in; callers holding the previous `Arc` finish with it undisturbed.
pub struct ModelSlot<R = LbphRecognizer> {
    current: RwLock<Option<Arc<RecognitionModel<R>>>>,
}

impl<R> Default for ModelSlot<R> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }
}

impl<R> ModelSlot<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in `model`, returning the one it replaced.
    pub fn publish(&self, model: RecognitionModel<R>) -> Option<Arc<RecognitionModel<R>>> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        guard.replace(Arc::new(model))
    }

    pub fn current(&self) -> Option<Arc<RecognitionModel<R>>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<R: Recognizer> ModelSlot<R> {
    /// Load a pair from disk and publish it; the slot is untouched on failure.
    pub fn load_and_publish(&self, paths: &ArtifactPaths, band: AcceptanceBand) -> Result<(), ModelError> {
        let model = RecognitionModel::load(paths, band)?;
        self.publish(model);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelRegistry;
    use crate::types::IdentityId;
    use image::Luma;

    fn texture(seed: u32) -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            let h = (x.wrapping_mul(73856093) ^ y.wrapping_mul(19349663) ^ seed.wrapping_mul(83492791))
                .wrapping_mul(2654435761);
            Luma([(h >> 24) as u8])
        })
    }

    /// Trains on two textures and writes a committed pair under `dir`.
    fn committed_pair(dir: &Path) -> ArtifactPaths {
        let mut reg = LabelRegistry::new();
        let alice = reg.register("alice");
        let bob = reg.register("bob");
        let mut rec = LbphRecognizer::default();
        rec.train(&[texture(1), texture(2)], &[alice, bob]).unwrap();

        let paths = ArtifactPaths::in_dir(dir);
        rec.save(&paths.model).unwrap();
        let digest = sha256_hex(&std::fs::read(&paths.model).unwrap());
        reg.document(Some(digest)).write(&paths.labels).unwrap();
        paths
    }

    /// Band that accepts an exact (zero-distance) match.
    fn exact_band() -> AcceptanceBand {
        AcceptanceBand::new(-1.0, 1.0).unwrap()
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_load_verified_pair_and_classify() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());

        let model: RecognitionModel = RecognitionModel::load(&paths, exact_band()).unwrap();
        assert_eq!(model.registry().len(), 2);

        let decision = model.classify(&texture(2)).unwrap();
        assert!(decision.accepted);
        assert_eq!(decision.label.as_deref(), Some("bob"));
    }

    #[test]
    fn test_default_band_rejects_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());
        let model: RecognitionModel = RecognitionModel::load(&paths, AcceptanceBand::default()).unwrap();

        let decision = model.classify(&texture(1)).unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.label, None);
        assert!(decision.confidence.abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_pair_detected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());

        // Overwrite the model with one from a "different run".
        let mut other = LbphRecognizer::default();
        other.train(&[texture(9)], &[IdentityId(0)]).unwrap();
        other.save(&paths.model).unwrap();

        let err = RecognitionModel::<LbphRecognizer>::load(&paths, exact_band()).unwrap_err();
        assert!(matches!(err, ModelError::MismatchedArtifacts { .. }), "got {err:?}");
    }

    #[test]
    fn test_unverified_registry_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());
        let mut reg = LabelRegistry::new();
        reg.register("alice");
        reg.register("bob");
        reg.save(&paths.labels).unwrap();

        assert!(RecognitionModel::<LbphRecognizer>::load(&paths, exact_band()).is_ok());
    }

    #[test]
    fn test_unknown_identity_is_fatal() {
        let mut rec = LbphRecognizer::default();
        rec.train(&[texture(1)], &[IdentityId(5)]).unwrap();
        let mut reg = LabelRegistry::new();
        reg.register("alice");
        let model = RecognitionModel::new(rec, InverseRegistry::from_registry(&reg), exact_band());

        let err = model.classify(&texture(1)).unwrap_err();
        assert!(matches!(err, ModelError::Gate(GateError::UnknownIdentityId(IdentityId(5)))));
    }

    #[test]
    fn test_recognize_per_region() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());
        let model: RecognitionModel = RecognitionModel::load(&paths, exact_band()).unwrap();

        // Frame with alice's texture on the left and bob's on the right.
        let mut frame = GrayImage::new(80, 40);
        image::imageops::replace(&mut frame, &texture(1), 0, 0);
        image::imageops::replace(&mut frame, &texture(2), 40, 0);
        let regions = [FaceRegion::new(40, 0, 40, 40), FaceRegion::new(0, 0, 40, 40)];

        let matches = model.recognize(&frame, &regions).unwrap();
        let labels: Vec<Option<&str>> = matches.iter().map(|m| m.decision.label.as_deref()).collect();
        assert_eq!(labels, vec![Some("bob"), Some("alice")]);
        assert_eq!(matches[0].region, regions[0]);
    }

    #[test]
    fn test_recognize_rejects_out_of_bounds_region() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());
        let model: RecognitionModel = RecognitionModel::load(&paths, exact_band()).unwrap();
        let err = model
            .recognize(&texture(1), &[FaceRegion::new(10, 10, 40, 40)])
            .unwrap_err();
        assert!(matches!(err, ModelError::Extract(_)));
    }

    #[test]
    fn test_slot_swap_keeps_old_readers_valid() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());
        let slot: ModelSlot = ModelSlot::new();
        assert!(slot.current().is_none());

        slot.load_and_publish(&paths, exact_band()).unwrap();
        let reader = slot.current().unwrap();

        let replaced = slot.publish(RecognitionModel::load(&paths, AcceptanceBand::default()).unwrap());
        assert!(Arc::ptr_eq(&replaced.unwrap(), &reader));
        assert_eq!(reader.band(), exact_band());
        assert_eq!(slot.current().unwrap().band(), AcceptanceBand::default());
    }

    #[test]
    fn test_slot_failed_load_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let paths = committed_pair(dir.path());
        let slot: ModelSlot = ModelSlot::new();
        slot.load_and_publish(&paths, exact_band()).unwrap();

        let missing = ArtifactPaths::in_dir(&dir.path().join("nope"));
        assert!(slot.load_and_publish(&missing, exact_band()).is_err());
        assert!(slot.current().is_some());
    }
}
