//! Model builder — scans a labelled dataset, gathers face samples and trains a recognizer.
//!
//! Labels are registered when their first image is discovered, before any
//! detection runs, so a directory whose images contain no detectable face
//! still owns an identity ID.

use crate::dataset::{self, ScanError, ScanEvent};
use crate::detector::Detector;
use crate::extract::{extract_gray, ExtractError};
use crate::gate::AcceptanceBand;
use crate::labels::{InverseRegistry, LabelRegistry};
use crate::model::{sha256_hex, ArtifactPaths, RecognitionModel};
use crate::recognizer::{Recognizer, RecognizerError};
use crate::types::{FaceSample, IdentityId};
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no faces were detected anywhere in the dataset; nothing to train on")]
    EmptyCorpus,
    #[error("dataset scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("detector returned an invalid face region for {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: ExtractError,
    },
    #[error("recognizer training failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to persist {path}: {source}; the training run must be repeated in full")]
    PersistenceFailure {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

/// Progress notifications emitted while training.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    /// A dataset directory is about to be scanned.
    DirectoryEntered { name: String },
    /// An image was decoded and run through the detector.
    ImageProcessed {
        label: String,
        path: PathBuf,
        faces: usize,
    },
    /// An image could not be decoded or detection failed on it.
    ImageSkipped { path: PathBuf, reason: String },
    /// Both artifacts were committed.
    Finished { samples: usize, identities: usize },
}

/// Receives one-way progress events. Implementations must not block.
pub trait TrainingObserver {
    fn notify(&self, event: TrainingEvent);
}

impl<F: Fn(TrainingEvent)> TrainingObserver for F {
    fn notify(&self, event: TrainingEvent) {
        self(event)
    }
}

pub struct NoopObserver;

impl TrainingObserver for NoopObserver {
    fn notify(&self, _event: TrainingEvent) {}
}

/// Samples gathered in one scan, in discovery order.
#[derive(Debug, Default)]
pub struct TrainingCorpus {
    samples: Vec<GrayImage>,
    ids: Vec<IdentityId>,
}

impl TrainingCorpus {
    pub fn push(&mut self, sample: FaceSample) {
        self.samples.push(sample.pixels);
        self.ids.push(sample.id);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn ids(&self) -> &[IdentityId] {
        &self.ids
    }

    pub fn samples(&self) -> &[GrayImage] {
        &self.samples
    }
}

/// Counters reported after a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSummary {
    pub images: usize,
    pub skipped_images: usize,
    pub samples: usize,
    pub identities: usize,
    pub artifacts: ArtifactPaths,
}

/// Drives the scan → detect → extract → train pipeline over a dataset tree.
pub struct Trainer<D, R> {
    detector: D,
    recognizer: R,
}

/// Outcome of [`Trainer::train`]: a trained recognizer plus the registry that names its IDs.
pub struct TrainedModel<R> {
    pub recognizer: R,
    pub registry: LabelRegistry,
    pub images: usize,
    pub skipped_images: usize,
    pub samples: usize,
}

impl<D: Detector, R: Recognizer> Trainer<D, R> {
    pub fn new(detector: D, recognizer: R) -> Self {
        Self { detector, recognizer }
    }

    /// Scan `root` and collect every detected face, tagged with its label's ID.
    pub fn gather(
        &mut self,
        root: &Path,
        observer: &dyn TrainingObserver,
    ) -> Result<(TrainingCorpus, LabelRegistry, GatherStats), TrainError> {
        let mut registry = LabelRegistry::new();
        let mut corpus = TrainingCorpus::default();
        let mut stats = GatherStats::default();
        let mut scan = dataset::scan(root)?;

        while let Some(event) = scan.next_event() {
            let entry = match event {
                ScanEvent::Directory(dir) => {
                    let name = dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| dir.display().to_string());
                    tracing::debug!(dir = %dir.display(), "checking directory");
                    observer.notify(TrainingEvent::DirectoryEntered { name });
                    continue;
                }
                ScanEvent::Image(entry) => entry,
            };

            let id = registry.register(&entry.label);
            stats.images += 1;
            tracing::debug!(label = %entry.label, %id, path = %entry.path.display(), "processing image");

            let gray = match image::open(&entry.path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    skip(observer, &mut stats, &entry.path, format!("decode failed: {e}"));
                    continue;
                }
            };
            let regions = match self.detector.detect(&gray) {
                Ok(regions) => regions,
                Err(e) => {
                    skip(observer, &mut stats, &entry.path, format!("detection failed: {e}"));
                    continue;
                }
            };
            let crops = extract_gray(&gray, &regions).map_err(|source| TrainError::Extract {
                path: entry.path.clone(),
                source,
            })?;

            observer.notify(TrainingEvent::ImageProcessed {
                label: entry.label.clone(),
                path: entry.path.clone(),
                faces: crops.len(),
            });
            for pixels in crops {
                corpus.push(FaceSample { pixels, id });
            }
        }

        tracing::info!(
            images = stats.images,
            skipped = stats.skipped_images,
            samples = corpus.len(),
            identities = registry.len(),
            "dataset scan complete"
        );
        Ok((corpus, registry, stats))
    }

    /// Build the model in memory. Nothing is written to disk.
    pub fn train(
        mut self,
        root: &Path,
        observer: &dyn TrainingObserver,
    ) -> Result<TrainedModel<R>, TrainError> {
        let (corpus, registry, stats) = self.gather(root, observer)?;
        if corpus.is_empty() {
            return Err(TrainError::EmptyCorpus);
        }

        self.recognizer.train(corpus.samples(), corpus.ids())?;
        tracing::info!(samples = corpus.len(), identities = registry.len(), "recognizer trained");

        Ok(TrainedModel {
            recognizer: self.recognizer,
            registry,
            images: stats.images,
            skipped_images: stats.skipped_images,
            samples: corpus.len(),
        })
    }

    /// Train over `root` and commit the registry/model pair to `artifacts`.
    pub fn run(
        self,
        root: &Path,
        artifacts: &ArtifactPaths,
        observer: &dyn TrainingObserver,
    ) -> Result<TrainingSummary, TrainError> {
        let trained = self.train(root, observer)?;
        trained.commit(artifacts)?;

        observer.notify(TrainingEvent::Finished {
            samples: trained.samples,
            identities: trained.registry.len(),
        });
        Ok(TrainingSummary {
            images: trained.images,
            skipped_images: trained.skipped_images,
            samples: trained.samples,
            identities: trained.registry.len(),
            artifacts: artifacts.clone(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GatherStats {
    pub images: usize,
    pub skipped_images: usize,
}

fn skip(observer: &dyn TrainingObserver, stats: &mut GatherStats, path: &Path, reason: String) {
    tracing::warn!(path = %path.display(), %reason, "skipping image");
    stats.skipped_images += 1;
    observer.notify(TrainingEvent::ImageSkipped {
        path: path.to_path_buf(),
        reason,
    });
}

impl<R: Recognizer> TrainedModel<R> {
    /// Persist registry and model as a matched pair.
    ///
    /// Both are staged next to their targets first; the registry is then
    /// renamed into place, followed by the model. The registry records the
    /// model's SHA-256 so a pair mixed from different runs is detected on load.
    pub fn commit(&self, artifacts: &ArtifactPaths) -> Result<(), TrainError> {
        for target in [&artifacts.labels, &artifacts.model] {
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| persistence(target, e))?;
            }
        }

        let mut staged = Staged::default();
        let model_tmp = staged.add(staging_path(&artifacts.model));
        let labels_tmp = staged.add(staging_path(&artifacts.labels));

        self.recognizer
            .save(&model_tmp)
            .map_err(|e| persistence(&artifacts.model, e))?;
        let model_bytes = std::fs::read(&model_tmp).map_err(|e| persistence(&artifacts.model, e))?;
        let digest = sha256_hex(&model_bytes);

        self.registry
            .document(Some(digest.clone()))
            .write(&labels_tmp)
            .map_err(|e| persistence(&artifacts.labels, e))?;

        // The previous registry is set aside so a failed model rename can put it back.
        let backup = sibling_path(&artifacts.labels, ".bak");
        let had_previous = artifacts.labels.is_file();
        if had_previous {
            std::fs::rename(&artifacts.labels, &backup).map_err(|e| persistence(&artifacts.labels, e))?;
        }
        if let Err(e) = std::fs::rename(&labels_tmp, &artifacts.labels) {
            restore_registry(&backup, &artifacts.labels, had_previous);
            return Err(persistence(&artifacts.labels, e));
        }
        if let Err(e) = std::fs::rename(&model_tmp, &artifacts.model) {
            if let Err(err) = std::fs::remove_file(&artifacts.labels) {
                tracing::warn!(path = %artifacts.labels.display(), error = %err, "failed to remove unpaired registry");
            }
            restore_registry(&backup, &artifacts.labels, had_previous);
            return Err(persistence(&artifacts.model, e));
        }
        if had_previous {
            if let Err(e) = std::fs::remove_file(&backup) {
                tracing::warn!(path = %backup.display(), error = %e, "failed to remove registry backup");
            }
        }

        tracing::info!(
            labels = %artifacts.labels.display(),
            model = %artifacts.model.display(),
            model_sha256 = %digest,
            "training artifacts committed"
        );
        Ok(())
    }

    /// Use the freshly trained pair for recognition without a disk round trip.
    pub fn into_recognition_model(self, band: AcceptanceBand) -> RecognitionModel<R> {
        let registry = InverseRegistry::from_registry(&self.registry);
        RecognitionModel::new(self.recognizer, registry, band)
    }
}

fn persistence(path: &Path, err: impl Into<BoxError>) -> TrainError {
    TrainError::PersistenceFailure {
        path: path.to_path_buf(),
        source: err.into(),
    }
}

fn staging_path(target: &Path) -> PathBuf {
    sibling_path(target, ".tmp")
}

fn sibling_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    target.with_file_name(name)
}

/// Put the registry that was current before this commit back in place.
fn restore_registry(backup: &Path, labels: &Path, had_previous: bool) {
    if !had_previous {
        return;
    }
    if let Err(e) = std::fs::rename(backup, labels) {
        tracing::error!(
            backup = %backup.display(),
            labels = %labels.display(),
            error = %e,
            "failed to restore previous label registry"
        );
    }
}

/// Staging files removed on drop unless already renamed away.
#[derive(Default)]
struct Staged(Vec<PathBuf>);

impl Staged {
    fn add(&mut self, path: PathBuf) -> PathBuf {
        self.0.push(path.clone());
        path
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        for path in &self.0 {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove staging file");
                }
            }
        }
    }
}
