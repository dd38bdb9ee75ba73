//! robovision-core — face identity training and recognition pipeline.
//!
//! A dataset tree of `<root>/<person>/<image>` files is scanned, faces are
//! detected and cropped, and an LBPH recognizer is trained and committed
//! together with its label registry. At runtime the pair is loaded and raw
//! recognizer output is filtered through an acceptance band.

pub mod dataset;
pub mod detector;
pub mod extract;
pub mod gate;
pub mod labels;
pub mod model;
pub mod recognizer;
pub mod trainer;
pub mod types;

pub use detector::{Detector, ScrfdDetector};
pub use gate::{AcceptanceBand, RecognitionDecision, RecognitionGate};
pub use labels::{InverseRegistry, LabelRegistry};
pub use model::{ArtifactPaths, FaceMatch, ModelSlot, RecognitionModel};
pub use recognizer::{LbphRecognizer, Recognizer};
pub use trainer::{Trainer, TrainingEvent, TrainingObserver, TrainingSummary};
pub use types::{FaceRegion, FaceSample, IdentityId, Prediction};
