//! Recognition gate — turns a raw `(id, distance)` prediction into a named match.
//!
//! A match is accepted only when its distance lies in `(low, high]`. Distances
//! at or below `low` are degenerate near-exact hits and distances above `high`
//! are too weak; both are rejected rather than treated as errors.

use crate::labels::InverseRegistry;
use crate::types::{IdentityId, Prediction};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_ACCEPT_LOW: f64 = 75.0;
pub const DEFAULT_ACCEPT_HIGH: f64 = 95.0;

#[derive(Error, Debug, PartialEq)]
pub enum GateError {
    /// The recognizer produced an ID the loaded registry does not know; the
    /// model and registry come from different training runs.
    #[error("identity {0} is not in the loaded label registry (model/registry mismatch)")]
    UnknownIdentityId(IdentityId),
    #[error("invalid acceptance band ({low}, {high}]: need finite low < high")]
    InvalidBand { low: f64, high: f64 },
}

/// Half-open distance band `(low, high]` inside which matches are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcceptanceBand {
    low: f64,
    high: f64,
}

impl Default for AcceptanceBand {
    fn default() -> Self {
        Self {
            low: DEFAULT_ACCEPT_LOW,
            high: DEFAULT_ACCEPT_HIGH,
        }
    }
}

impl AcceptanceBand {
    pub fn new(low: f64, high: f64) -> Result<Self, GateError> {
        if !low.is_finite() || !high.is_finite() || low >= high {
            return Err(GateError::InvalidBand { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn contains(&self, distance: f64) -> bool {
        distance > self.low && distance <= self.high
    }
}

/// Outcome for one detected face. Derived per frame, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionDecision {
    pub accepted: bool,
    /// Present only when accepted.
    pub label: Option<String>,
    /// The recognizer's raw distance, reported whether or not it was accepted.
    pub confidence: f64,
}

/// Applies an [`AcceptanceBand`] and resolves accepted IDs through a loaded registry.
///
/// Holds only shared references, so one gate can serve concurrent callers.
#[derive(Debug, Clone, Copy)]
pub struct RecognitionGate<'a> {
    band: AcceptanceBand,
    registry: &'a InverseRegistry,
}

impl<'a> RecognitionGate<'a> {
    pub fn new(band: AcceptanceBand, registry: &'a InverseRegistry) -> Self {
        Self { band, registry }
    }

    pub fn band(&self) -> AcceptanceBand {
        self.band
    }

    pub fn decide(&self, id: IdentityId, distance: f64) -> Result<RecognitionDecision, GateError> {
        if !self.band.contains(distance) {
            return Ok(RecognitionDecision {
                accepted: false,
                label: None,
                confidence: distance,
            });
        }

        let label = self
            .registry
            .label(id)
            .ok_or(GateError::UnknownIdentityId(id))?;
        tracing::debug!(%id, label, distance, "face identified");
        Ok(RecognitionDecision {
            accepted: true,
            label: Some(label.to_string()),
            confidence: distance,
        })
    }

    pub fn decide_prediction(&self, prediction: Prediction) -> Result<RecognitionDecision, GateError> {
        self.decide(prediction.id, prediction.distance)
    }
}
