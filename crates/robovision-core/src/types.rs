use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense, zero-based identity number assigned to a label during one training run.
///
/// IDs are only meaningful together with the registry that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u32);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned face rectangle in pixel coordinates of the image it was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// True when the region is non-empty and lies entirely inside a `width`×`height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }
}

impl fmt::Display for FaceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// A grayscale face crop tagged with the identity of its source directory.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub pixels: GrayImage,
    pub id: IdentityId,
}

/// Raw nearest-match output of a recognizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub id: IdentityId,
    /// Dissimilarity of the nearest training sample. Lower is closer; not a probability.
    pub distance: f64,
}
