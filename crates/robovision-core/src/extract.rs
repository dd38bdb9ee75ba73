//! Face sample extraction — grayscale crops at detector-supplied regions.

use crate::types::FaceRegion;
use image::{DynamicImage, GrayImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The detector produced a region that does not fit the image it ran on.
    #[error("face region {region} is outside the {image_width}x{image_height} image")]
    OutOfBoundsCrop {
        region: FaceRegion,
        image_width: u32,
        image_height: u32,
    },
}

/// Convert `image` to grayscale and crop one sample per region.
pub fn extract(image: &DynamicImage, regions: &[FaceRegion]) -> Result<Vec<GrayImage>, ExtractError> {
    if regions.is_empty() {
        return Ok(Vec::new());
    }
    extract_gray(&image.to_luma8(), regions)
}

/// Crop regions out of an image that is already single-channel.
///
/// Every region is validated before any pixels are copied.
pub fn extract_gray(gray: &GrayImage, regions: &[FaceRegion]) -> Result<Vec<GrayImage>, ExtractError> {
    let (width, height) = gray.dimensions();
    if let Some(bad) = regions.iter().find(|r| !r.fits_within(width, height)) {
        return Err(ExtractError::OutOfBoundsCrop {
            region: *bad,
            image_width: width,
            image_height: height,
        });
    }

    Ok(regions
        .iter()
        .map(|r| image::imageops::crop_imm(gray, r.x, r.y, r.width, r.height).to_image())
        .collect())
}
