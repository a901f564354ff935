//! Loading frames and templates from disk via the `image` crate.
//!
//! Available when the `image-io` feature is enabled.

use crate::image::OwnedImage;
use crate::util::{CalibError, CalibResult};
use std::path::Path;

/// Creates an owned image from a grayscale image buffer.
pub fn owned_from_gray_image(img: &image::GrayImage) -> CalibResult<OwnedImage> {
    let width = img.width() as usize;
    let height = img.height() as usize;
    OwnedImage::new(img.as_raw().clone(), width, height)
}

/// Loads an image from disk and converts it to a grayscale owned image.
pub fn load_gray_image<P: AsRef<Path>>(path: P) -> CalibResult<OwnedImage> {
    let img = image::open(path).map_err(|err| CalibError::ImageIo {
        reason: err.to_string(),
    })?;
    owned_from_gray_image(&img.to_luma8())
}
