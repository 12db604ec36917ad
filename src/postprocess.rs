use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_close, grayscale_open, Mask};
use ndarray::ArrayViewD;
use tracing::debug;

use crate::{
    config::{Config, MAX_KERNEL_SIZE},
    errors::Result,
    geometry,
};

/// Turns a raw probability map into a cleaned binary mask at the original
/// image resolution.
#[derive(Debug, Clone, Copy)]
pub struct MaskPostprocessor {
    threshold: f32,
    kernel_size: u32,
}

impl MaskPostprocessor {
    pub const fn new(threshold: f32, kernel_size: u32) -> Self {
        Self {
            threshold,
            kernel_size,
        }
    }

    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.threshold, config.kernel_size)
    }

    /// Threshold, resize back to `original` `(height, width)`, then clean.
    pub fn process(&self, probabilities: ArrayViewD<'_, f32>, original: (u32, u32)) -> Result<GrayImage> {
        let mask = geometry::to_original_resolution(probabilities, self.threshold, original)?;
        debug!(
            width = mask.width(),
            height = mask.height(),
            "mask resized to original resolution"
        );
        Ok(self.clean(&mask))
    }

    pub fn clean(&self, mask: &GrayImage) -> GrayImage {
        clean_mask(mask, self.kernel_size)
    }
}

/// Ellipse inscribed in a `size`x`size` square, built row by row with the
/// same rounding as OpenCV's `MORPH_ELLIPSE`. Size 3 is the 3x3 cross.
pub fn ellipse_element(size: u32) -> Mask {
    let size = size.clamp(1, MAX_KERNEL_SIZE);
    let radius = size / 2;
    let r = f64::from(radius);

    let mut element = GrayImage::new(size, size);
    for y in 0..size {
        let dy = f64::from(y.abs_diff(radius));
        let half_width = if radius == 0 {
            0
        } else {
            (r * ((r * r - dy * dy) / (r * r)).sqrt()).round() as u32
        };
        let start = radius.saturating_sub(half_width);
        let end = (radius + half_width + 1).min(size);
        for x in start..end {
            element.put_pixel(x, y, Luma([u8::MAX]));
        }
    }
    Mask::from_image(&element, radius as u8, radius as u8)
}

/// Opening followed by closing with an elliptical element of side
/// `kernel_size`.
///
/// Opening drops isolated speckles, closing bridges small gaps inside a
/// vessel. Pixels outside the image never take part. Size 1 is the identity.
pub fn clean_mask(mask: &GrayImage, kernel_size: u32) -> GrayImage {
    let element = ellipse_element(kernel_size);
    let opened = grayscale_open(mask, &element);
    grayscale_close(&opened, &element)
}
