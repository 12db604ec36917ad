use image::{GrayImage, ImageBuffer, Rgb, RgbImage};

use crate::errors::{Result, VesselSegError};

pub const DEFAULT_ALPHA: f32 = 0.4;
const TINT: [f32; 3] = [255.0, 0.0, 0.0];

/// Blend a red tint into `image` wherever `mask` is set.
///
/// `alpha` is the tint weight in [0, 1]; pixels outside the mask are copied
/// unchanged.
pub fn render(image: &RgbImage, mask: &GrayImage, alpha: f32) -> Result<RgbImage> {
    if image.dimensions() != mask.dimensions() {
        return Err(VesselSegError::Postprocess {
            reason: format!(
                "overlay needs matching sizes, image {:?} vs mask {:?}",
                image.dimensions(),
                mask.dimensions()
            ),
        });
    }
    let alpha = alpha.clamp(0.0, 1.0);

    let pixels = image
        .pixels()
        .zip(mask.pixels())
        .flat_map(|(&Rgb(rgb), mask_pixel)| {
            let covered = mask_pixel.0[0] > 0;
            let mut out = rgb;
            if covered {
                for (channel, tint) in out.iter_mut().zip(TINT) {
                    let blended = f32::from(*channel) * (1.0 - alpha) + tint * alpha;
                    *channel = blended.round().clamp(0.0, 255.0) as u8;
                }
            }
            out
        })
        .collect::<Vec<u8>>();

    ImageBuffer::from_raw(image.width(), image.height(), pixels).ok_or_else(|| {
        VesselSegError::Postprocess {
            reason: "failed to build overlay buffer from blended pixels".to_string(),
        }
    })
}
