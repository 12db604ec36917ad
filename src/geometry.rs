use image::{imageops, imageops::FilterType, GrayImage, Luma, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{Result, VesselSegError};

/// Resize to the model resolution and normalize into a `(1, h, w, 3)` batch.
///
/// Bilinear when feeding the network; `target` is `(height, width)`.
pub fn to_model_input(image: &RgbImage, target: (u32, u32)) -> Result<Array4<f32>> {
    let (height, width) = target;
    if image.width() == 0 || image.height() == 0 {
        return Err(VesselSegError::Preprocess {
            reason: format!(
                "cannot resize a degenerate {}x{} image",
                image.width(),
                image.height()
            ),
        });
    }
    if height == 0 || width == 0 {
        return Err(VesselSegError::Preprocess {
            reason: format!("model input size {}x{} is degenerate", height, width),
        });
    }

    let resized = imageops::resize(image, width, height, FilterType::Triangle);
    // (c, h, w) -> (h, w, c)
    let tensor = resized
        .as_ndarray3()
        .permuted_axes([1, 2, 0])
        .mapv(|v| f32::from(v) / 255.0)
        .insert_axis(Axis(0));

    Ok(tensor.as_standard_layout().into_owned())
}

/// Drop size-1 batch/channel axes until a `(h, w)` map remains.
pub fn squeeze_to_2d<'a>(array: ArrayViewD<'a, f32>) -> Option<ArrayView2<'a, f32>> {
    let mut array = array;
    while array.ndim() > 2 {
        let last = array.ndim() - 1;
        let axis = if array.len_of(Axis(0)) == 1 {
            0
        } else if array.len_of(Axis(last)) == 1 {
            last
        } else {
            array.shape().iter().position(|&len| len == 1)?
        };
        array = array.index_axis_move(Axis(axis), 0);
    }
    array.into_dimensionality::<Ix2>().ok()
}

/// Threshold a probability map and scale it back to the original image.
///
/// Nearest-neighbour so the upscaled mask keeps hard edges instead of
/// inventing fractional vessel pixels. Output values are exactly 0 or 255.
pub fn to_original_resolution(
    probabilities: ArrayViewD<'_, f32>,
    threshold: f32,
    original: (u32, u32),
) -> Result<GrayImage> {
    let shape = probabilities.shape().to_vec();
    let map = squeeze_to_2d(probabilities).ok_or_else(|| VesselSegError::Postprocess {
        reason: format!("probability map of shape {:?} is not a 2-D mask", shape),
    })?;

    let (height, width) = original;
    if height == 0 || width == 0 || map.is_empty() {
        return Err(VesselSegError::Postprocess {
            reason: format!(
                "cannot resize a {:?} mask to {}x{}",
                map.shape(),
                height,
                width
            ),
        });
    }

    let (rows, cols) = map.dim();
    let binary: Vec<u8> = map.iter().map(|&p| u8::from(p > threshold)).collect();
    let binary = GrayImage::from_raw(cols as u32, rows as u32, binary).ok_or_else(|| {
        VesselSegError::Postprocess {
            reason: "binary mask buffer does not match its dimensions".to_string(),
        }
    })?;

    let mut mask = imageops::resize(&binary, width, height, FilterType::Nearest);
    for Luma([value]) in mask.pixels_mut() {
        *value = if *value > 0 { u8::MAX } else { 0 };
    }
    Ok(mask)
}
