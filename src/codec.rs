//! Conversion between portable encoded images and in-memory pixel buffers.
//!
//! Requests arrive as raw base64, as `data:<mime>;base64,<payload>` URIs or as
//! raw container bytes. Results go back out as data-URIs.

use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use ndarray::ArrayViewD;

use crate::errors::{Result, VesselSegError};

const DATA_URI_SCHEME: &str = "data:";

/// Decode a base64 payload, with or without a data-URI header, into RGB.
pub fn decode(encoded: &str) -> Result<RgbImage> {
    // line-wrapped payloads (MIME, `base64` CLI) decode like unwrapped ones
    let payload: String = strip_data_uri(encoded.trim())
        .split_ascii_whitespace()
        .collect();
    let bytes = STANDARD.decode(payload)?;
    decode_bytes(&bytes)
}

/// Decode raw container bytes (PNG, JPEG, ...) into RGB.
///
/// Grayscale and alpha sources are converted; alpha is dropped.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes)?;
    let image = image.into_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(VesselSegError::decode(
            "image dimension check",
            "decoded image has zero width or height",
        ));
    }
    Ok(image)
}

fn strip_data_uri(encoded: &str) -> &str {
    if !encoded.starts_with(DATA_URI_SCHEME) {
        return encoded;
    }
    match encoded.split_once(',') {
        Some((_, payload)) => payload,
        None => "",
    }
}

/// Pixel sample types the encoder accepts. Integers are taken as-is, floats
/// are assumed to be in `[0, 1]`.
pub trait Sample: Copy {
    fn to_u8(self) -> u8;
}

impl Sample for u8 {
    fn to_u8(self) -> u8 {
        self
    }
}

impl Sample for f32 {
    fn to_u8(self) -> u8 {
        (self * 255.0).clamp(0.0, 255.0) as u8
    }
}

impl Sample for f64 {
    fn to_u8(self) -> u8 {
        (self * 255.0).clamp(0.0, 255.0) as u8
    }
}

/// Encode a 2-D `(h, w)` or 3-D `(h, w, 1 | 3)` array into a data-URI.
pub fn encode<S: Sample>(array: ArrayViewD<'_, S>, format: &str) -> Result<String> {
    let shape = array.shape().to_vec();
    let image = match shape.as_slice() {
        &[height, width] | &[height, width, 1] => {
            let pixels = array.iter().map(|v| v.to_u8()).collect();
            GrayImage::from_raw(width as u32, height as u32, pixels).map(DynamicImage::ImageLuma8)
        }
        &[height, width, 3] => {
            let pixels = array.iter().map(|v| v.to_u8()).collect();
            RgbImage::from_raw(width as u32, height as u32, pixels).map(DynamicImage::ImageRgb8)
        }
        _ => None,
    }
    .ok_or_else(|| {
        VesselSegError::encode(
            "array to image conversion",
            format!("unsupported image shape: {:?}", shape),
        )
    })?;

    encode_image(&image, format)
}

/// Encode an image into `data:image/<format>;base64,<payload>`.
pub fn encode_image(image: &DynamicImage, format: &str) -> Result<String> {
    let mime_suffix = format.to_ascii_lowercase();
    let image_format = ImageFormat::from_extension(&mime_suffix).ok_or_else(|| {
        VesselSegError::encode(
            "output format lookup",
            format!("unknown image format: {}", format),
        )
    })?;

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image_format)
        .map_err(|e| VesselSegError::encode(format!("{} serialization", mime_suffix), e))?;

    Ok(format!(
        "{}image/{};base64,{}",
        DATA_URI_SCHEME,
        mime_suffix,
        STANDARD.encode(buffer.into_inner())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::{Array2, Array3};

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8])
        })
    }

    fn raw_base64(image: &RgbImage) -> String {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        STANDARD.encode(buffer.into_inner())
    }

    #[test]
    fn png_round_trip_is_exact() -> Result<()> {
        let image = gradient(17, 9);
        let array = Array3::from_shape_vec((9, 17, 3), image.as_raw().clone()).unwrap();

        let encoded = encode(array.view().into_dyn(), "PNG")?;
        assert!(encoded.starts_with("data:image/png;base64,"));

        let decoded = decode(&encoded)?;
        assert_eq!(decoded, image);
        Ok(())
    }

    #[test]
    fn jpeg_round_trip_is_close() -> Result<()> {
        let image = RgbImage::from_pixel(32, 32, Rgb([120, 60, 200]));
        let encoded = encode_image(&DynamicImage::ImageRgb8(image.clone()), "jpeg")?;
        assert!(encoded.starts_with("data:image/jpeg;base64,"));

        let decoded = decode(&encoded)?;
        assert_eq!(decoded.dimensions(), image.dimensions());
        for (a, b) in decoded.pixels().zip(image.pixels()) {
            for c in 0..3 {
                assert!(a[c].abs_diff(b[c]) <= 8, "{:?} vs {:?}", a, b);
            }
        }
        Ok(())
    }

    #[test]
    fn accepts_raw_base64_without_prefix() -> Result<()> {
        let image = gradient(5, 4);
        let decoded = decode(&raw_base64(&image))?;
        assert_eq!(decoded, image);
        Ok(())
    }

    #[test]
    fn converts_grayscale_and_alpha_sources_to_rgb() -> Result<()> {
        let gray = GrayImage::from_pixel(3, 2, image::Luma([77]));
        let encoded = encode_image(&DynamicImage::ImageLuma8(gray), "png")?;
        let decoded = decode(&encoded)?;
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([77, 77, 77]));

        let rgba = image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 0]));
        let encoded = encode_image(&DynamicImage::ImageRgba8(rgba), "png")?;
        let decoded = decode(&encoded)?;
        assert_eq!(decoded.get_pixel(1, 1), &Rgb([10, 20, 30]));
        Ok(())
    }

    #[test]
    fn float_input_is_rescaled() -> Result<()> {
        let array = Array2::from_shape_vec((1, 3), vec![0.0f32, 0.5, 1.0]).unwrap();
        let encoded = encode(array.view().into_dyn(), "png")?;
        let decoded = decode(&encoded)?;
        assert_eq!(decoded.get_pixel(0, 0)[0], 0);
        assert_eq!(decoded.get_pixel(1, 0)[0], 127);
        assert_eq!(decoded.get_pixel(2, 0)[0], 255);
        Ok(())
    }

    #[test]
    fn double_precision_input_is_rescaled() -> Result<()> {
        let array = Array3::from_shape_vec((1, 2, 1), vec![0.25f64, 2.0]).unwrap();
        let decoded = decode(&encode(array.view().into_dyn(), "png")?)?;
        assert_eq!(decoded.get_pixel(0, 0)[0], 63);
        assert_eq!(decoded.get_pixel(1, 0)[0], 255);
        Ok(())
    }

    #[test]
    fn accepts_line_wrapped_base64() -> Result<()> {
        let image = gradient(40, 40);
        let payload = raw_base64(&image);
        assert!(payload.len() > 76);
        let wrapped = payload
            .as_bytes()
            .chunks(76)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");

        assert_eq!(decode(&wrapped)?, image);
        assert_eq!(decode(&format!("data:image/png;base64,\n{}\n", wrapped))?, image);
        Ok(())
    }

    #[test]
    fn rejects_unsupported_shapes() {
        let array = Array3::<u8>::zeros((4, 4, 2));
        let err = encode(array.view().into_dyn(), "png").unwrap_err();
        assert!(matches!(err, VesselSegError::Encode { .. }));

        let array = ndarray::Array1::<u8>::zeros(4);
        assert!(encode(array.view().into_dyn(), "png").is_err());
    }

    #[test]
    fn rejects_unknown_format() {
        let array = Array2::<u8>::zeros((2, 2));
        let err = encode(array.view().into_dyn(), "nope").unwrap_err();
        assert!(matches!(err, VesselSegError::Encode { .. }));
    }

    #[test]
    fn malformed_base64_is_a_decode_error() {
        let err = decode("data:image/png;base64,@@not base64@@").unwrap_err();
        assert!(matches!(err, VesselSegError::Decode { .. }));
    }

    #[test]
    fn non_image_bytes_are_a_decode_error() {
        let payload = STANDARD.encode(b"this is certainly not an image");
        let err = decode(&payload).unwrap_err();
        assert!(matches!(err, VesselSegError::Decode { .. }));

        let err = decode_bytes(b"plain text").unwrap_err();
        assert!(matches!(err, VesselSegError::Decode { .. }));
    }
}
