use image::{imageops, GrayImage};
use imageproc::contours::{find_contours, BorderType};
use ndarray::ArrayViewD;
use serde::Serialize;

/// Coverage and structure statistics of a cleaned vessel mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VesselMetrics {
    pub total_pixels: u64,
    pub vessel_pixels: u64,
    pub vessel_ratio: f64,
    pub vessel_percentage: f64,
    /// Outermost connected regions; holes and anything nested inside a hole
    /// are not counted separately.
    pub region_count: usize,
    pub average_region_size: f64,
    /// Wall-clock seconds for the whole request, stamped by the predictor.
    pub processing_time: f64,
}

impl VesselMetrics {
    pub fn with_processing_time(self, seconds: f64) -> Self {
        Self {
            processing_time: seconds,
            ..self
        }
    }
}

pub fn compute_metrics(mask: &GrayImage) -> VesselMetrics {
    let total_pixels = u64::from(mask.width()) * u64::from(mask.height());
    let vessel_pixels = mask.pixels().filter(|p| p[0] > 0).count() as u64;
    let vessel_ratio = if total_pixels > 0 {
        vessel_pixels as f64 / total_pixels as f64
    } else {
        0.0
    };

    let region_count = count_external_regions(mask);
    let average_region_size = if region_count > 0 {
        vessel_pixels as f64 / region_count as f64
    } else {
        0.0
    };

    VesselMetrics {
        total_pixels,
        vessel_pixels,
        vessel_ratio,
        vessel_percentage: vessel_ratio * 100.0,
        region_count,
        average_region_size,
        processing_time: 0.0,
    }
}

/// Border following treats the image frame as foreground, so trace a copy
/// with a one-pixel background margin.
fn count_external_regions(mask: &GrayImage) -> usize {
    let mut padded = GrayImage::new(mask.width() + 2, mask.height() + 2);
    imageops::replace(&mut padded, mask, 1, 1);

    find_contours::<u32>(&padded)
        .iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
        .count()
}

/// Mean of the raw probability map, before thresholding.
pub fn confidence_score(probabilities: ArrayViewD<'_, f32>) -> f64 {
    if probabilities.is_empty() {
        return 0.0;
    }
    let sum: f64 = probabilities.iter().map(|&p| f64::from(p)).sum();
    sum / probabilities.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use ndarray::Array2;

    #[test]
    fn empty_mask_has_no_regions() {
        let mask = GrayImage::new(100, 100);
        let metrics = compute_metrics(&mask);
        assert_eq!(metrics.total_pixels, 10_000);
        assert_eq!(metrics.vessel_pixels, 0);
        assert_eq!(metrics.region_count, 0);
        assert_eq!(metrics.average_region_size, 0.0);
        assert_eq!(metrics.vessel_ratio, 0.0);
    }

    #[test]
    fn counts_separate_regions() {
        let mut mask = GrayImage::new(60, 40);
        draw_filled_rect_mut(&mut mask, Rect::at(2, 2).of_size(10, 10), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(30, 5).of_size(5, 20), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(45, 30).of_size(3, 3), Luma([255]));

        let metrics = compute_metrics(&mask);
        assert_eq!(metrics.vessel_pixels, 100 + 100 + 9);
        assert_eq!(metrics.region_count, 3);
        let product = metrics.average_region_size * metrics.region_count as f64;
        assert!((product - metrics.vessel_pixels as f64).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&metrics.vessel_ratio));
        assert!((metrics.vessel_percentage - metrics.vessel_ratio * 100.0).abs() < 1e-12);
    }

    #[test]
    fn holes_and_nested_islands_are_not_counted() {
        let mut mask = GrayImage::new(40, 40);
        draw_filled_rect_mut(&mut mask, Rect::at(2, 2).of_size(30, 30), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(8, 8).of_size(18, 18), Luma([0]));
        draw_filled_rect_mut(&mut mask, Rect::at(14, 14).of_size(4, 4), Luma([255]));

        assert_eq!(compute_metrics(&mask).region_count, 1);
    }

    #[test]
    fn diagonal_touch_is_one_region() {
        let mut mask = GrayImage::new(10, 10);
        draw_filled_rect_mut(&mut mask, Rect::at(1, 1).of_size(3, 3), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(4, 4).of_size(3, 3), Luma([255]));

        assert_eq!(compute_metrics(&mask).region_count, 1);
    }

    #[test]
    fn full_mask_ratio_is_one() {
        let mask = GrayImage::from_pixel(8, 8, Luma([255]));
        let metrics = compute_metrics(&mask);
        assert_eq!(metrics.vessel_ratio, 1.0);
        assert_eq!(metrics.region_count, 1);
        assert_eq!(metrics.average_region_size, 64.0);
    }

    #[test]
    fn regions_touching_the_border_are_counted() {
        let mut mask = GrayImage::new(12, 10);
        draw_filled_rect_mut(&mut mask, Rect::at(0, 3).of_size(3, 4), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(6, 0).of_size(2, 10), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(10, 8).of_size(2, 2), Luma([255]));

        let metrics = compute_metrics(&mask);
        assert_eq!(metrics.vessel_pixels, 12 + 20 + 4);
        assert_eq!(metrics.region_count, 3);
        assert!((metrics.average_region_size - 12.0).abs() < 1e-9);
    }

    #[test]
    fn left_edge_block_is_one_region() {
        let mut mask = GrayImage::new(8, 8);
        draw_filled_rect_mut(&mut mask, Rect::at(0, 2).of_size(3, 4), Luma([255]));

        let metrics = compute_metrics(&mask);
        assert_eq!(metrics.vessel_pixels, 12);
        assert_eq!(metrics.region_count, 1);
        assert_eq!(metrics.average_region_size, 12.0);
    }

    #[test]
    fn confidence_is_mean_of_raw_probabilities() {
        let probabilities = Array2::from_shape_vec((2, 2), vec![0.1f32, 0.2, 0.3, 0.4]).unwrap();
        let confidence = confidence_score(probabilities.view().into_dyn());
        assert!((confidence - 0.25).abs() < 1e-6);

        let empty = Array2::<f32>::zeros((0, 4));
        assert_eq!(confidence_score(empty.view().into_dyn()), 0.0);
    }

    #[test]
    fn processing_time_is_stamped() {
        let metrics = compute_metrics(&GrayImage::new(2, 2)).with_processing_time(0.25);
        assert_eq!(metrics.processing_time, 0.25);
    }
}
