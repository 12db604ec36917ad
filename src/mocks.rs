use crate::errors::{Result, VesselSegError};
use crate::traits::{LoadSource, SegmentationModel};
use ndarray::prelude::*;

/// How the mock model fills its probability map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockOutput {
    /// The same probability everywhere.
    Constant(f32),
    /// Vertical bands of `width` columns at 0.9 separated by `gap` columns at 0.1.
    Stripes { width: usize, gap: usize },
    /// Echo the mean of the three input channels.
    Brightness,
    /// Every forward pass fails.
    Fail,
}

/// Test double for a segmentation network.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub input_size: (u32, u32),
    pub output: MockOutput,
}

impl MockSegmentationModel {
    pub const fn new(input_size: (u32, u32)) -> Self {
        Self {
            input_size,
            output: MockOutput::Constant(0.0),
        }
    }

    pub const fn with_output(mut self, output: MockOutput) -> Self {
        self.output = output;
        self
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (_, height, width, _) = batch.dim();
        match self.output {
            MockOutput::Constant(p) => Ok(Array2::from_elem((height, width), p)),
            MockOutput::Stripes { width: band, gap } => {
                let period = (band + gap).max(1);
                Ok(Array2::from_shape_fn((height, width), |(_, x)| {
                    if x % period < band {
                        0.9
                    } else {
                        0.1
                    }
                }))
            }
            MockOutput::Brightness => Ok(batch
                .index_axis(Axis(0), 0)
                .mean_axis(Axis(2))
                .unwrap_or_else(|| Array2::zeros((height, width)))),
            MockOutput::Fail => Err(VesselSegError::inference(
                "mock forward pass",
                "mock model configured to fail",
            )),
        }
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn param_count(&self) -> Option<u64> {
        Some(0)
    }

    fn model_type(&self) -> &'static str {
        "mock"
    }

    fn load_source(&self) -> LoadSource {
        LoadSource::Trained
    }
}

/// Mock sized like the default serving resolution.
pub const fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new((256, 256))
}
