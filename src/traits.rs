use crate::errors::Result;
use ndarray::prelude::*;

/// Where the committed model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Trained,
    Dummy,
}

impl std::fmt::Display for LoadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trained => f.write_str("trained"),
            Self::Dummy => f.write_str("dummy"),
        }
    }
}

/// Abstraction over a binary segmentation network.
///
/// Implementations take a channels-last batch of one, `(1, h, w, 3)` with
/// values in `[0, 1]`, and return the per-pixel vessel probability map.
/// Shared across request threads, so anything mutable inside must be locked.
pub trait SegmentationModel: Send + Sync {
    /// One forward pass. No retries.
    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>>;

    /// (height, width) the model expects.
    fn input_size(&self) -> (u32, u32);

    /// (height, width) of the probability map, when known up front.
    fn output_size(&self) -> Option<(u32, u32)> {
        Some(self.input_size())
    }

    /// Total parameter count, when the runtime exposes it.
    fn param_count(&self) -> Option<u64> {
        None
    }

    fn trainable_param_count(&self) -> Option<u64> {
        self.param_count()
    }

    fn model_type(&self) -> &'static str {
        "U-Net"
    }

    fn load_source(&self) -> LoadSource;
}

