use std::path::Path;

use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
    },
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    errors::{Result, VesselSegError},
    geometry::squeeze_to_2d,
    traits::{LoadSource, SegmentationModel},
};

/// How the session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProfile {
    /// Hardware providers first, full graph optimization.
    Accelerated { device_id: i32 },
    /// CPU only, graph optimization disabled. Loads graphs exported by older
    /// toolchains that the optimizer rejects.
    Compatibility,
}

impl SessionProfile {
    const fn strategy_name(&self) -> &'static str {
        match self {
            Self::Accelerated { .. } => "standard",
            Self::Compatibility => "compatibility",
        }
    }
}

/// Channel placement of the graph's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `(n, h, w, c)`, as exported from Keras.
    ChannelsLast,
    /// `(n, c, h, w)`, as exported from PyTorch.
    ChannelsFirst,
}

pub struct OnnxModel {
    input_size: (u32, u32),
    output_size: Option<(u32, u32)>,
    layout: TensorLayout,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxModel {
    /// Build a session for `model_path` and run one warm-up pass.
    ///
    /// `configured_size` is used only when the graph leaves its spatial input
    /// dimensions dynamic. Every failure comes back as `ModelLoad`.
    pub fn load(
        model_path: &Path,
        profile: SessionProfile,
        configured_size: (u32, u32),
    ) -> Result<Self> {
        let strategy = profile.strategy_name();
        let load_err = |operation: &str, e: &dyn std::fmt::Display| {
            VesselSegError::model_load(strategy, format!("{}: {}", operation, e))
        };

        let builder = SessionBuilder::new().map_err(|e| load_err("session builder init", &e))?;
        let builder = match profile {
            SessionProfile::Accelerated { device_id } => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| load_err("execution provider setup", &e))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| load_err("graph optimization setup", &e))?
                .with_memory_pattern(true)
                .map_err(|e| load_err("memory pattern setup", &e))?,
            SessionProfile::Compatibility => builder
                .with_execution_providers([CPUExecutionProvider::default().build()])
                .map_err(|e| load_err("execution provider setup", &e))?
                .with_optimization_level(GraphOptimizationLevel::Disable)
                .map_err(|e| load_err("graph optimization setup", &e))?,
        };
        let session = builder
            .commit_from_file(model_path)
            .map_err(|e| load_err(&format!("model file read: {}", model_path.display()), &e))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| VesselSegError::model_load(strategy, "graph has no inputs"))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| VesselSegError::model_load(strategy, "graph has no outputs"))?;
        let input_shape: Vec<i64> = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| VesselSegError::model_load(strategy, "image input is not a tensor"))?
            .iter()
            .copied()
            .collect();
        let output_shape: Option<Vec<i64>> = output
            .output_type
            .tensor_shape()
            .map(|shape| shape.iter().copied().collect());

        let (layout, input_size) = resolve_input(&input_shape, configured_size)
            .map_err(|reason| VesselSegError::model_load(strategy, reason))?;
        let output_size = output_shape.as_deref().and_then(spatial_output_size);
        let input_name = input.name.clone();
        let output_name = output.name.clone();

        let model = Self {
            input_size,
            output_size,
            layout,
            input_name,
            output_name,
            session: Mutex::new(session),
        };

        // initialize model
        let (height, width) = input_size;
        let warm_up = Array4::<f32>::zeros((1, height as usize, width as usize, 3));
        model
            .infer(warm_up.view())
            .map_err(|e| VesselSegError::model_load(strategy, format!("warm-up run: {}", e.chain_message())))?;

        debug!(?layout, ?input_size, ?output_size, "onnx session ready");
        Ok(model)
    }
}

/// Work out channel placement and spatial size from the declared input shape.
fn resolve_input(
    shape: &[i64],
    configured: (u32, u32),
) -> std::result::Result<(TensorLayout, (u32, u32)), String> {
    if shape.len() != 4 {
        return Err(format!("expected a 4-D image input, got shape {:?}", shape));
    }
    let (layout, h, w) = if shape[3] == 3 {
        (TensorLayout::ChannelsLast, shape[1], shape[2])
    } else if shape[1] == 3 {
        (TensorLayout::ChannelsFirst, shape[2], shape[3])
    } else {
        return Err(format!("no 3-channel axis in input shape {:?}", shape));
    };

    let declared = |dim: i64, fallback: u32| if dim > 0 { dim as u32 } else { fallback };
    let size = (declared(h, configured.0), declared(w, configured.1));
    if size != configured {
        warn!(
            declared = ?size,
            configured = ?configured,
            "model declares a fixed input size that differs from the configuration; using the model's"
        );
    }
    Ok((layout, size))
}

fn spatial_output_size(shape: &[i64]) -> Option<(u32, u32)> {
    let spatial: Vec<u32> = shape
        .iter()
        .skip(1)
        .filter(|&&d| d > 1)
        .map(|&d| d as u32)
        .collect();
    match spatial.as_slice() {
        &[h, w] if shape.iter().skip(1).all(|&d| d >= 1) => Some((h, w)),
        _ => None,
    }
}

impl SegmentationModel for OnnxModel {
    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>> {
        let tensor = match self.layout {
            TensorLayout::ChannelsLast => batch,
            TensorLayout::ChannelsFirst => batch.permuted_axes([0, 3, 1, 2]),
        };

        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        let probabilities = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        let shape = probabilities.shape().to_vec();

        squeeze_to_2d(probabilities)
            .map(|map| map.to_owned())
            .ok_or_else(|| {
                VesselSegError::inference(
                    "output shape check",
                    format!("model output of shape {:?} is not a single mask", shape),
                )
            })
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn output_size(&self) -> Option<(u32, u32)> {
        self.output_size
    }

    fn model_type(&self) -> &'static str {
        "U-Net (onnx)"
    }

    fn load_source(&self) -> LoadSource {
        LoadSource::Trained
    }
}
