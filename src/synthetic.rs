//! Untrained U-Net used when no trained artifact can be loaded.
//!
//! The output is syntactically valid but meaningless: it only exists so the
//! service keeps answering requests with correctly shaped masks. Weights are
//! He-uniform from a seeded RNG and biases are zero, so the network is fully
//! deterministic and maps an all-zero image to a flat 0.5 probability map.

use ndarray::{concatenate, linalg::general_mat_mul, prelude::*};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    errors::{Result, VesselSegError},
    traits::{LoadSource, SegmentationModel},
};

pub const DEFAULT_BASE_CHANNELS: usize = 4;

/// Two 2x pooling stages, so both spatial sides must divide by this.
const SPATIAL_DIVISOR: u32 = 4;

#[derive(Debug, Clone, Copy)]
enum Activation {
    Relu,
    Sigmoid,
}

impl Activation {
    fn apply(self, value: f32) -> f32 {
        match self {
            Self::Relu => value.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        }
    }
}

/// Same-padded convolution over a `(h, w, c)` feature map.
struct Conv2d {
    /// (kernel, kernel, in_channels, out_channels)
    weights: Array4<f32>,
    bias: Array1<f32>,
    activation: Activation,
}

impl Conv2d {
    fn new(
        rng: &mut StdRng,
        kernel: usize,
        in_channels: usize,
        out_channels: usize,
        activation: Activation,
    ) -> Self {
        let fan_in = (kernel * kernel * in_channels) as f32;
        let limit = (6.0 / fan_in).sqrt();
        let weights = Array4::from_shape_simple_fn(
            (kernel, kernel, in_channels, out_channels),
            || rng.gen_range(-limit..limit),
        );
        Self {
            weights,
            bias: Array1::zeros(out_channels),
            activation,
        }
    }

    fn param_count(&self) -> u64 {
        (self.weights.len() + self.bias.len()) as u64
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (height, width, in_channels) = input.dim();
        let (kernel, _, _, out_channels) = self.weights.dim();
        let pad = kernel / 2;

        let mut padded = Array3::<f32>::zeros((height + 2 * pad, width + 2 * pad, in_channels));
        padded
            .slice_mut(s![pad..pad + height, pad..pad + width, ..])
            .assign(input);

        let mut output = Array2::<f32>::zeros((height * width, out_channels));
        for ky in 0..kernel {
            for kx in 0..kernel {
                let window = padded.slice(s![ky..ky + height, kx..kx + width, ..]);
                let patch = window.to_shape((height * width, in_channels))?;
                let taps = self.weights.slice(s![ky, kx, .., ..]);
                general_mat_mul(1.0, &patch, &taps, 1.0, &mut output);
            }
        }
        output += &self.bias;
        output.mapv_inplace(|v| self.activation.apply(v));

        Ok(output.into_shape_with_order((height, width, out_channels))?)
    }
}

struct DoubleConv {
    first: Conv2d,
    second: Conv2d,
}

impl DoubleConv {
    fn new(rng: &mut StdRng, in_channels: usize, out_channels: usize) -> Self {
        Self {
            first: Conv2d::new(rng, 3, in_channels, out_channels, Activation::Relu),
            second: Conv2d::new(rng, 3, out_channels, out_channels, Activation::Relu),
        }
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        self.second.forward(&self.first.forward(input)?)
    }

    fn param_count(&self) -> u64 {
        self.first.param_count() + self.second.param_count()
    }
}

fn max_pool_2x2(input: &Array3<f32>) -> Result<Array3<f32>> {
    let (height, width, channels) = input.dim();
    let blocks = input.to_shape((height / 2, 2, width / 2, 2, channels))?;
    let pooled = blocks
        .map_axis(Axis(3), |v| v.fold(f32::NEG_INFINITY, |a, &b| a.max(b)))
        .map_axis(Axis(1), |v| v.fold(f32::NEG_INFINITY, |a, &b| a.max(b)));
    Ok(pooled)
}

fn upsample_2x(input: &Array3<f32>) -> Array3<f32> {
    let (height, width, channels) = input.dim();
    Array3::from_shape_fn((height * 2, width * 2, channels), |(y, x, c)| {
        input[[y / 2, x / 2, c]]
    })
}

fn concat_channels(upsampled: &Array3<f32>, skip: &Array3<f32>) -> Result<Array3<f32>> {
    Ok(concatenate(Axis(2), &[upsampled.view(), skip.view()])?)
}

/// Encoder/decoder with skip connections: two down stages, a bottleneck and
/// two up stages, then a 1x1 sigmoid head.
pub struct SyntheticUNet {
    input_size: (u32, u32),
    encoder: [DoubleConv; 2],
    bottleneck: DoubleConv,
    decoder: [DoubleConv; 2],
    head: Conv2d,
}

impl SyntheticUNet {
    pub fn new(input_size: (u32, u32), base_channels: usize, seed: u64) -> Result<Self> {
        let (height, width) = input_size;
        if height == 0 || width == 0 || height % SPATIAL_DIVISOR != 0 || width % SPATIAL_DIVISOR != 0 {
            return Err(VesselSegError::model_load(
                "synthetic",
                format!(
                    "input size {}x{} must be non-zero multiples of {}",
                    height, width, SPATIAL_DIVISOR
                ),
            ));
        }
        if base_channels == 0 {
            return Err(VesselSegError::model_load(
                "synthetic",
                "base channel count must be positive",
            ));
        }

        let (c1, c2, c3) = (base_channels, base_channels * 2, base_channels * 4);
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            input_size,
            encoder: [
                DoubleConv::new(&mut rng, 3, c1),
                DoubleConv::new(&mut rng, c1, c2),
            ],
            bottleneck: DoubleConv::new(&mut rng, c2, c3),
            decoder: [
                DoubleConv::new(&mut rng, c3 + c2, c2),
                DoubleConv::new(&mut rng, c2 + c1, c1),
            ],
            head: Conv2d::new(&mut rng, 1, c1, 1, Activation::Sigmoid),
        })
    }

    fn forward(&self, image: &Array3<f32>) -> Result<Array3<f32>> {
        let [down1, down2] = &self.encoder;
        let [up2, up1] = &self.decoder;

        let skip1 = down1.forward(image)?;
        let skip2 = down2.forward(&max_pool_2x2(&skip1)?)?;
        let bottom = self.bottleneck.forward(&max_pool_2x2(&skip2)?)?;

        let x = up2.forward(&concat_channels(&upsample_2x(&bottom), &skip2)?)?;
        let x = up1.forward(&concat_channels(&upsample_2x(&x), &skip1)?)?;
        self.head.forward(&x)
    }
}

impl SegmentationModel for SyntheticUNet {
    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (height, width) = self.input_size;
        let expected = [1, height as usize, width as usize, 3];
        if batch.shape() != expected {
            return Err(VesselSegError::inference(
                "input shape check",
                format!("expected batch {:?}, got {:?}", expected, batch.shape()),
            ));
        }

        let image = batch.index_axis(Axis(0), 0).to_owned();
        let probabilities = self.forward(&image)?;
        Ok(probabilities.index_axis_move(Axis(2), 0))
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn param_count(&self) -> Option<u64> {
        let encoder: u64 = self.encoder.iter().map(DoubleConv::param_count).sum();
        let decoder: u64 = self.decoder.iter().map(DoubleConv::param_count).sum();
        Some(encoder + self.bottleneck.param_count() + decoder + self.head.param_count())
    }

    fn model_type(&self) -> &'static str {
        "U-Net (synthetic)"
    }

    fn load_source(&self) -> LoadSource {
        LoadSource::Dummy
    }
}
