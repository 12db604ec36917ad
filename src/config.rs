use clap::Args;
use image::ImageFormat;
use std::path::PathBuf;

use crate::errors::{Result, VesselSegError};

pub const DEFAULT_MODEL_PATH: &str = "models/unet_eye_segmentation.onnx";

/// Serving resolution of the exported model. Training ran at 512x512 but the
/// artifact is served at 256x256; a model that declares a fixed input size
/// overrides this at load time.
pub const DEFAULT_INPUT_SIZE: u32 = 256;

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_KERNEL_SIZE: u32 = 3;
pub const MAX_KERNEL_SIZE: u32 = 255;

#[derive(Args, Clone, Debug)]
pub struct Config {
    /// Trained ONNX artifact; a synthetic model is used when it is missing or unloadable
    #[arg(short, long, default_value = DEFAULT_MODEL_PATH)]
    pub model_path: PathBuf,

    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    pub input_height: u32,

    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    pub input_width: u32,

    /// Probability above which a pixel counts as vessel
    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD, value_parser = check_threshold)]
    pub threshold: f32,

    /// Side of the elliptical structuring element used for mask cleanup
    #[arg(short, long, default_value_t = DEFAULT_KERNEL_SIZE, value_parser = check_kernel_size)]
    pub kernel_size: u32,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Seed for the synthetic fallback model weights
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            input_height: DEFAULT_INPUT_SIZE,
            input_width: DEFAULT_INPUT_SIZE,
            threshold: DEFAULT_THRESHOLD,
            kernel_size: DEFAULT_KERNEL_SIZE,
            device_id: 0,
            seed: 42,
        }
    }
}

impl Config {
    pub fn with_model_path(mut self, model_path: impl Into<PathBuf>) -> Self {
        self.model_path = model_path.into();
        self
    }

    pub const fn with_input_size(mut self, height: u32, width: u32) -> Self {
        self.input_height = height;
        self.input_width = width;
        self
    }

    /// (height, width) the image is resized to before inference.
    pub const fn input_size(&self) -> (u32, u32) {
        (self.input_height, self.input_width)
    }

    /// Range checks for values constructed without going through clap.
    pub fn validate(&self) -> Result<()> {
        if self.input_height == 0 || self.input_width == 0 {
            return Err(VesselSegError::Configuration {
                message: format!(
                    "input size must be non-zero, got {}x{}",
                    self.input_height, self.input_width
                ),
            });
        }
        check_threshold(&self.threshold.to_string())
            .map_err(|message| VesselSegError::Configuration { message })?;
        check_kernel_size(&self.kernel_size.to_string())
            .map_err(|message| VesselSegError::Configuration { message })?;
        Ok(())
    }
}

fn check_threshold(s: &str) -> std::result::Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("{} is not a number", s))?;
    if !(value > 0.0 && value < 1.0) {
        return Err(format!("threshold must be within (0, 1), got {}", value));
    }
    Ok(value)
}

fn check_kernel_size(s: &str) -> std::result::Result<u32, String> {
    let value: u32 = s
        .parse()
        .map_err(|_| format!("{} is not a positive integer", s))?;
    if value == 0 || value % 2 == 0 {
        return Err(format!("kernel size must be odd and positive, got {}", value));
    }
    if value > MAX_KERNEL_SIZE {
        return Err(format!(
            "kernel size must be at most {}, got {}",
            MAX_KERNEL_SIZE, value
        ));
    }
    Ok(value)
}

/// Accepts any extension the `image` crate can write.
pub fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
