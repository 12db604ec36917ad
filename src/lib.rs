pub mod codec;
pub mod config;
pub mod errors;
pub mod geometry;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod overlay;
pub mod postprocess;
pub mod predictor;
pub mod synthetic;
pub mod traits;

pub mod mocks;

use image::{DynamicImage, ImageFormat};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub use config::Config;
pub use errors::{Result, VesselSegError};
pub use lifecycle::{LoadState, ModelManager};
pub use metrics::VesselMetrics;
pub use predictor::{HealthStatus, ImageInput, ModelInfo, PredictionResult, Predictor};
pub use traits::*;

/// Sidecar written next to every batch mask.
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub source: PathBuf,
    pub confidence_score: f64,
    pub vessel_metrics: VesselMetrics,
}

/// Outcome counts of one directory run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Runs the pipeline over every image under a directory tree, mirroring the
/// tree into the output directory.
pub struct ImageProcessor<'a> {
    predictor: &'a Predictor,
    input_dir: PathBuf,
    output_dir: PathBuf,
    format: String,
    overlays: bool,
}

impl<'a> ImageProcessor<'a> {
    pub fn new(
        predictor: &'a Predictor,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        format: impl Into<String>,
    ) -> Self {
        Self {
            predictor,
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            format: format.into(),
            overlays: false,
        }
    }

    /// Also write `<stem>_overlay.<format>` for every image.
    pub const fn with_overlays(mut self, overlays: bool) -> Self {
        self.overlays = overlays;
        self
    }

    /// Images that fail to segment are logged and counted; filesystem
    /// failures on the output side abort the run.
    pub fn process_directory(&self, show_progress: bool) -> Result<BatchSummary> {
        if !self.input_dir.is_dir() {
            return Err(VesselSegError::FileSystem {
                path: self.input_dir.clone(),
                operation: "input directory check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }
        fs::create_dir_all(&self.output_dir).map_err(|e| VesselSegError::FileSystem {
            path: self.output_dir.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files();
        if image_files.is_empty() {
            warn!(input_dir = %self.input_dir.display(), "no images found");
            return Ok(BatchSummary::default());
        }

        let progress_bar = if show_progress {
            ProgressBar::new(image_files.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        progress_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
            )
            .map_err(|e| VesselSegError::Configuration {
                message: format!("progress template: {}", e),
            })?
            .progress_chars("#>-"),
        );

        let outcomes = image_files
            .par_iter()
            .progress_with(progress_bar.clone())
            .map(|input_file| self.process_single_image(input_file))
            .collect::<Result<Vec<bool>>>()?;
        progress_bar.finish();

        let processed = outcomes.iter().filter(|&&ok| ok).count();
        let summary = BatchSummary {
            processed,
            failed: outcomes.len() - processed,
        };
        info!(
            processed = summary.processed,
            failed = summary.failed,
            "batch finished"
        );
        Ok(summary)
    }

    fn collect_image_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.input_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
            .map(|e| e.into_path())
            .collect()
    }

    /// `Ok(false)` when the image itself could not be segmented.
    fn process_single_image(&self, input_file: &Path) -> Result<bool> {
        let image = match image::open(input_file) {
            Ok(image) => image.into_rgb8(),
            Err(e) => {
                warn!(path = %input_file.display(), error = %e, "skipping unreadable image");
                return Ok(false);
            }
        };

        let segmentation = match self.predictor.segment(image.clone()) {
            Ok(segmentation) => segmentation,
            Err(e) => {
                warn!(path = %input_file.display(), error = %e.chain_message(), "segmentation failed");
                return Ok(false);
            }
        };

        if self.overlays {
            let overlay_path = self.output_path(input_file, "overlay", &self.format)?;
            let overlay = overlay::render(&image, &segmentation.mask, overlay::DEFAULT_ALPHA)?;
            save_image(DynamicImage::ImageRgb8(overlay), &overlay_path, &self.format)?;
        }

        let mask_path = self.output_path(input_file, "mask", &self.format)?;
        save_image(DynamicImage::ImageLuma8(segmentation.mask), &mask_path, &self.format)?;

        let report = ImageReport {
            source: input_file.to_path_buf(),
            confidence_score: segmentation.confidence,
            vessel_metrics: segmentation.metrics,
        };
        let report_path = self.output_path(input_file, "metrics", "json")?;
        let json = serde_json::to_string_pretty(&report).map_err(|e| {
            VesselSegError::encode("metrics serialization", e)
        })?;
        fs::write(&report_path, json).map_err(|e| VesselSegError::FileSystem {
            path: report_path,
            operation: "metrics write".to_string(),
            source: e,
        })?;

        Ok(true)
    }

    /// `<output_dir>/<relative parent>/<stem>_<suffix>.<extension>`, creating
    /// the parent directory.
    pub fn output_path(&self, input_file: &Path, suffix: &str, extension: &str) -> Result<PathBuf> {
        let relative = self.get_relative_path(input_file)?;
        let stem = relative
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self
            .output_dir
            .join(&relative)
            .with_file_name(format!("{}_{}.{}", stem, suffix, extension));

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| VesselSegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }
        Ok(target)
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        input_file
            .strip_prefix(&self.input_dir)
            .map(Path::to_path_buf)
            .map_err(|_| VesselSegError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path resolution".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is not inside the input directory",
                ),
            })
    }
}

pub fn is_supported_image_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff" | "tif"
            )
        })
}

fn save_image(image: DynamicImage, path: &Path, format: &str) -> Result<()> {
    let format = ImageFormat::from_extension(format).unwrap_or(ImageFormat::Png);
    image
        .save_with_format(path, format)
        .map_err(|e| VesselSegError::encode(format!("image save to {}", path.display()), e))
}
