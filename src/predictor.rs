//! Request-scoped prediction pipeline and the diagnostics built on it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;
use nshare::AsNdarray2;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::{
    codec,
    errors::Result,
    geometry,
    lifecycle::ModelManager,
    metrics::{compute_metrics, confidence_score, VesselMetrics},
    postprocess::MaskPostprocessor,
    traits::{LoadSource, SegmentationModel},
};

const SUCCESS_MESSAGE: &str = "Segmentation completed successfully";
const SELF_TEST_SIZE: u32 = 100;

/// What a caller can hand to the pipeline.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Base64, optionally behind a `data:<mime>;base64,` header.
    Encoded(String),
    /// Raw container bytes (PNG, JPEG, ...).
    Bytes(Vec<u8>),
    Pixels(RgbImage),
}

impl ImageInput {
    fn into_pixels(self) -> Result<RgbImage> {
        match self {
            Self::Encoded(encoded) => codec::decode(&encoded),
            Self::Bytes(bytes) => codec::decode_bytes(&bytes),
            Self::Pixels(image) => Ok(image),
        }
    }
}

impl From<String> for ImageInput {
    fn from(encoded: String) -> Self {
        Self::Encoded(encoded)
    }
}

impl From<&str> for ImageInput {
    fn from(encoded: &str) -> Self {
        Self::Encoded(encoded.to_string())
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<RgbImage> for ImageInput {
    fn from(image: RgbImage) -> Self {
        Self::Pixels(image)
    }
}

/// Typed output of one successful pipeline run.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Cleaned mask at the original resolution, values 0 or 255.
    pub mask: GrayImage,
    /// Raw model output at the model resolution.
    pub probabilities: Array2<f32>,
    pub confidence: f64,
    pub metrics: VesselMetrics,
}

/// Uniform result handed back across the pipeline boundary.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub success: bool,
    #[serde(rename = "segmentation_mask")]
    pub mask: Option<String>,
    pub confidence_score: Option<f64>,
    pub processing_time: Option<f64>,
    #[serde(rename = "vessel_metrics")]
    pub metrics: Option<VesselMetrics>,
    pub message: String,
}

impl PredictionResult {
    /// Successful result for an already segmented image. `mask` is the
    /// encoded mask, or `None` when the caller stores it elsewhere.
    pub fn from_segmentation(
        segmentation: &Segmentation,
        mask: Option<String>,
        processing_time: f64,
    ) -> Self {
        Self {
            success: true,
            mask,
            confidence_score: Some(segmentation.confidence),
            processing_time: Some(processing_time),
            metrics: Some(segmentation.metrics.with_processing_time(processing_time)),
            message: SUCCESS_MESSAGE.to_string(),
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            mask: None,
            confidence_score: None,
            processing_time: None,
            metrics: None,
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTest {
    pub passed: bool,
    pub latency_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub model_loaded: bool,
    pub load_source: Option<LoadSource>,
    pub model_path_exists: bool,
    pub runtime_version: &'static str,
    pub self_test: Option<SelfTest>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub loaded: bool,
    pub load_source: Option<LoadSource>,
    pub model_path: PathBuf,
    pub input_size: (u32, u32),
    pub output_size: Option<(u32, u32)>,
    pub param_count: Option<u64>,
    pub trainable_param_count: Option<u64>,
    pub model_type: Option<&'static str>,
}

/// Runs decode → resize/normalize → infer → threshold/resize-back → cleanup
/// → measure for one image at a time.
pub struct Predictor {
    manager: Arc<ModelManager>,
    postprocessor: MaskPostprocessor,
}

impl Predictor {
    pub fn new(manager: Arc<ModelManager>) -> Self {
        let postprocessor = MaskPostprocessor::from_config(manager.config());
        Self {
            manager,
            postprocessor,
        }
    }

    /// Panics when called before the manager committed a model; that is a
    /// caller bug, not a request failure.
    fn loaded_model(&self) -> Arc<dyn SegmentationModel> {
        match self.manager.model() {
            Some(model) => model,
            None => panic!(
                "prediction requested while the model manager is {:?}",
                self.manager.state()
            ),
        }
    }

    /// Full pipeline with typed errors, for in-process callers.
    pub fn segment(&self, input: impl Into<ImageInput>) -> Result<Segmentation> {
        let model = self.loaded_model();
        self.run(model.as_ref(), input.into(), Instant::now())
    }

    /// Full pipeline behind the error boundary: never returns an error, only
    /// a failed result carrying the cause.
    pub fn predict(&self, input: impl Into<ImageInput>) -> PredictionResult {
        let model = self.loaded_model();
        let start = Instant::now();

        let outcome = self.run(model.as_ref(), input.into(), start).and_then(|segmentation| {
            let mask = codec::encode(segmentation.mask.as_ndarray2().into_dyn(), "png")?;
            Ok((segmentation, mask))
        });

        match outcome {
            Ok((segmentation, mask)) => {
                let processing_time = start.elapsed().as_secs_f64();
                info!(
                    processing_time,
                    vessel_percentage = segmentation.metrics.vessel_percentage,
                    regions = segmentation.metrics.region_count,
                    "segmentation completed"
                );
                PredictionResult::from_segmentation(&segmentation, Some(mask), processing_time)
            }
            Err(e) => {
                let cause = e.chain_message();
                error!(error = %cause, "prediction failed");
                PredictionResult::failure(format!("Prediction failed: {}", cause))
            }
        }
    }

    fn run(
        &self,
        model: &dyn SegmentationModel,
        input: ImageInput,
        start: Instant,
    ) -> Result<Segmentation> {
        let image = input.into_pixels()?;
        let original = (image.height(), image.width());
        debug!(height = original.0, width = original.1, "processing image");

        let batch = geometry::to_model_input(&image, model.input_size())?;
        let probabilities = model.infer(batch.view())?;
        let confidence = confidence_score(probabilities.view().into_dyn());
        debug!(confidence, "inference finished");

        let mask = self
            .postprocessor
            .process(probabilities.view().into_dyn(), original)?;
        let metrics = compute_metrics(&mask).with_processing_time(start.elapsed().as_secs_f64());

        Ok(Segmentation {
            mask,
            probabilities,
            confidence,
            metrics,
        })
    }

    /// Load state plus a live end-to-end request on a small black image.
    pub fn health_check(&self) -> HealthStatus {
        let model_loaded = self.manager.is_loaded();
        let self_test = model_loaded.then(|| self.self_test());
        let passed = self_test.as_ref().is_some_and(|t| t.passed);

        HealthStatus {
            status: if model_loaded && passed {
                "healthy"
            } else {
                "unhealthy"
            },
            model_loaded,
            load_source: self.manager.load_source(),
            model_path_exists: self.manager.model_path_exists(),
            runtime_version: env!("CARGO_PKG_VERSION"),
            self_test,
        }
    }

    fn self_test(&self) -> SelfTest {
        let probe = RgbImage::new(SELF_TEST_SIZE, SELF_TEST_SIZE);
        let start = Instant::now();
        let encoded = match codec::encode_image(&DynamicImage::ImageRgb8(probe), "png") {
            Ok(encoded) => encoded,
            Err(e) => {
                return SelfTest {
                    passed: false,
                    latency_secs: start.elapsed().as_secs_f64(),
                    error: Some(e.chain_message()),
                }
            }
        };

        let result = self.predict(encoded);
        SelfTest {
            passed: result.success,
            latency_secs: start.elapsed().as_secs_f64(),
            error: (!result.success).then_some(result.message),
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        let config = self.manager.config();
        let model = self.manager.model();
        ModelInfo {
            loaded: self.manager.is_loaded(),
            load_source: self.manager.load_source(),
            model_path: config.model_path.clone(),
            input_size: model
                .as_ref()
                .map_or(config.input_size(), |m| m.input_size()),
            output_size: model.as_ref().and_then(|m| m.output_size()),
            param_count: model.as_ref().and_then(|m| m.param_count()),
            trainable_param_count: model.as_ref().and_then(|m| m.trainable_param_count()),
            model_type: model.as_ref().map(|m| m.model_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{LoadStrategy, ModelManager};
    use crate::mocks::{MockOutput, MockSegmentationModel};

    struct MockStrategy(MockOutput);

    impl LoadStrategy for MockStrategy {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>> {
            Ok(Box::new(
                MockSegmentationModel::new(config.input_size()).with_output(self.0),
            ))
        }
    }

    fn predictor_with(output: MockOutput) -> Predictor {
        let config = Config::default().with_input_size(32, 32);
        let manager = ModelManager::with_strategies(config, vec![Box::new(MockStrategy(output))]);
        manager.load().unwrap();
        Predictor::new(Arc::new(manager))
    }

    #[test]
    fn black_image_has_no_vessels() {
        let predictor = predictor_with(MockOutput::Constant(0.0));
        let result = predictor.predict(RgbImage::new(100, 100));

        assert!(result.success);
        assert_eq!(result.message, SUCCESS_MESSAGE);
        let metrics = result.metrics.unwrap();
        assert_eq!(metrics.vessel_pixels, 0);
        assert_eq!(metrics.region_count, 0);
        assert_eq!(metrics.average_region_size, 0.0);
        assert_eq!(result.confidence_score, Some(0.0));
        assert!(result.mask.unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn mask_comes_back_at_original_resolution() -> Result<()> {
        let predictor = predictor_with(MockOutput::Stripes { width: 4, gap: 4 });
        let segmentation = predictor.segment(RgbImage::new(70, 45))?;
        assert_eq!(segmentation.mask.dimensions(), (70, 45));
        assert_eq!(segmentation.probabilities.dim(), (32, 32));
        assert!(segmentation.metrics.region_count > 1);
        assert!((segmentation.confidence - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn bright_image_is_all_vessel() -> Result<()> {
        let predictor = predictor_with(MockOutput::Brightness);
        let bright = predictor.segment(RgbImage::from_pixel(20, 10, image::Rgb([255, 255, 255])))?;
        assert_eq!(bright.metrics.vessel_pixels, 200);
        assert_eq!(bright.metrics.region_count, 1);
        assert_eq!(bright.metrics.vessel_percentage, 100.0);

        let dark = predictor.segment(RgbImage::new(20, 10))?;
        assert_eq!(dark.metrics.vessel_pixels, 0);
        Ok(())
    }

    #[test]
    fn encoded_mask_decodes_to_original_size() -> Result<()> {
        let predictor = predictor_with(MockOutput::Stripes { width: 4, gap: 4 });
        let result = predictor.predict(RgbImage::new(64, 48));
        let mask = codec::decode(&result.mask.unwrap())?;
        assert_eq!(mask.dimensions(), (64, 48));
        Ok(())
    }

    #[test]
    fn garbage_input_is_a_failed_result() {
        let predictor = predictor_with(MockOutput::Constant(0.0));
        let result = predictor.predict(b"definitely not an image".to_vec());

        assert!(!result.success);
        assert!(result.message.starts_with("Prediction failed: Decode error"));
        assert!(result.mask.is_none());
        assert!(result.confidence_score.is_none());
        assert!(result.processing_time.is_none());
        assert!(result.metrics.is_none());
    }

    #[test]
    fn inference_failure_is_a_failed_result() {
        let predictor = predictor_with(MockOutput::Fail);
        let result = predictor.predict(RgbImage::new(8, 8));
        assert!(!result.success);
        assert!(result.message.contains("Inference error"));
    }

    #[test]
    fn health_reports_live_self_test() {
        let predictor = predictor_with(MockOutput::Constant(0.2));
        let health = predictor.health_check();
        assert!(health.is_healthy());
        assert!(health.model_loaded);
        assert_eq!(health.load_source, Some(LoadSource::Trained));
        let self_test = health.self_test.unwrap();
        assert!(self_test.passed);
        assert!(self_test.error.is_none());
    }

    #[test]
    fn failing_model_is_unhealthy() {
        let predictor = predictor_with(MockOutput::Fail);
        let health = predictor.health_check();
        assert!(!health.is_healthy());
        assert!(health.model_loaded);
        assert!(health.self_test.unwrap().error.is_some());
    }

    #[test]
    #[should_panic(expected = "prediction requested while the model manager is Unloaded")]
    fn predicting_before_load_panics() {
        let manager = ModelManager::new(Config::default());
        let predictor = Predictor::new(Arc::new(manager));
        predictor.predict(RgbImage::new(4, 4));
    }

    #[test]
    fn result_serializes_with_wire_names() {
        let predictor = predictor_with(MockOutput::Constant(0.0));
        let json = serde_json::to_value(predictor.predict(RgbImage::new(8, 8))).unwrap();
        assert_eq!(json["success"], true);
        assert!(json["segmentation_mask"].is_string());
        assert_eq!(json["vessel_metrics"]["vessel_pixels"], 0);
    }
}
