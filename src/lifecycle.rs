//! Ownership and one-time loading of the process-wide segmentation model.
//!
//! Loading walks an ordered list of strategies and commits to the first one
//! that produces a model. Once committed the model is never replaced, so
//! request threads read it without any write lock.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    config::Config,
    errors::{Result, VesselSegError},
    model::{OnnxModel, SessionProfile},
    synthetic::{SyntheticUNet, DEFAULT_BASE_CHANNELS},
    traits::{LoadSource, SegmentationModel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded(LoadSource),
    /// Every strategy failed; the process is unhealthy.
    Failed,
}

/// One way of producing a model from the configuration.
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>>;
}

fn require_artifact(strategy: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(VesselSegError::model_load(
            strategy,
            format!("no model artifact at {}", path.display()),
        ))
    }
}

/// Accelerated session with full graph optimization.
pub struct StandardLoad;

impl LoadStrategy for StandardLoad {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>> {
        require_artifact(self.name(), &config.model_path)?;
        let profile = SessionProfile::Accelerated {
            device_id: config.device_id,
        };
        let model = OnnxModel::load(&config.model_path, profile, config.input_size())?;
        Ok(Box::new(model))
    }
}

/// CPU session with the graph optimizer switched off.
pub struct CompatibilityLoad;

impl LoadStrategy for CompatibilityLoad {
    fn name(&self) -> &'static str {
        "compatibility"
    }

    fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>> {
        require_artifact(self.name(), &config.model_path)?;
        let model = OnnxModel::load(
            &config.model_path,
            SessionProfile::Compatibility,
            config.input_size(),
        )?;
        Ok(Box::new(model))
    }
}

/// Rebuilding the architecture and pulling raw weights out of the artifact.
/// Not supported; always falls through to the next strategy.
pub struct WeightExtraction;

impl LoadStrategy for WeightExtraction {
    fn name(&self) -> &'static str {
        "weight extraction"
    }

    fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>> {
        require_artifact(self.name(), &config.model_path)?;
        Err(VesselSegError::model_load(
            self.name(),
            "loading raw weights into a rebuilt architecture is not supported",
        ))
    }
}

/// Untrained network so the service can still answer with valid output.
pub struct SyntheticFallback {
    pub base_channels: usize,
}

impl Default for SyntheticFallback {
    fn default() -> Self {
        Self {
            base_channels: DEFAULT_BASE_CHANNELS,
        }
    }
}

impl LoadStrategy for SyntheticFallback {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>> {
        let model = SyntheticUNet::new(config.input_size(), self.base_channels, config.seed)?;
        Ok(Box::new(model))
    }
}

pub fn default_strategies() -> Vec<Box<dyn LoadStrategy>> {
    vec![
        Box::new(StandardLoad),
        Box::new(CompatibilityLoad),
        Box::new(WeightExtraction),
        Box::new(SyntheticFallback::default()),
    ]
}

pub struct ModelManager {
    config: Config,
    strategies: Vec<Box<dyn LoadStrategy>>,
    state: RwLock<LoadState>,
    model: OnceLock<Arc<dyn SegmentationModel>>,
    load_guard: Mutex<()>,
}

impl ModelManager {
    pub fn new(config: Config) -> Self {
        Self::with_strategies(config, default_strategies())
    }

    pub fn with_strategies(config: Config, strategies: Vec<Box<dyn LoadStrategy>>) -> Self {
        Self {
            config,
            strategies,
            state: RwLock::new(LoadState::Unloaded),
            model: OnceLock::new(),
            load_guard: Mutex::new(()),
        }
    }

    /// Run the strategy chain once and commit the first model produced.
    ///
    /// Calling again after the chain has finished returns the committed
    /// outcome without reloading.
    pub fn load(&self) -> Result<LoadSource> {
        let _guard = self.load_guard.lock();
        match *self.state.read() {
            LoadState::Loaded(source) => return Ok(source),
            LoadState::Failed => {
                return Err(VesselSegError::model_load(
                    "all",
                    "an earlier load attempt exhausted every strategy",
                ))
            }
            LoadState::Unloaded | LoadState::Loading => {}
        }
        *self.state.write() = LoadState::Loading;

        let mut failures = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match strategy.load(&self.config) {
                Ok(model) => {
                    let source = model.load_source();
                    let (height, width) = model.input_size();
                    let _ = self.model.set(Arc::from(model));
                    *self.state.write() = LoadState::Loaded(source);
                    info!(
                        strategy = strategy.name(),
                        %source,
                        input_size = %format!("{}x{}", height, width),
                        "model loaded"
                    );
                    return Ok(source);
                }
                Err(e) => {
                    warn!(
                        strategy = strategy.name(),
                        error = %e,
                        "model load strategy failed, trying next"
                    );
                    failures.push(e.to_string());
                }
            }
        }

        *self.state.write() = LoadState::Failed;
        tracing::error!("every model load strategy failed");
        Err(VesselSegError::model_load("all", failures.join("; ")))
    }

    pub fn state(&self) -> LoadState {
        *self.state.read()
    }

    /// Dummy models count as loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), LoadState::Loaded(_))
    }

    pub fn load_source(&self) -> Option<LoadSource> {
        match self.state() {
            LoadState::Loaded(source) => Some(source),
            _ => None,
        }
    }

    pub fn model(&self) -> Option<Arc<dyn SegmentationModel>> {
        self.model.get().cloned()
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn model_path_exists(&self) -> bool {
        self.config.model_path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockSegmentationModel;

    struct AlwaysFails;

    impl LoadStrategy for AlwaysFails {
        fn name(&self) -> &'static str {
            "always fails"
        }

        fn load(&self, _config: &Config) -> Result<Box<dyn SegmentationModel>> {
            Err(VesselSegError::model_load(self.name(), "nope"))
        }
    }

    struct Mock;

    impl LoadStrategy for Mock {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn load(&self, config: &Config) -> Result<Box<dyn SegmentationModel>> {
            Ok(Box::new(MockSegmentationModel::new(config.input_size())))
        }
    }

    fn missing_model_config() -> Config {
        Config::default()
            .with_model_path("definitely/missing/model.onnx")
            .with_input_size(16, 16)
    }

    #[test]
    fn starts_unloaded() {
        let manager = ModelManager::new(missing_model_config());
        assert_eq!(manager.state(), LoadState::Unloaded);
        assert!(!manager.is_loaded());
        assert!(manager.model().is_none());
    }

    #[test]
    fn missing_artifact_falls_back_to_dummy() -> Result<()> {
        let manager = ModelManager::new(missing_model_config());
        let source = manager.load()?;
        assert_eq!(source, LoadSource::Dummy);
        assert_eq!(manager.state(), LoadState::Loaded(LoadSource::Dummy));
        assert!(manager.is_loaded());
        assert!(!manager.model_path_exists());
        Ok(())
    }

    #[test]
    fn corrupt_artifact_falls_back_to_dummy() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"not an onnx graph")?;

        let manager = ModelManager::new(missing_model_config().with_model_path(&path));
        assert_eq!(manager.load()?, LoadSource::Dummy);
        assert!(manager.model_path_exists());
        Ok(())
    }

    #[test]
    fn commits_first_success_in_order() -> Result<()> {
        let manager = ModelManager::with_strategies(
            missing_model_config(),
            vec![Box::new(AlwaysFails), Box::new(Mock), Box::new(SyntheticFallback::default())],
        );
        assert_eq!(manager.load()?, LoadSource::Trained);
        Ok(())
    }

    #[test]
    fn second_load_is_a_no_op() -> Result<()> {
        let manager = ModelManager::new(missing_model_config());
        manager.load()?;
        let first = manager.model().map(|m| Arc::as_ptr(&m) as *const ());
        manager.load()?;
        let second = manager.model().map(|m| Arc::as_ptr(&m) as *const ());
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn exhausted_chain_is_failed_state() {
        let manager = ModelManager::with_strategies(
            missing_model_config(),
            vec![Box::new(AlwaysFails), Box::new(AlwaysFails)],
        );
        let err = manager.load().unwrap_err();
        assert!(matches!(err, VesselSegError::ModelLoad { .. }));
        assert_eq!(manager.state(), LoadState::Failed);
        assert!(!manager.is_loaded());
        assert!(manager.load().is_err());
    }

    #[test]
    fn synthetic_rejects_unpoolable_size() {
        let config = missing_model_config().with_input_size(10, 10);
        let manager = ModelManager::new(config);
        assert!(manager.load().is_err());
        assert_eq!(manager.state(), LoadState::Failed);
    }
}
