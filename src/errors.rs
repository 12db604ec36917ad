use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the vessel segmentation pipeline.
///
/// One variant per pipeline stage, so the orchestrator can report which stage
/// failed without parsing strings. `ModelLoad` only ever appears inside the
/// lifecycle manager's fallback chain; request callers never see it.
#[derive(Error, Debug)]
pub enum VesselSegError {
    #[error("Decode error: {operation} failed")]
    Decode {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Preprocess error: {reason}")]
    Preprocess { reason: String },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Postprocess error: {reason}")]
    Postprocess { reason: String },

    #[error("Encode error: {operation} failed")]
    Encode {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model load error: {strategy} strategy failed: {reason}")]
    ModelLoad { strategy: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, VesselSegError>;

impl VesselSegError {
    pub(crate) fn decode<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxedSource>,
    {
        Self::Decode {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn encode<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxedSource>,
    {
        Self::Encode {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn inference<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxedSource>,
    {
        Self::Inference {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn model_load(strategy: &str, reason: impl ToString) -> Self {
        Self::ModelLoad {
            strategy: strategy.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Message including the whole source chain, for the user-facing result.
    pub fn chain_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            message.push_str(": ");
            message.push_str(&err.to_string());
            source = std::error::Error::source(err);
        }
        message
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Only the CLI layer produces anyhow errors, and those are always about bad
/// arguments or paths, so they land in the configuration bucket.
impl From<anyhow::Error> for VesselSegError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build `FileSystem` directly.
impl From<std::io::Error> for VesselSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Image crate errors surface while reading the request image.
impl From<image::ImageError> for VesselSegError {
    fn from(err: image::ImageError) -> Self {
        Self::decode("image container decoding", err)
    }
}

impl From<base64::DecodeError> for VesselSegError {
    fn from(err: base64::DecodeError) -> Self {
        Self::decode("base64 decoding", err)
    }
}

/// Convert ONNX Runtime errors to inference errors.
impl From<ort::Error> for VesselSegError {
    fn from(err: ort::Error) -> Self {
        Self::inference("ort operation", err)
    }
}

/// Shape errors only occur while moving tensors in and out of the model, so
/// they are categorized as inference errors rather than a separate tensor type.
impl From<ndarray::ShapeError> for VesselSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", err)
    }
}
