//! Error types for model loading and inference.

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, EncodecError>;

/// Everything that can go wrong between opening a weight file and returning
/// reconstructed samples.
///
/// None of these are retried internally. A failed call never hands back a
/// partially reconstructed waveform.
#[derive(Debug, Error)]
pub enum EncodecError {
    /// The weight file is missing, truncated, has the wrong magic or its
    /// tensors disagree with the hyperparameters it declares.
    #[error("failed to load model from {path}: {message}")]
    ModelLoad {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The caller's input cannot be fed through the pipeline.
    #[error("invalid input shape: {0}")]
    InputShape(String),

    /// A weight or intermediate tensor disagrees with the graph plan.
    #[error("graph shape mismatch at {node}: expected {expected:?}, got {actual:?}")]
    InternalGraph {
        node: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Requested number of quantizer stages is not usable with this model.
    #[error("unsupported quantizer stage count {requested} (supported: {supported:?})")]
    UnsupportedStageCount {
        requested: usize,
        supported: Vec<usize>,
    },

    /// The execution context was already freed.
    #[error("execution context has been released")]
    ContextReleased,

    /// Device string not recognised or backend not compiled in.
    #[error("device error: {0}")]
    Device(String),

    /// Worker pool could not be created.
    #[error("failed to build worker pool with {threads} threads: {message}")]
    ThreadPool { threads: usize, message: String },

    /// A WAV file could not be read or written.
    #[error("audio file {path}: {source}")]
    Audio {
        path: String,
        #[source]
        source: hound::Error,
    },

    /// Tensor backend failure while executing the graph.
    #[error("tensor backend error: {0}")]
    Compute(#[from] candle_core::Error),
}

impl EncodecError {
    /// Create a load error without an underlying I/O cause.
    pub fn load(path: impl Into<String>, message: impl Into<String>) -> Self {
        EncodecError::ModelLoad {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a load error wrapping an I/O failure.
    pub fn load_io(path: impl Into<String>, message: impl Into<String>, err: std::io::Error) -> Self {
        EncodecError::ModelLoad {
            path: path.into(),
            message: message.into(),
            source: Some(err),
        }
    }

    /// Create a graph mismatch error for `node`.
    pub fn graph(node: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        EncodecError::InternalGraph {
            node: node.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Whether the failure came from the caller's input rather than the model.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            EncodecError::InputShape(_) | EncodecError::UnsupportedStageCount { .. }
        )
    }
}
