use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Message shown whenever a generation call arrives without a usable model.
pub const NO_MODEL_MSG: &str = "Please choose a base model with --base_model (CLI) or load one from the Models tab.\nThen start a new conversation";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error for {parameter}: {message}")]
    ConfigurationError {
        message: String,
        parameter: String,
    },

    #[error("Generation failed: {0}")]
    Generation(#[from] RuntimeFault),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Model {model} does not support {capability}")]
    Capability {
        model: String,
        capability: &'static str,
    },

    #[error("Retrieval collaborator failed: {0:#}")]
    Retrieval(anyhow::Error),

    #[error("Generation worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Device error: {message}")]
    DeviceError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ConfigurationError {
            message: message.into(),
            parameter: parameter.into(),
        }
    }

    pub(crate) fn no_model() -> Self {
        Self::config("base_model", NO_MODEL_MSG)
    }
}

/// Failures raised by the numeric runtime underneath a generation call.
///
/// The variants are closed so that the exception bridge can match them
/// exhaustively. Engines that only surface error text go through
/// [`RuntimeFault::from_message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("Expected all tensors to be on the same device: {0}")]
    DeviceMismatch(String),

    #[error("expected scalar type Half but found Float: {0}")]
    DtypeMismatch(String),

    #[error("probability tensor contains either inf, nan or element < 0: {0}")]
    InvalidProbabilities(String),

    #[error("cublasLt ran into an error!: {0}")]
    KernelLibrary(String),

    #[error("mat1 and mat2 shapes cannot be multiplied: {0}")]
    ShapeMismatch(String),

    #[error("{0}")]
    Other(String),
}

/// How the exception bridge treats a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Accelerator exhaustion; the stream just ends.
    Recoverable,
    /// Known device or numerical failure; raised unless policy suppresses it.
    Transient,
    Unclassified,
}

const OOM_MARKERS: &[&str] = &["out of memory", "CUDA_ERROR_OUT_OF_MEMORY"];

// Order matters: the first matching marker wins.
const TRANSIENT_MARKERS: &[(&str, fn(String) -> RuntimeFault)] = &[
    ("Expected all tensors to be on the same device", RuntimeFault::DeviceMismatch),
    ("expected scalar type Half but found Float", RuntimeFault::DtypeMismatch),
    ("probability tensor contains either", RuntimeFault::InvalidProbabilities),
    ("cublasLt ran into an error!", RuntimeFault::KernelLibrary),
    ("mat1 and mat2 shapes cannot be multiplied", RuntimeFault::ShapeMismatch),
];

impl RuntimeFault {
    /// Classify raw error text from an engine that has no typed errors.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if OOM_MARKERS.iter().any(|m| message.contains(m)) {
            return RuntimeFault::OutOfMemory(message);
        }
        for (marker, build) in TRANSIENT_MARKERS {
            if message.contains(marker) {
                return build(message);
            }
        }
        RuntimeFault::Other(message)
    }

    pub fn class(&self) -> FaultClass {
        match self {
            RuntimeFault::OutOfMemory(_) => FaultClass::Recoverable,
            RuntimeFault::DeviceMismatch(_)
            | RuntimeFault::DtypeMismatch(_)
            | RuntimeFault::InvalidProbabilities(_)
            | RuntimeFault::KernelLibrary(_)
            | RuntimeFault::ShapeMismatch(_) => FaultClass::Transient,
            RuntimeFault::Other(_) => FaultClass::Unclassified,
        }
    }
}

impl From<candle_core::Error> for RuntimeFault {
    fn from(err: candle_core::Error) -> Self {
        RuntimeFault::from_message(err.to_string())
    }
}

/// Extension trait for error handling utilities
pub(crate) trait ErrorExt {
    fn is_recoverable(&self) -> bool;
}

impl ErrorExt for EngineError {
    fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Generation(fault) => fault.class() == FaultClass::Recoverable,
            _ => false,
        }
    }
}
