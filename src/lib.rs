//! llm-exec - generation-execution layer for local language model serving
//!
//! This crate turns a loaded model and a request into a sequence of response
//! snapshots: it budgets the context window, places the model on devices,
//! streams decoded fragments from a generation worker, and classifies the
//! runtime faults that can interrupt a call.

use std::fmt;

// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod model;
pub mod processing;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::EngineConfig;
pub use engine::{score_qa, EngineBuilder, Evaluation, Generator, ResponseScore};
pub use error::{EngineError, Result, RuntimeFault};
pub use gpu::{resolve_placement, AcceleratorPool, HardwareInfo, PlacementPlan};
pub use model::ModelHandle;
pub use types::{GenerationRequest, ResponseSnapshot};

/// Feature detection for supported backends
pub struct Features {
    /// Whether the crate was built with CUDA support
    pub cuda: bool,
    /// Detected hardware
    pub hardware: HardwareInfo,
}

impl Features {
    /// Detect available features at runtime
    pub fn detect() -> Self {
        Self {
            cuda: cfg!(feature = "cuda"),
            hardware: HardwareInfo::detect(),
        }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        writeln!(f, "Hardware: {}", self.hardware)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_detection() {
        let features = Features::detect();
        println!("Detected features:\n{}", features);
        if !features.cuda {
            assert!(!features.hardware.has_gpu());
        }
    }

    #[test]
    fn test_version_numbers() {
        assert!(!VERSION.is_empty());
    }
}
