// Location: src/config.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{EngineError, Result};
use crate::types::{LengthControls, SamplingParams};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub gpu: GpuConfig,
    pub generation: GenerationDefaults,
    pub runtime: RuntimeConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name or path (e.g. "h2oai/h2ogpt-oig-oasst1-512-6_9b")
    pub base_model: String,

    /// Path to a `tokenizer.json`
    pub tokenizer_path: Option<PathBuf>,

    /// Overrides the maximum sequence length read from model metadata
    pub model_max_length: Option<usize>,

    /// Apply the long-context overrides for model families that have them
    pub long_sequence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Target GPU index, or -1 to let the loader use every visible GPU
    pub gpu_id: i32,

    pub load_8bit: bool,

    pub load_4bit: bool,

    /// Load weights in 16-bit precision
    pub load_half: bool,

    /// Infer a layer-to-device map before loading
    pub infer_devices: bool,

    pub compile_model: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            load_8bit: false,
            load_4bit: false,
            load_half: true,
            infer_devices: true,
            compile_model: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub prompt_type: String,
    pub stream_output: bool,
    pub sampling: SamplingParams,
    pub length: LengthControls,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            prompt_type: "plain".to_string(),
            stream_output: true,
            sampling: SamplingParams::default(),
            length: LengthControls::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 0 = unrestricted, 3 = most aggressive token-window caps
    pub memory_restriction_level: u8,

    /// Re-raise known GPU and unclassified faults instead of ending quietly
    pub raise_generate_gpu_exceptions: bool,

    /// Inject the hidden conversational context for styles that use one
    pub chat_context: bool,

    /// Directory for the append-only output history
    pub save_dir: Option<PathBuf>,

    pub sanitize_bot_response: bool,

    /// Concurrency cap enforced by the caller
    pub concurrency_count: usize,

    /// Hold the generation lock around each generation call
    pub serialize_generation: bool,

    /// Capacity of the fragment pipe
    pub pipe_capacity: usize,

    /// How long the consumer waits on the pipe between stop-flag checks
    pub poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_restriction_level: 0,
            raise_generate_gpu_exceptions: true,
            chat_context: false,
            save_dir: None,
            sanitize_bot_response: false,
            concurrency_count: 1,
            serialize_generation: true,
            pipe_capacity: 1024,
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Log level
    pub log_level: LogLevel,

    /// Emit pre/post generation timing
    pub verbose: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `SAVE_DIR`, `CONCURRENCY_COUNT` and `MEMORY_RESTRICTION_LEVEL`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("SAVE_DIR") {
            if !dir.is_empty() {
                self.runtime.save_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(count) = std::env::var("CONCURRENCY_COUNT") {
            self.runtime.concurrency_count = count
                .parse()
                .map_err(|_| EngineError::config("concurrency_count", format!("not a number: {count}")))?;
        }
        if let Ok(level) = std::env::var("MEMORY_RESTRICTION_LEVEL") {
            self.runtime.memory_restriction_level = level.parse().map_err(|_| {
                EngineError::config("memory_restriction_level", format!("not a number: {level}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.memory_restriction_level > 3 {
            return Err(EngineError::config(
                "memory_restriction_level",
                format!("Bad memory_restriction_level={}", self.runtime.memory_restriction_level),
            ));
        }

        if self.gpu.load_8bit && self.gpu.load_4bit {
            return Err(EngineError::config(
                "load_4bit",
                "8-bit and 4-bit loading are mutually exclusive",
            ));
        }

        if self.gpu.gpu_id < -1 {
            return Err(EngineError::config("gpu_id", "must be -1 or a device index"));
        }

        if self.runtime.concurrency_count == 0 {
            return Err(EngineError::config("concurrency_count", "must be at least 1"));
        }

        if self.runtime.pipe_capacity == 0 {
            return Err(EngineError::config("pipe_capacity", "must be at least 1"));
        }

        if self.runtime.poll_interval.is_zero() {
            return Err(EngineError::config("poll_interval", "must be non-zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.runtime.raise_generate_gpu_exceptions);
        assert_eq!(config.runtime.memory_restriction_level, 0);
        assert_eq!(config.gpu.gpu_id, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.runtime.memory_restriction_level = 4;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.gpu.load_8bit = true;
        config.gpu.load_4bit = true;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.runtime.pipe_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"model": {{"base_model": "distilgpt2"}}, "runtime": {{"memory_restriction_level": 2}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.base_model, "distilgpt2");
        assert_eq!(config.runtime.memory_restriction_level, 2);
        assert_eq!(config.runtime.pipe_capacity, 1024);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::default()), Level::INFO);
    }
}
