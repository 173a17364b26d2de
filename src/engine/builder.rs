use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{
    config::EngineConfig,
    error::Result,
    gpu::AcceleratorPool,
};

use super::engine::Generator;
use super::output_log::OutputLog;
use super::{PlainPrompter, Prompter, Retriever, StoppingCriteriaFactory};

/// Builder for constructing a [`Generator`] instance
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    prompter: Option<Arc<dyn Prompter>>,
    stopping: Option<Arc<dyn StoppingCriteriaFactory>>,
    retriever: Option<Arc<dyn Retriever>>,
    pool: Option<AcceleratorPool>,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            config: None,
            prompter: None,
            stopping: None,
            retriever: None,
            pool: None,
        }
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_stopping_criteria(mut self, factory: Arc<dyn StoppingCriteriaFactory>) -> Self {
        self.stopping = Some(factory);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Share an accelerator pool, e.g. one that already holds the model's
    /// cache-clearing hooks
    pub fn with_pool(mut self, pool: AcceleratorPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Build the generator instance
    pub fn build(self) -> Result<Generator> {
        // Get configuration or use default
        let config = self.config.unwrap_or_default();

        // Validate configuration
        config.validate()?;

        let output_log = config.runtime.save_dir.as_ref().map(|dir| Arc::new(OutputLog::new(dir)));
        info!(
            base_model = %config.model.base_model,
            memory_restriction_level = config.runtime.memory_restriction_level,
            serialize_generation = config.runtime.serialize_generation,
            save_dir = ?config.runtime.save_dir,
            "Generator ready"
        );

        Ok(Generator {
            config: Arc::new(config),
            prompter: self.prompter.unwrap_or_else(|| Arc::new(PlainPrompter)),
            stopping: self.stopping,
            retriever: self.retriever,
            pool: self.pool.unwrap_or_default(),
            generate_lock: Arc::new(Mutex::new(())),
            output_log,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
