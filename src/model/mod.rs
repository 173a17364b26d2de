//! Model module: capability traits for generation engines and the handle
//! the orchestrator dispatches on

pub mod metadata;
mod runtime;
mod streamer;
mod tokenizer;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use candle_core::Device;

use crate::error::{EngineError, Result, RuntimeFault};
use crate::gpu::PlacementPlan;
use crate::types::{EarlyStopping, LengthControls, SamplingParams};

pub use metadata::{LayerSpec, ModelMetadata};
pub use runtime::{CandleDecoder, ForwardModel};
pub use streamer::TextStreamer;
pub use tokenizer::{clean_up_tokenization, DecodeOptions, HfTokenizer, TextTokenizer};

/// Special token ids forwarded to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    pub bos: Option<u32>,
    pub cls: Option<u32>,
    pub sep: Option<u32>,
}

/// Fully assembled decoding configuration for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub num_beams: usize,
    pub repetition_penalty: f64,
    pub do_sample: bool,
    pub num_return_sequences: usize,
    pub renormalize_logits: bool,
    pub remove_invalid_values: bool,
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub early_stopping: EarlyStopping,
    pub max_time: Option<Duration>,
    pub seed: u64,
    pub special_tokens: SpecialTokens,
}

impl GenerationConfig {
    pub fn new(sampling: &SamplingParams, length: &LengthControls, special_tokens: SpecialTokens) -> Self {
        Self {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            num_beams: sampling.num_beams,
            repetition_penalty: sampling.repetition_penalty,
            do_sample: sampling.do_sample,
            num_return_sequences: sampling.num_return_sequences.max(1),
            renormalize_logits: true,
            remove_invalid_values: true,
            max_new_tokens: length.max_new_tokens,
            min_new_tokens: length.min_new_tokens,
            early_stopping: length.early_stopping,
            max_time: length.max_time,
            seed: sampling.seed,
            special_tokens,
        }
    }
}

/// Decides whether decoding should halt given all ids so far.
pub trait StoppingCriteria: Send + Sync {
    fn should_stop(&self, ids: &[u32]) -> bool;
}

/// Receives token ids as they are produced. The prompt ids arrive first.
pub trait TokenSink {
    fn put(&mut self, ids: &[u32]);

    fn end(&mut self);

    /// Engines poll this between tokens.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Arguments owned by one generation call.
#[derive(Clone)]
pub struct GenerateArgs {
    pub input_ids: Vec<u32>,
    pub config: GenerationConfig,
    pub stopping: Option<Arc<dyn StoppingCriteria>>,
}

impl fmt::Debug for GenerateArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateArgs")
            .field("input_ids", &self.input_ids.len())
            .field("config", &self.config)
            .field("stopping", &self.stopping.is_some())
            .finish()
    }
}

/// Full sequences, prompt ids included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateOutput {
    pub sequences: Vec<Vec<u32>>,
}

pub trait CausalLm: Send + Sync {
    fn generate(
        &self,
        args: &GenerateArgs,
        sink: Option<&mut dyn TokenSink>,
    ) -> std::result::Result<GenerateOutput, RuntimeFault>;
}

pub trait SequenceClassifier: Send + Sync {
    /// Raw logits for one encoded sequence.
    fn classify(&self, input_ids: &[u32]) -> std::result::Result<Vec<f32>, RuntimeFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTask {
    Summarization,
}

impl FromStr for PipelineTask {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "summarization" => Ok(PipelineTask::Summarization),
            other => Err(EngineError::config("task", format!("No such task type {other}"))),
        }
    }
}

pub trait TaskPipeline: Send + Sync {
    fn run_task(
        &self,
        task: PipelineTask,
        prompt: &str,
        max_length: usize,
    ) -> std::result::Result<String, RuntimeFault>;
}

#[derive(Clone)]
pub enum ModelKind {
    Decoder(Arc<dyn CausalLm>),
    Reward(Arc<dyn SequenceClassifier>),
    Pipeline {
        task: PipelineTask,
        runner: Arc<dyn TaskPipeline>,
    },
    /// Engine reachable only through the retrieval collaborator.
    LocalEngine,
}

impl ModelKind {
    fn name(&self) -> &'static str {
        match self {
            ModelKind::Decoder(_) => "decoder",
            ModelKind::Reward(_) => "reward",
            ModelKind::Pipeline { .. } => "pipeline",
            ModelKind::LocalEngine => "local-engine",
        }
    }
}

/// A loaded model plus everything needed to drive it.
#[derive(Clone)]
pub struct ModelHandle {
    pub base_model: String,
    pub kind: ModelKind,
    pub tokenizer: Option<Arc<dyn TextTokenizer>>,
    pub device: Device,
    pub placement: PlacementPlan,
}

impl ModelHandle {
    pub fn new(base_model: impl Into<String>, kind: ModelKind, tokenizer: Option<Arc<dyn TextTokenizer>>) -> Self {
        Self {
            base_model: base_model.into(),
            kind,
            tokenizer,
            device: Device::Cpu,
            placement: PlacementPlan::cpu(),
        }
    }

    pub fn decoder(
        base_model: impl Into<String>,
        engine: Arc<dyn CausalLm>,
        tokenizer: Arc<dyn TextTokenizer>,
    ) -> Self {
        Self::new(base_model, ModelKind::Decoder(engine), Some(tokenizer))
    }

    pub fn reward(
        base_model: impl Into<String>,
        classifier: Arc<dyn SequenceClassifier>,
        tokenizer: Arc<dyn TextTokenizer>,
    ) -> Self {
        Self::new(base_model, ModelKind::Reward(classifier), Some(tokenizer))
    }

    pub fn pipeline(base_model: impl Into<String>, task: PipelineTask, runner: Arc<dyn TaskPipeline>) -> Self {
        Self::new(base_model, ModelKind::Pipeline { task, runner }, None)
    }

    pub fn local_engine(base_model: impl Into<String>) -> Self {
        Self::new(base_model, ModelKind::LocalEngine, None)
    }

    pub fn with_device(mut self, device: Device, placement: PlacementPlan) -> Self {
        self.device = device;
        self.placement = placement;
        self
    }

    pub fn is_local_engine(&self) -> bool {
        matches!(self.kind, ModelKind::LocalEngine)
    }

    pub fn tokenizer(&self) -> Result<&Arc<dyn TextTokenizer>> {
        self.tokenizer.as_ref().ok_or_else(EngineError::no_model)
    }

    fn unsupported(&self, capability: &'static str) -> EngineError {
        EngineError::Capability {
            model: format!("{} ({})", self.base_model, self.kind.name()),
            capability,
        }
    }

    pub fn causal_lm(&self) -> Result<&Arc<dyn CausalLm>> {
        match &self.kind {
            ModelKind::Decoder(engine) => Ok(engine),
            _ => Err(self.unsupported("generate")),
        }
    }

    pub fn generate(&self, args: &GenerateArgs, sink: Option<&mut dyn TokenSink>) -> Result<GenerateOutput> {
        Ok(self.causal_lm()?.generate(args, sink)?)
    }

    pub fn classifier(&self) -> Result<&Arc<dyn SequenceClassifier>> {
        match &self.kind {
            ModelKind::Reward(classifier) => Ok(classifier),
            _ => Err(self.unsupported("classify")),
        }
    }

    pub fn classify(&self, input_ids: &[u32]) -> Result<Vec<f32>> {
        Ok(self.classifier()?.classify(input_ids)?)
    }

    pub fn run_task(&self, prompt: &str, max_length: usize) -> Result<String> {
        match &self.kind {
            ModelKind::Pipeline { task, runner } => Ok(runner.run_task(*task, prompt, max_length)?),
            _ => Err(self.unsupported("run_task")),
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("base_model", &self.base_model)
            .field("kind", &self.kind.name())
            .field("tokenizer", &self.tokenizer.is_some())
            .field("device", &self.device)
            .finish()
    }
}

/// Sink that keeps every id it sees, used for non-streaming calls so a
/// partial sequence survives an aborted generation.
#[derive(Debug, Default)]
pub struct SequenceCollector {
    ids: Vec<u32>,
}

impl SequenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_ids(self) -> Vec<u32> {
        self.ids
    }
}

impl TokenSink for SequenceCollector {
    fn put(&mut self, ids: &[u32]) {
        self.ids.extend_from_slice(ids);
    }

    fn end(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CharTokenizer, ScriptedLm};

    #[test]
    fn test_capability_errors() {
        let handle = ModelHandle::local_engine("llama");
        assert!(matches!(
            handle.causal_lm(),
            Err(EngineError::Capability { capability: "generate", .. })
        ));
        assert!(handle.classify(&[1, 2]).is_err());
        assert!(matches!(handle.tokenizer(), Err(EngineError::ConfigurationError { .. })));
    }

    #[test]
    fn test_decoder_handle_generates() {
        let tokenizer = Arc::new(CharTokenizer::new());
        let engine = Arc::new(ScriptedLm::new(tokenizer.clone(), " done"));
        let handle = ModelHandle::decoder("scripted", engine, tokenizer.clone());

        let args = GenerateArgs {
            input_ids: tokenizer.ids("hi"),
            config: GenerationConfig::new(&SamplingParams::default(), &LengthControls::default(), SpecialTokens::default()),
            stopping: None,
        };
        let output = handle.generate(&args, None).unwrap();
        assert_eq!(output.sequences, vec![tokenizer.ids("hi done")]);
        assert!(handle.run_task("hi", 8).is_err());
    }

    #[test]
    fn test_pipeline_task_parsing() {
        assert_eq!("summarization".parse::<PipelineTask>().unwrap(), PipelineTask::Summarization);
        let err = "translation".parse::<PipelineTask>().unwrap_err();
        assert!(err.to_string().contains("No such task type translation"));
    }

    #[test]
    fn test_collector_keeps_everything() {
        let mut collector = SequenceCollector::new();
        collector.put(&[1, 2]);
        collector.put(&[3]);
        collector.end();
        assert_eq!(collector.into_ids(), vec![1, 2, 3]);
    }
}
