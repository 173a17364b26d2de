//! Scripted collaborators shared by the unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::Tensor;
use parking_lot::Mutex;

use crate::engine::{RetrievalAnswer, RetrievalQuery, RetrievalStream, Retriever};
use crate::error::{EngineError, Result, RuntimeFault};
use crate::model::{
    CausalLm, DecodeOptions, ForwardModel, GenerateArgs, GenerateOutput, PipelineTask, SequenceClassifier,
    SpecialTokens, TaskPipeline, TextTokenizer, TokenSink,
};
use crate::types::RetrievalMode;

/// One token per character, ids are code points. Ids 0 and 1 stand for the
/// `</s>` and `<unk>` special tokens.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    leading_space: bool,
    model_max_length: usize,
}

impl CharTokenizer {
    pub const EOS: u32 = 0;
    pub const UNK: u32 = 1;

    pub fn new() -> Self {
        Self {
            leading_space: false,
            model_max_length: 2048,
        }
    }

    /// Decode with a leading space, like sentencepiece tokenizers do.
    pub fn with_leading_space(mut self) -> Self {
        self.leading_space = true;
        self
    }

    pub fn with_model_max_length(mut self, model_max_length: usize) -> Self {
        self.model_max_length = model_max_length;
        self
    }

    pub fn ids(&self, text: &str) -> Vec<u32> {
        text.chars().map(u32::from).collect()
    }
}

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(self.ids(text))
    }

    fn decode(&self, ids: &[u32], options: DecodeOptions) -> Result<String> {
        let mut text = String::new();
        if self.leading_space && !ids.is_empty() {
            text.push(' ');
        }
        for &id in ids {
            match id {
                Self::EOS | Self::UNK if options.skip_special_tokens => {}
                Self::EOS => text.push_str("</s>"),
                Self::UNK => text.push_str("<unk>"),
                other => text.push(
                    char::from_u32(other).ok_or_else(|| EngineError::TokenizerError(format!("bad id {other}")))?,
                ),
            }
        }
        Ok(text)
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            eos: Some(Self::EOS),
            ..Default::default()
        }
    }
}

/// Engine that answers every prompt with a fixed continuation.
pub struct ScriptedLm {
    continuation: Vec<u32>,
    fail: Option<(usize, RuntimeFault)>,
    calls: AtomicUsize,
    last_args: Mutex<Option<GenerateArgs>>,
}

impl ScriptedLm {
    pub fn new(tokenizer: Arc<CharTokenizer>, continuation: &str) -> Self {
        Self {
            continuation: tokenizer.ids(continuation),
            fail: None,
            calls: AtomicUsize::new(0),
            last_args: Mutex::new(None),
        }
    }

    /// Emit `tokens` continuation tokens, then fail with `fault`.
    pub fn fail_after(mut self, tokens: usize, fault: RuntimeFault) -> Self {
        self.fail = Some((tokens, fault));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Option<GenerateArgs> {
        self.last_args.lock().clone()
    }
}

impl CausalLm for ScriptedLm {
    fn generate(
        &self,
        args: &GenerateArgs,
        mut sink: Option<&mut dyn TokenSink>,
    ) -> std::result::Result<GenerateOutput, RuntimeFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_args.lock() = Some(args.clone());

        let mut produced = args.input_ids.clone();
        if let Some(sink) = sink.as_deref_mut() {
            sink.put(&args.input_ids);
        }
        for (index, &id) in self.continuation.iter().take(args.config.max_new_tokens).enumerate() {
            if let Some((after, fault)) = &self.fail {
                if index == *after {
                    return Err(fault.clone());
                }
            }
            if sink.as_deref().is_some_and(|sink| sink.is_cancelled()) {
                break;
            }
            produced.push(id);
            if let Some(sink) = sink.as_deref_mut() {
                sink.put(&[id]);
            }
        }
        if let Some(sink) = sink {
            sink.end();
        }
        Ok(GenerateOutput {
            sequences: vec![produced; args.config.num_return_sequences.max(1)],
        })
    }
}

/// Forward pass emitting one-hot logits that follow `script`.
pub struct ScriptedForward {
    vocab: usize,
    script: Vec<u32>,
    step: usize,
    nan: bool,
}

impl ScriptedForward {
    pub fn new(vocab: usize, script: Vec<u32>) -> Self {
        Self {
            vocab,
            script,
            step: 0,
            nan: false,
        }
    }

    pub fn with_nan(mut self) -> Self {
        self.nan = true;
        self
    }
}

impl ForwardModel for ScriptedForward {
    fn forward(&mut self, input: &Tensor, _index_pos: usize) -> candle_core::Result<Tensor> {
        let target = self
            .script
            .get(self.step)
            .or(self.script.last())
            .copied()
            .unwrap_or_default() as usize;
        self.step += 1;

        let mut values = vec![if self.nan { f32::NAN } else { 0.0 }; self.vocab];
        if !self.nan {
            if let Some(value) = values.get_mut(target) {
                *value = 10.0;
            }
        }
        Tensor::from_vec(values, (1, 1, self.vocab), input.device())
    }

    fn clear_kv_cache(&mut self) {
        self.step = 0;
    }
}

pub struct ScriptedClassifier {
    result: std::result::Result<Vec<f32>, RuntimeFault>,
    last_input: Mutex<Option<Vec<u32>>>,
}

impl ScriptedClassifier {
    pub fn new(logits: Vec<f32>) -> Self {
        Self {
            result: Ok(logits),
            last_input: Mutex::new(None),
        }
    }

    pub fn failing(fault: RuntimeFault) -> Self {
        Self {
            result: Err(fault),
            last_input: Mutex::new(None),
        }
    }

    pub fn last_input(&self) -> Option<Vec<u32>> {
        self.last_input.lock().clone()
    }
}

impl SequenceClassifier for ScriptedClassifier {
    fn classify(&self, input_ids: &[u32]) -> std::result::Result<Vec<f32>, RuntimeFault> {
        *self.last_input.lock() = Some(input_ids.to_vec());
        self.result.clone()
    }
}

pub struct ScriptedPipeline {
    response: String,
    last_max_length: Mutex<Option<usize>>,
}

impl ScriptedPipeline {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            last_max_length: Mutex::new(None),
        }
    }

    pub fn last_max_length(&self) -> Option<usize> {
        *self.last_max_length.lock()
    }
}

impl TaskPipeline for ScriptedPipeline {
    fn run_task(
        &self,
        _task: PipelineTask,
        _prompt: &str,
        max_length: usize,
    ) -> std::result::Result<String, RuntimeFault> {
        *self.last_max_length.lock() = Some(max_length);
        Ok(self.response.clone())
    }
}

/// Retriever with an index for a single mode and canned answers.
pub struct ScriptedRetriever {
    mode: RetrievalMode,
    answers: Vec<RetrievalAnswer>,
    last_query: Mutex<Option<String>>,
    last_cut_distance: Mutex<Option<f64>>,
}

impl ScriptedRetriever {
    pub fn new(mode: RetrievalMode, answers: Vec<RetrievalAnswer>) -> Self {
        Self {
            mode,
            answers,
            last_query: Mutex::new(None),
            last_cut_distance: Mutex::new(None),
        }
    }

    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().clone()
    }

    pub fn last_cut_distance(&self) -> Option<f64> {
        *self.last_cut_distance.lock()
    }
}

impl Retriever for ScriptedRetriever {
    fn has_index(&self, mode: RetrievalMode) -> bool {
        mode == self.mode
    }

    fn run_retrieval<'a>(&'a self, query: RetrievalQuery<'a>) -> anyhow::Result<RetrievalStream<'a>> {
        *self.last_query.lock() = Some(query.query);
        *self.last_cut_distance.lock() = Some(query.cut_distance);
        Ok(Box::new(self.answers.clone().into_iter().map(Ok::<_, anyhow::Error>)))
    }
}
