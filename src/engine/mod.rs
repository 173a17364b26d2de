//! Engine module: the generation orchestrator and the collaborator seams it
//! drives (prompt building, stopping criteria, retrieval)

mod async_stream;
mod builder;
mod engine;
pub mod fidelity;
pub mod output_log;
mod score;

pub use builder::EngineBuilder;
pub use engine::{Evaluation, Generator};
pub use fidelity::{check_prompt_fidelity, FidelityMatch, PromptFidelity};
pub use output_log::OutputLog;
pub use score::{score_qa, ResponseScore};

use std::sync::Arc;

use candle_core::Device;

use crate::model::{ModelHandle, StoppingCriteria, TextTokenizer};
use crate::types::{GenerationRequest, RetrievalMode};

/// Hidden conversational context injected for `human_bot` prompts when
/// `chat_context` is enabled and the caller gave none.
pub const HUMAN_BOT_CONTEXT: &str = "<bot>: I am an intelligent, helpful, truthful, and fair assistant named h2oGPT, who will give accurate, balanced, and reliable responses.  I will not respond with I don't know or I don't understand.\n<human>: I am a human person seeking useful assistance and request all questions be answered completely, and typically expect detailed responses.  Give answers in numbered list format if several distinct but related items are being listed.";

/// Inputs to one prompt build.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub context: &'a str,
    pub instruction: &'a str,
    pub input: &'a str,
    pub prompt_type: &'a str,
    pub prompt_dict: Option<&'a str>,
    pub chat: bool,
}

/// Prompt-template collaborator.
pub trait Prompter: Send + Sync {
    fn build_prompt(&self, input: &PromptInput<'_>) -> String;

    /// Pull the bot response out of cumulative `outputs`, which start with
    /// `prompt`.
    fn extract_response(&self, outputs: &str, prompt: &str, sanitize: bool) -> String;
}

pub trait StoppingCriteriaFactory: Send + Sync {
    fn build(
        &self,
        prompt_type: &str,
        prompt_dict: Option<&str>,
        tokenizer: &Arc<dyn TextTokenizer>,
        device: &Device,
        model_max_length: usize,
    ) -> Option<Arc<dyn StoppingCriteria>>;
}

/// One question for the retrieval collaborator.
pub struct RetrievalQuery<'a> {
    pub query: String,
    pub mode: RetrievalMode,
    pub model: &'a ModelHandle,
    pub stream_output: bool,
    pub request: &'a GenerationRequest,
    /// Similarity cut-off for document matches.
    pub cut_distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalAnswer {
    pub text: String,
    pub sources: String,
}

pub type RetrievalStream<'a> = Box<dyn Iterator<Item = anyhow::Result<RetrievalAnswer>> + Send + 'a>;

/// Document retrieval and question answering over an index.
pub trait Retriever: Send + Sync {
    fn has_index(&self, mode: RetrievalMode) -> bool;

    fn run_retrieval<'a>(&'a self, query: RetrievalQuery<'a>) -> anyhow::Result<RetrievalStream<'a>>;
}

/// Template-free prompter: context, instruction and optional input.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPrompter;

impl Prompter for PlainPrompter {
    fn build_prompt(&self, input: &PromptInput<'_>) -> String {
        let mut prompt = String::with_capacity(input.context.len() + input.instruction.len() + input.input.len() + 1);
        prompt.push_str(input.context);
        prompt.push_str(input.instruction);
        if !input.input.is_empty() {
            prompt.push('\n');
            prompt.push_str(input.input);
        }
        prompt
    }

    fn extract_response(&self, outputs: &str, prompt: &str, sanitize: bool) -> String {
        if prompt.starts_with(outputs) {
            return String::new();
        }
        let response = outputs.strip_prefix(prompt).unwrap_or(outputs);
        if sanitize {
            response
                .chars()
                .filter(|c| *c == '\n' || !c.is_control())
                .collect::<String>()
                .trim()
                .to_string()
        } else {
            response.to_string()
        }
    }
}
