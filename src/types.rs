//! Common type definitions used throughout the engine

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::GenerationDefaults;
use crate::error::EngineError;

/// Seed used when a request does not pick one.
pub const DEFAULT_SEED: u64 = 1236;

/// Early stopping policy forwarded to beam-capable engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyStopping {
    #[default]
    False,
    True,
    Never,
}

/// Sampling hyperparameters for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    /// `0` disables top-k filtering.
    pub top_k: usize,
    pub num_beams: usize,
    pub repetition_penalty: f64,
    pub num_return_sequences: usize,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 1,
            repetition_penalty: 1.07,
            num_return_sequences: 1,
            do_sample: false,
            seed: DEFAULT_SEED,
        }
    }
}

/// Length and time limits for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthControls {
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub max_time: Option<Duration>,
    pub early_stopping: EarlyStopping,
}

impl Default for LengthControls {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            min_new_tokens: 0,
            max_time: Some(Duration::from_secs(180)),
            early_stopping: EarlyStopping::False,
        }
    }
}

/// Document source consulted before direct generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RetrievalMode {
    #[default]
    Disabled,
    ChatLLM,
    LLM,
    MyData,
    UserData,
    #[serde(rename = "wiki")]
    Wiki,
    #[serde(rename = "wiki_full")]
    WikiFull,
}

impl RetrievalMode {
    pub const ALL: [RetrievalMode; 7] = [
        RetrievalMode::Disabled,
        RetrievalMode::ChatLLM,
        RetrievalMode::LLM,
        RetrievalMode::MyData,
        RetrievalMode::UserData,
        RetrievalMode::Wiki,
        RetrievalMode::WikiFull,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Disabled => "Disabled",
            RetrievalMode::ChatLLM => "ChatLLM",
            RetrievalMode::LLM => "LLM",
            RetrievalMode::MyData => "MyData",
            RetrievalMode::UserData => "UserData",
            RetrievalMode::Wiki => "wiki",
            RetrievalMode::WikiFull => "wiki_full",
        }
    }

    /// Whether this mode reads from a document index at all.
    pub fn uses_documents(&self) -> bool {
        !matches!(
            self,
            RetrievalMode::Disabled | RetrievalMode::ChatLLM | RetrievalMode::LLM
        )
    }

    /// Similarity cutoff handed to the retrieval collaborator.
    pub fn cut_distance(&self) -> f64 {
        match self {
            RetrievalMode::WikiFull => 1.1,
            _ => 1.64,
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RetrievalMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| EngineError::config("langchain_mode", format!("Invalid langchain_mode {s}")))
    }
}

/// Options forwarded to the retrieval collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    pub mode: RetrievalMode,
    pub top_k_docs: usize,
    pub chunk: bool,
    pub chunk_size: usize,
    pub document_choice: Vec<String>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Disabled,
            top_k_docs: 3,
            chunk: true,
            chunk_size: 512,
            document_choice: Vec::new(),
        }
    }
}

/// Everything a single `evaluate` call needs. Built once, never mutated
/// while generation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub instruction: String,
    /// Secondary input appended after the instruction.
    pub iinput: String,
    pub context: String,
    pub instruction_nochat: String,
    pub iinput_nochat: String,
    pub chat: bool,
    pub stream_output: bool,
    pub prompt_type: String,
    pub prompt_dict: Option<String>,
    pub sampling: SamplingParams,
    pub length: LengthControls,
    pub retrieval: RetrievalOptions,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            instruction: String::new(),
            iinput: String::new(),
            context: String::new(),
            instruction_nochat: String::new(),
            iinput_nochat: String::new(),
            chat: false,
            stream_output: false,
            prompt_type: "plain".to_string(),
            prompt_dict: None,
            sampling: SamplingParams::default(),
            length: LengthControls::default(),
            retrieval: RetrievalOptions::default(),
        }
    }
}

impl GenerationRequest {
    /// Non-chat request for `instruction` using the configured defaults.
    pub fn from_defaults(defaults: &GenerationDefaults, instruction: impl Into<String>) -> Self {
        Self {
            instruction_nochat: instruction.into(),
            stream_output: defaults.stream_output,
            prompt_type: defaults.prompt_type.clone(),
            sampling: defaults.sampling.clone(),
            length: defaults.length.clone(),
            ..Default::default()
        }
    }

    /// Instruction and secondary input after chat/non-chat selection.
    pub fn routed_inputs(&self) -> (&str, &str) {
        if self.chat {
            (&self.instruction, &self.iinput)
        } else {
            (&self.instruction_nochat, &self.iinput_nochat)
        }
    }
}

/// One response snapshot yielded by the orchestrator. The last one is the
/// final answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub response: String,
    pub sources: String,
}

impl ResponseSnapshot {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            sources: String::new(),
        }
    }

    pub fn with_sources(response: impl Into<String>, sources: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            sources: sources.into(),
        }
    }
}
