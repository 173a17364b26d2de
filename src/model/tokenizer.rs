// Location: src/model/tokenizer.rs

use std::path::Path;

use tokenizers::{Tokenizer, TruncationParams, TruncationStrategy};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::model::SpecialTokens;

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<eos>", "<|im_end|>"];
const BOS_CANDIDATES: &[&str] = &["<s>", "<bos>", "<|startoftext|>"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]"];
const CLS_CANDIDATES: &[&str] = &["[CLS]", "<cls>"];
const SEP_CANDIDATES: &[&str] = &["[SEP]", "<sep>"];

/// How token ids are turned back into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub skip_special_tokens: bool,
    pub clean_up_tokenization_spaces: bool,
}

impl DecodeOptions {
    pub const CLEAN: DecodeOptions = DecodeOptions {
        skip_special_tokens: true,
        clean_up_tokenization_spaces: true,
    };

    /// Keeps special tokens in the text.
    pub const RAW: DecodeOptions = DecodeOptions {
        skip_special_tokens: false,
        clean_up_tokenization_spaces: true,
    };
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::CLEAN
    }
}

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    /// Encode a sequence pair, dropping tokens from the longer side until
    /// the pair fits `max_length`.
    fn encode_pair(&self, first: &str, second: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut first = self.encode(first, true)?;
        let mut second = self.encode(second, false)?;
        while first.len() + second.len() > max_length {
            if first.len() >= second.len() {
                first.pop();
            } else {
                second.pop();
            }
        }
        first.extend(second);
        Ok(first)
    }

    fn decode(&self, ids: &[u32], options: DecodeOptions) -> Result<String>;

    fn model_max_length(&self) -> usize;

    fn special_tokens(&self) -> SpecialTokens;
}

/// Undo the spacing a word-level decode leaves before punctuation and
/// English contractions.
pub fn clean_up_tokenization(text: &str) -> String {
    text.replace(" .", ".")
        .replace(" ?", "?")
        .replace(" !", "!")
        .replace(" ,", ",")
        .replace(" ' ", "'")
        .replace(" n't", "n't")
        .replace(" 'm", "'m")
        .replace(" 's", "'s")
        .replace(" 've", "'ve")
        .replace(" 're", "'re")
}

/// `tokenizer.json` backed tokenizer.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    model_max_length: usize,
    special_tokens: SpecialTokens,
}

impl HfTokenizer {
    pub fn new(tokenizer: Tokenizer, model_max_length: usize) -> Self {
        let lookup = |candidates: &[&str]| candidates.iter().find_map(|token| tokenizer.token_to_id(token));
        let special_tokens = SpecialTokens {
            eos: lookup(EOS_CANDIDATES),
            pad: lookup(PAD_CANDIDATES),
            bos: lookup(BOS_CANDIDATES),
            cls: lookup(CLS_CANDIDATES),
            sep: lookup(SEP_CANDIDATES),
        };
        debug!(?special_tokens, model_max_length, "Loaded tokenizer");
        Self {
            tokenizer,
            model_max_length,
            special_tokens,
        }
    }

    pub fn from_file(path: impl AsRef<Path>, model_max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            EngineError::TokenizerError(format!("{}: {e}", path.as_ref().display()))
        })?;
        Ok(Self::new(tokenizer, model_max_length))
    }

    /// Replace the detected ids, e.g. with a model family's fixed ids.
    pub fn with_special_tokens(mut self, special_tokens: SpecialTokens) -> Self {
        self.special_tokens = special_tokens;
        self
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| EngineError::TokenizerError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn encode_pair(&self, first: &str, second: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut tokenizer = self.tokenizer.clone();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(|e| EngineError::TokenizerError(e.to_string()))?;
        let encoding = tokenizer
            .encode((first, second), true)
            .map_err(|e| EngineError::TokenizerError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], options: DecodeOptions) -> Result<String> {
        let text = self
            .tokenizer
            .decode(ids, options.skip_special_tokens)
            .map_err(|e| EngineError::TokenizerError(e.to_string()))?;
        if options.clean_up_tokenization_spaces {
            Ok(clean_up_tokenization(&text))
        } else {
            Ok(text)
        }
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.special_tokens
    }
}
