use tracing::warn;

use crate::error::Result;
use crate::model::{DecodeOptions, TextTokenizer};

/// Which comparison matched the decoded prompt to the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FidelityMatch {
    Exact,
    LeadingWhitespace,
    /// Matched only with special tokens kept.
    Raw,
    /// Raw decode matched once `<unk>` and whitespace were ignored.
    RawCollapsed,
    Mismatch,
}

/// Prompt and decode settings used for the rest of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFidelity {
    pub matched: FidelityMatch,
    /// Prompt to strip from outputs, possibly replaced by its decoded form.
    pub prompt: String,
    pub inputs_decoded: String,
    pub decode_options: DecodeOptions,
}

fn collapse(text: &str) -> String {
    text.replace("<unk> ", "")
        .replace("<unk>", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Decode `input_ids` and compare them against `prompt`, picking the
/// decode options that reproduce the prompt best.
pub fn check_prompt_fidelity(
    tokenizer: &dyn TextTokenizer,
    input_ids: &[u32],
    prompt: &str,
) -> Result<PromptFidelity> {
    let inputs_decoded = tokenizer.decode(input_ids, DecodeOptions::CLEAN)?;
    if inputs_decoded == prompt {
        return Ok(PromptFidelity {
            matched: FidelityMatch::Exact,
            prompt: prompt.to_string(),
            inputs_decoded,
            decode_options: DecodeOptions::CLEAN,
        });
    }
    if inputs_decoded.trim_start() == prompt.trim_start() {
        return Ok(PromptFidelity {
            matched: FidelityMatch::LeadingWhitespace,
            prompt: inputs_decoded.clone(),
            inputs_decoded,
            decode_options: DecodeOptions::CLEAN,
        });
    }

    let inputs_decoded_raw = tokenizer.decode(input_ids, DecodeOptions::RAW)?;
    let matched = if inputs_decoded_raw == prompt {
        Some(FidelityMatch::Raw)
    } else if collapse(&inputs_decoded_raw) == collapse(prompt) {
        Some(FidelityMatch::RawCollapsed)
    } else {
        None
    };
    if let Some(matched) = matched {
        return Ok(PromptFidelity {
            matched,
            prompt: inputs_decoded_raw.clone(),
            inputs_decoded: inputs_decoded_raw,
            decode_options: DecodeOptions::RAW,
        });
    }

    warn!("Special characters in prompt, decoded prompt differs from input");
    Ok(PromptFidelity {
        matched: FidelityMatch::Mismatch,
        prompt: prompt.to_string(),
        inputs_decoded,
        decode_options: DecodeOptions::CLEAN,
    })
}
