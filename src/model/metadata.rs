use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::Result;
use crate::model::SpecialTokens;

const DEFAULT_MODEL_MAX_LENGTH: usize = 2048;

/// Long-context window overrides keyed by model name fragment.
const LONG_SEQUENCE_OVERRIDES: &[(&str, usize)] = &[
    ("mpt-7b-storywriter", 83968),
    ("mosaicml/mpt-7b-chat", 4096),
];

/// Parameter count of one placeable model section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub parameters: u64,
}

/// The parts of a model `config.json` the execution layer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelMetadata {
    pub architectures: Vec<String>,
    pub model_type: Option<String>,
    pub max_seq_len: Option<usize>,
    pub max_position_embeddings: Option<usize>,
    /// Section sizes for the placement dry run; absent from most configs.
    pub layers: Vec<LayerSpec>,
}

impl ModelMetadata {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn model_max_length(&self, base_model: &str, long_sequence: bool) -> usize {
        if long_sequence {
            let model_lower = base_model.to_lowercase();
            if let Some((_, length)) = LONG_SEQUENCE_OVERRIDES
                .iter()
                .find(|(fragment, _)| model_lower.contains(fragment))
            {
                return *length;
            }
        }
        match (self.max_seq_len, self.max_position_embeddings) {
            (Some(length), _) | (None, Some(length)) => length,
            (None, None) => {
                debug!("Could not determine model_max_length, setting to {DEFAULT_MODEL_MAX_LENGTH}");
                DEFAULT_MODEL_MAX_LENGTH
            }
        }
    }

    pub fn is_llama_type(&self, base_model: &str) -> bool {
        let from_config = self.model_type.as_deref().is_some_and(|t| t.to_lowercase().contains("llama"))
            || self.architectures.iter().any(|a| a.to_lowercase().contains("llama"));
        from_config || base_model.to_lowercase().contains("llama")
    }

    /// Fixed ids for families whose shipped configs carry broken ones.
    pub fn special_token_overrides(&self, base_model: &str, detected: SpecialTokens) -> SpecialTokens {
        if self.is_llama_type(base_model) {
            SpecialTokens {
                pad: Some(0),
                bos: Some(1),
                eos: Some(2),
                ..detected
            }
        } else {
            detected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_max_length_precedence() {
        let meta: ModelMetadata =
            serde_json::from_str(r#"{"max_seq_len": 4096, "max_position_embeddings": 2048}"#).unwrap();
        assert_eq!(meta.model_max_length("some/model", false), 4096);

        let meta: ModelMetadata = serde_json::from_str(r#"{"max_position_embeddings": 1024}"#).unwrap();
        assert_eq!(meta.model_max_length("some/model", false), 1024);

        assert_eq!(ModelMetadata::default().model_max_length("some/model", false), 2048);
    }

    #[test]
    fn test_long_sequence_overrides() {
        let meta = ModelMetadata {
            max_seq_len: Some(2048),
            ..Default::default()
        };
        assert_eq!(meta.model_max_length("mosaicml/mpt-7b-storywriter", true), 83968);
        assert_eq!(meta.model_max_length("mosaicml/mpt-7b-chat", true), 4096);
        assert_eq!(meta.model_max_length("mosaicml/mpt-7b-chat", false), 2048);
    }

    #[test]
    fn test_llama_fixup() {
        let meta: ModelMetadata =
            serde_json::from_str(r#"{"architectures": ["LlamaForCausalLM"], "model_type": "llama"}"#).unwrap();
        let fixed = meta.special_token_overrides("decapoda/7b", SpecialTokens::default());
        assert_eq!((fixed.pad, fixed.bos, fixed.eos), (Some(0), Some(1), Some(2)));

        let detected = SpecialTokens {
            eos: Some(50256),
            ..Default::default()
        };
        let untouched = ModelMetadata::default().special_token_overrides("gpt2", detected);
        assert_eq!(untouched, detected);
        assert!(ModelMetadata::default().is_llama_type("huggyllama/llama-7b"));
    }
}
