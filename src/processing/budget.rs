// Location: src/processing/budget.rs

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tokens held back from the model window for at least one paragraph of output.
const OUTPUT_HEADROOM: usize = 256;
/// Characters-per-token estimate used for string-level pre-trimming.
const CHARS_PER_TOKEN: usize = 4;
const MIN_OUTPUT_TOKENS: usize = 30;
const MIN_CONTEXT_PROMPT: usize = 64;

/// How hard the token windows are capped to fit constrained accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum MemoryRestriction {
    #[default]
    Unrestricted,
    Moderate,
    Low,
    Minimal,
}

impl MemoryRestriction {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MemoryRestriction {
    type Error = EngineError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(MemoryRestriction::Unrestricted),
            1 => Ok(MemoryRestriction::Moderate),
            2 => Ok(MemoryRestriction::Low),
            3 => Ok(MemoryRestriction::Minimal),
            other => Err(EngineError::config(
                "memory_restriction_level",
                format!("Bad memory_restriction_level={other}"),
            )),
        }
    }
}

/// Per-request token and character windows. Lengths named `*_len` and
/// `max_prompt_length` are in characters; `max_length_tokenize` is in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub cutoff_len: usize,
    pub output_smallest: usize,
    pub max_length_tokenize: usize,
    pub max_prompt_length: usize,
}

fn usable_tokens(level: MemoryRestriction, model_max_length: usize) -> usize {
    match level {
        MemoryRestriction::Unrestricted => model_max_length.saturating_sub(OUTPUT_HEADROOM),
        MemoryRestriction::Moderate | MemoryRestriction::Low => 768 - OUTPUT_HEADROOM,
        MemoryRestriction::Minimal => 512 - OUTPUT_HEADROOM,
    }
}

pub fn compute_budget(level: MemoryRestriction, model_max_length: usize) -> TokenBudget {
    let max_length_tokenize = usable_tokens(level, model_max_length);
    let cutoff_len = max_length_tokenize * CHARS_PER_TOKEN;
    let output_smallest = MIN_OUTPUT_TOKENS * CHARS_PER_TOKEN;
    TokenBudget {
        cutoff_len,
        output_smallest,
        max_length_tokenize,
        max_prompt_length: cutoff_len.saturating_sub(output_smallest),
    }
}

/// Budget for assembling retrieved context, which must leave room for the
/// main instruction as well.
pub fn compute_context_budget(level: MemoryRestriction, model_max_length: usize) -> TokenBudget {
    let budget = compute_budget(level, model_max_length);
    TokenBudget {
        max_prompt_length: MIN_CONTEXT_PROMPT.max(budget.max_prompt_length * 4 / 5),
        ..budget
    }
}

/// Upper bound offered for `max_new_tokens`.
pub fn max_max_new_tokens(
    level: MemoryRestriction,
    model_max_length: usize,
    user_max: Option<usize>,
) -> usize {
    if let Some(max) = user_max {
        return max;
    }
    match level {
        MemoryRestriction::Unrestricted => model_max_length,
        MemoryRestriction::Moderate => 768,
        MemoryRestriction::Low => 512,
        MemoryRestriction::Minimal => 256,
    }
}

/// Keep the trailing `max_chars` characters of `prompt`.
pub fn trim_prompt(prompt: &str, max_chars: usize) -> &str {
    let total = prompt.chars().count();
    if total <= max_chars {
        return prompt;
    }
    match prompt.char_indices().nth(total - max_chars) {
        Some((offset, _)) => &prompt[offset..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEVELS: [MemoryRestriction; 4] = [
        MemoryRestriction::Unrestricted,
        MemoryRestriction::Moderate,
        MemoryRestriction::Low,
        MemoryRestriction::Minimal,
    ];

    #[test]
    fn test_unrestricted_budget() {
        let budget = compute_budget(MemoryRestriction::Unrestricted, 2048);
        assert_eq!(
            budget,
            TokenBudget {
                cutoff_len: 7168,
                output_smallest: 120,
                max_length_tokenize: 1792,
                max_prompt_length: 7048,
            }
        );
    }

    #[test]
    fn test_restricted_budgets_ignore_model_length() {
        let moderate = compute_budget(MemoryRestriction::Moderate, 8192);
        assert_eq!(moderate.max_length_tokenize, 512);
        assert_eq!(moderate, compute_budget(MemoryRestriction::Low, 2048));

        let minimal = compute_budget(MemoryRestriction::Minimal, 8192);
        assert_eq!(minimal.max_length_tokenize, 256);
        assert_eq!(minimal.cutoff_len, 1024);
        assert_eq!(minimal.max_prompt_length, 904);
    }

    #[test]
    fn test_budget_invariants_hold_across_tiers() {
        for level in LEVELS {
            for model_max_length in [512, 1024, 2048, 4096, 83968] {
                let budget = compute_budget(level, model_max_length);
                assert!(budget.cutoff_len > 0);
                assert!(budget.max_prompt_length < budget.cutoff_len);

                let context = compute_context_budget(level, model_max_length);
                assert!(context.max_prompt_length <= budget.max_prompt_length);
                assert!(context.max_prompt_length >= 64);
                assert_eq!(context.cutoff_len, budget.cutoff_len);
            }
        }
    }

    #[test]
    fn test_context_budget_floor() {
        let context = compute_context_budget(MemoryRestriction::Unrestricted, 256);
        assert_eq!(context.max_prompt_length, 64);
    }

    #[test]
    fn test_memory_restriction_parsing() {
        assert_eq!(MemoryRestriction::try_from(2).unwrap(), MemoryRestriction::Low);
        assert_eq!(MemoryRestriction::Minimal.level(), 3);
        assert!(MemoryRestriction::try_from(4).is_err());
    }

    #[test]
    fn test_max_max_new_tokens() {
        assert_eq!(max_max_new_tokens(MemoryRestriction::Moderate, 2048, None), 768);
        assert_eq!(max_max_new_tokens(MemoryRestriction::Low, 2048, None), 512);
        assert_eq!(max_max_new_tokens(MemoryRestriction::Minimal, 2048, None), 256);
        assert_eq!(max_max_new_tokens(MemoryRestriction::Unrestricted, 2048, None), 2048);
        assert_eq!(max_max_new_tokens(MemoryRestriction::Minimal, 2048, Some(1000)), 1000);
    }

    #[test]
    fn test_trim_prompt_keeps_tail() {
        assert_eq!(trim_prompt("hello world", 5), "world");
        assert_eq!(trim_prompt("short", 64), "short");
        assert_eq!(trim_prompt("héllo wörld", 5), "wörld");
        assert_eq!(trim_prompt("abc", 0), "");
    }
}
