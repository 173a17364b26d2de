use std::fmt;

use tracing::{error, warn};

use crate::error::{Result, RuntimeFault};
use crate::gpu::AcceleratorPool;
use crate::model::ModelHandle;
use crate::processing::{trim_prompt, TokenBudget};

/// Reward model verdict on one question/answer pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseScore {
    /// Sigmoid of the first logit, in `0.0..=1.0`.
    Value(f32),
    GpuOom,
    GpuError,
}

impl ResponseScore {
    pub fn value(&self) -> Option<f32> {
        match self {
            ResponseScore::Value(score) => Some(*score),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseScore::Value(score) => write!(f, "Response Score: {score:.3}"),
            ResponseScore::GpuOom => write!(f, "Response Score: GPU OOM"),
            ResponseScore::GpuError => write!(f, "Response Score: GPU Error"),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Score `answer` as a reply to `question` with a reward model.
pub fn score_qa(
    model: &ModelHandle,
    question: &str,
    answer: &str,
    budget: &TokenBudget,
    pool: &AcceleratorPool,
) -> Result<ResponseScore> {
    let question = trim_prompt(question, budget.cutoff_len);
    let answer = trim_prompt(answer, budget.cutoff_len);

    let classifier = model.classifier()?;
    let input_ids = model
        .tokenizer()?
        .encode_pair(question, answer, budget.max_length_tokenize)?;

    match classifier.classify(&input_ids) {
        Ok(logits) => match logits.first() {
            Some(logit) => Ok(ResponseScore::Value(sigmoid(*logit))),
            None => Err(RuntimeFault::Other("reward model returned no logits".into()).into()),
        },
        Err(fault @ RuntimeFault::OutOfMemory(_)) => {
            warn!(%question, %answer, error = %fault, "GPU OOM while scoring");
            pool.release();
            Ok(ResponseScore::GpuOom)
        }
        Err(
            fault @ (RuntimeFault::DeviceMismatch(_)
            | RuntimeFault::DtypeMismatch(_)
            | RuntimeFault::InvalidProbabilities(_)
            | RuntimeFault::KernelLibrary(_)),
        ) => {
            error!(%question, %answer, error = %fault, "GPU error while scoring");
            pool.release();
            Ok(ResponseScore::GpuError)
        }
        Err(fault) => Err(fault.into()),
    }
}
