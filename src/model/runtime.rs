// Location: src/model/runtime.rs

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::RuntimeFault;
use crate::model::{CausalLm, GenerateArgs, GenerateOutput, GenerationConfig, TokenSink};

/// One forward pass of a decoder-only network with an internal KV cache.
pub trait ForwardModel: Send {
    /// Logits for `input` of shape `(1, seq)` starting at `index_pos`.
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor>;

    fn clear_kv_cache(&mut self) {}
}

/// Token-by-token decoder over a candle model.
pub struct CandleDecoder<M> {
    model: Mutex<M>,
    device: Device,
}

impl<M: ForwardModel> CandleDecoder<M> {
    pub fn new(model: M, device: Device) -> Self {
        Self {
            model: Mutex::new(model),
            device,
        }
    }

    /// Drop the KV cache. Suitable as an accelerator release hook.
    pub fn clear_cache(&self) {
        self.model.lock().clear_kv_cache();
    }

    fn decode_one(
        &self,
        model: &mut M,
        processor: &mut LogitsProcessor,
        args: &GenerateArgs,
        mut sink: Option<&mut dyn TokenSink>,
        started: Instant,
    ) -> Result<Vec<u32>, RuntimeFault> {
        let config = &args.config;
        let eos = config.special_tokens.eos;
        let mut tokens = args.input_ids.clone();
        if let Some(sink) = sink.as_deref_mut() {
            sink.put(&tokens);
        }

        for index in 0..config.max_new_tokens {
            if sink.as_deref().is_some_and(|sink| sink.is_cancelled()) {
                debug!(generated = index, "Generation cancelled by consumer");
                break;
            }

            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len() - context_size;
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, start_pos)?;
            let logits = last_position(&logits)?.to_dtype(DType::F32)?;
            let logits = if config.repetition_penalty == 1.0 {
                logits
            } else {
                apply_repeat_penalty(&logits, config.repetition_penalty as f32, &tokens)?
            };
            let logits = prepare_logits(&logits, config, index)?;

            let next = processor.sample(&logits)?;
            tokens.push(next);
            if let Some(sink) = sink.as_deref_mut() {
                sink.put(&[next]);
            }

            if eos == Some(next) {
                break;
            }
            if args.stopping.as_ref().is_some_and(|stop| stop.should_stop(&tokens)) {
                debug!(generated = index + 1, "Stopping criteria met");
                break;
            }
            if config.max_time.is_some_and(|limit| started.elapsed() >= limit) {
                debug!(generated = index + 1, "Reached max_time");
                break;
            }
        }
        Ok(tokens)
    }
}

impl<M: ForwardModel> CausalLm for CandleDecoder<M> {
    fn generate(
        &self,
        args: &GenerateArgs,
        mut sink: Option<&mut dyn TokenSink>,
    ) -> Result<GenerateOutput, RuntimeFault> {
        if args.input_ids.is_empty() {
            return Err(RuntimeFault::Other("input_ids must not be empty".into()));
        }
        let config = &args.config;
        if config.num_beams > 1 {
            warn!(num_beams = config.num_beams, "Beam search unsupported, decoding a single beam");
        }
        let count = config.num_return_sequences.max(1);
        if count > 1 && sink.is_some() {
            debug!(count, "Streaming the first sequence only");
        }

        let started = Instant::now();
        let mut model = self.model.lock();
        let mut sequences = Vec::with_capacity(count);
        for i in 0..count {
            model.clear_kv_cache();
            let mut processor = LogitsProcessor::from_sampling(config.seed.wrapping_add(i as u64), sampling(config));
            let sink = if i == 0 { sink.as_mut().map(|s| &mut **s as &mut dyn TokenSink) } else { None };
            sequences.push(self.decode_one(&mut model, &mut processor, args, sink, started)?);
        }
        if let Some(sink) = sink {
            sink.end();
        }
        debug!(sequences = count, elapsed = ?started.elapsed(), "Generation finished");
        Ok(GenerateOutput { sequences })
    }
}

fn sampling(config: &GenerationConfig) -> Sampling {
    if !config.do_sample || config.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let temperature = config.temperature;
    let p = config.top_p;
    match (config.top_k, p < 1.0) {
        (0, false) => Sampling::All { temperature },
        (0, true) => Sampling::TopP { p, temperature },
        (k, false) => Sampling::TopK { k, temperature },
        (k, true) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

/// Logits for the last position, whatever batch/sequence dims the model
/// keeps.
fn last_position(logits: &Tensor) -> candle_core::Result<Tensor> {
    match logits.rank() {
        0 | 1 => Ok(logits.clone()),
        2 => logits.get(logits.dim(0)? - 1),
        _ => last_position(&logits.get(0)?),
    }
}

fn prepare_logits(logits: &Tensor, config: &GenerationConfig, generated: usize) -> Result<Tensor, RuntimeFault> {
    let mut values: Vec<f32> = logits.to_vec1()?;
    if config.remove_invalid_values {
        for value in values.iter_mut() {
            if value.is_nan() {
                *value = 0.0;
            } else if *value == f32::INFINITY {
                *value = f32::MAX;
            } else if *value == f32::NEG_INFINITY {
                *value = f32::MIN;
            }
        }
    }
    if generated < config.min_new_tokens {
        if let Some(eos) = config.special_tokens.eos {
            if let Some(value) = values.get_mut(eos as usize) {
                *value = f32::NEG_INFINITY;
            }
        }
    }
    let len = values.len();
    let prepared = Tensor::from_vec(values, len, logits.device())?;

    if config.do_sample {
        let total = candle_nn::ops::softmax_last_dim(&prepared)?
            .sum_all()?
            .to_scalar::<f32>()?;
        if !total.is_finite() {
            return Err(RuntimeFault::InvalidProbabilities(format!(
                "softmax sum {total} at step {generated}"
            )));
        }
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SequenceCollector, SpecialTokens};
    use crate::testing::ScriptedForward;
    use crate::types::{LengthControls, SamplingParams};
    use std::sync::Arc;

    const EOS: u32 = 9;

    fn args(input_ids: Vec<u32>, max_new_tokens: usize) -> GenerateArgs {
        let length = LengthControls {
            max_new_tokens,
            ..Default::default()
        };
        let special = SpecialTokens {
            eos: Some(EOS),
            ..Default::default()
        };
        let mut config = GenerationConfig::new(&SamplingParams::default(), &length, special);
        config.repetition_penalty = 1.0;
        GenerateArgs {
            input_ids,
            config,
            stopping: None,
        }
    }

    #[test]
    fn test_greedy_decode_stops_at_eos() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4, 5, EOS, 6]), Device::Cpu);
        let output = decoder.generate(&args(vec![1, 2], 16), None).unwrap();
        assert_eq!(output.sequences, vec![vec![1, 2, 4, 5, EOS]]);
    }

    #[test]
    fn test_max_new_tokens_bounds_decode() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4, 5, 6, 7]), Device::Cpu);
        let output = decoder.generate(&args(vec![1], 2), None).unwrap();
        assert_eq!(output.sequences[0], vec![1, 4, 5]);
    }

    #[test]
    fn test_min_new_tokens_masks_eos() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![EOS, 3, EOS]), Device::Cpu);
        let mut request = args(vec![1], 8);
        request.config.min_new_tokens = 1;
        let output = decoder.generate(&request, None).unwrap();
        assert_ne!(output.sequences[0][1], EOS);
    }

    #[test]
    fn test_sink_sees_prompt_then_tokens() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4, 5]), Device::Cpu);
        let mut collector = SequenceCollector::new();
        decoder.generate(&args(vec![1, 2], 2), Some(&mut collector)).unwrap();
        assert_eq!(collector.into_ids(), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_stopping_criteria_halt_decode() {
        struct StopAfter(usize);
        impl crate::model::StoppingCriteria for StopAfter {
            fn should_stop(&self, ids: &[u32]) -> bool {
                ids.len() >= self.0
            }
        }

        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4, 5, 6, 7]), Device::Cpu);
        let mut request = args(vec![1], 8);
        request.stopping = Some(Arc::new(StopAfter(3)));
        let output = decoder.generate(&request, None).unwrap();
        assert_eq!(output.sequences[0], vec![1, 4, 5]);
    }

    #[test]
    fn test_multiple_return_sequences() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4, EOS]), Device::Cpu);
        let mut request = args(vec![1], 4);
        request.config.num_return_sequences = 2;
        let output = decoder.generate(&request, None).unwrap();
        assert_eq!(output.sequences.len(), 2);
        assert_eq!(output.sequences[0], output.sequences[1]);
    }

    #[test]
    fn test_streaming_several_sequences_streams_the_first() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4, 5, EOS]), Device::Cpu);
        let mut request = args(vec![1], 4);
        request.config.num_return_sequences = 2;
        let mut collector = SequenceCollector::new();
        let output = decoder.generate(&request, Some(&mut collector)).unwrap();
        assert_eq!(output.sequences.len(), 2);
        assert_eq!(collector.into_ids(), output.sequences[0]);
    }

    #[test]
    fn test_nan_logits_without_removal_are_invalid() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4]).with_nan(), Device::Cpu);
        let mut request = args(vec![1], 4);
        request.config.do_sample = true;
        request.config.remove_invalid_values = false;
        let err = decoder.generate(&request, None).unwrap_err();
        assert!(matches!(err, RuntimeFault::InvalidProbabilities(_)));
    }

    #[test]
    fn test_empty_input_rejected() {
        let decoder = CandleDecoder::new(ScriptedForward::new(10, vec![4]), Device::Cpu);
        assert!(decoder.generate(&args(vec![], 4), None).is_err());
    }

    #[test]
    fn test_sampling_selection() {
        let mut config = args(vec![1], 1).config;
        assert!(matches!(sampling(&config), Sampling::ArgMax));
        config.do_sample = true;
        assert!(matches!(sampling(&config), Sampling::TopKThenTopP { k: 40, .. }));
        config.top_k = 0;
        config.top_p = 1.0;
        assert!(matches!(sampling(&config), Sampling::All { .. }));
    }
}
