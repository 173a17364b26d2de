use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorExt, Result};
use crate::gpu::{AcceleratorPool, ReleaseGuard};
use crate::model::{
    GenerateArgs, GenerationConfig, ModelHandle, ModelKind, SequenceCollector, TextStreamer, TokenSink,
};
use crate::processing::{
    compute_budget, fragment_pipe, run_guarded, trim_prompt, BridgePolicy, FaultContext, MemoryRestriction,
    OutcomeSlot, StopFlag, StreamingRun, Worker,
};
use crate::types::{GenerationRequest, ResponseSnapshot};

use super::fidelity::check_prompt_fidelity;
use super::output_log::OutputLog;
use super::{
    PromptInput, Prompter, RetrievalAnswer, RetrievalQuery, RetrievalStream, Retriever, StoppingCriteriaFactory,
    HUMAN_BOT_CONTEXT,
};

const WORKER_NAME: &str = "llm-exec-generate";

/// Generation orchestrator. One instance serves many `evaluate` calls; each
/// call owns its own [`Evaluation`].
pub struct Generator {
    pub(super) config: Arc<EngineConfig>,
    pub(super) prompter: Arc<dyn Prompter>,
    pub(super) stopping: Option<Arc<dyn StoppingCriteriaFactory>>,
    pub(super) retriever: Option<Arc<dyn Retriever>>,
    pub(super) pool: AcceleratorPool,
    pub(super) generate_lock: Arc<Mutex<()>>,
    pub(super) output_log: Option<Arc<OutputLog>>,
}

impl Generator {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &AcceleratorPool {
        &self.pool
    }

    pub fn output_log(&self) -> Option<&OutputLog> {
        self.output_log.as_deref()
    }

    fn policy(&self) -> BridgePolicy {
        BridgePolicy {
            raise_on_gpu_exceptions: self.config.runtime.raise_generate_gpu_exceptions,
        }
    }

    fn verbose(&self) -> bool {
        self.config.monitoring.verbose
    }

    /// Start one generation. Routing and prompt building happen here; the
    /// returned iterator does the rest, one snapshot at a time.
    pub fn evaluate<'a>(
        &'a self,
        model: Option<&'a ModelHandle>,
        request: &'a GenerationRequest,
    ) -> Result<Evaluation<'a>> {
        let started = Instant::now();
        let model = match model {
            Some(model) if !model.base_model.trim().is_empty() => model,
            _ => return Err(EngineError::no_model()),
        };
        if matches!(model.kind, ModelKind::Decoder(_) | ModelKind::Reward(_)) && model.tokenizer.is_none() {
            return Err(EngineError::no_model());
        }

        let (instruction, iinput) = request.routed_inputs();
        let context = if request.context.is_empty()
            && self.config.runtime.chat_context
            && request.prompt_type == "human_bot"
        {
            HUMAN_BOT_CONTEXT
        } else {
            request.context.as_str()
        };
        let prompt = self.prompter.build_prompt(&PromptInput {
            context,
            instruction,
            input: iinput,
            prompt_type: &request.prompt_type,
            prompt_dict: request.prompt_dict.as_deref(),
            chat: request.chat,
        });
        if self.verbose() {
            debug!(base_model = %model.base_model, prompt_chars = prompt.len(), "Pre-generate");
        }

        Ok(Evaluation {
            generator: self,
            model,
            request,
            instruction: instruction.to_string(),
            iinput: iinput.to_string(),
            prompt,
            state: State::Start,
            stop: StopFlag::new(),
            release: self.pool.guard(),
            persisted: None,
            finalized: false,
            started,
        })
    }
}

struct StreamingTask {
    run: StreamingRun,
    outputs: String,
    inputs_decoded: String,
}

enum State<'a> {
    Start,
    Retrieval {
        answers: RetrievalStream<'a>,
        last: Option<RetrievalAnswer>,
    },
    Direct,
    Streaming(StreamingTask),
    Done,
}

/// One in-flight generation, yielding cumulative response snapshots. The
/// last snapshot is the final answer.
///
/// Dropping an unfinished evaluation stops and joins its worker and
/// releases the accelerator caches.
pub struct Evaluation<'a> {
    generator: &'a Generator,
    model: &'a ModelHandle,
    request: &'a GenerationRequest,
    instruction: String,
    iinput: String,
    prompt: String,
    state: State<'a>,
    stop: StopFlag,
    release: ReleaseGuard,
    persisted: Option<String>,
    finalized: bool,
    started: Instant,
}

impl<'a> Evaluation<'a> {
    /// Prompt as built from the routed inputs, before any trimming.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Flag that cooperatively cancels a streaming generation.
    pub fn stop_handle(&self) -> StopFlag {
        self.stop.clone()
    }

    fn use_retrieval(&self) -> bool {
        let mode = self.request.retrieval.mode;
        let indexed = mode.uses_documents()
            && self
                .generator
                .retriever
                .as_ref()
                .is_some_and(|retriever| retriever.has_index(mode));
        indexed || self.model.is_local_engine()
    }

    fn start_retrieval(&self) -> Result<State<'a>> {
        let generator: &'a Generator = self.generator;
        let Some(retriever) = generator.retriever.as_deref() else {
            return Err(EngineError::Capability {
                model: self.model.base_model.clone(),
                capability: "retrieval",
            });
        };
        let query = if self.iinput.is_empty() {
            self.instruction.clone()
        } else {
            format!("{}\n{}", self.instruction, self.iinput)
        };
        let mode = self.request.retrieval.mode;
        debug!(%mode, query_chars = query.len(), "Running retrieval");
        let answers = retriever
            .run_retrieval(RetrievalQuery {
                query,
                mode,
                model: self.model,
                stream_output: self.request.stream_output,
                request: self.request,
                cut_distance: mode.cut_distance(),
            })
            .map_err(EngineError::Retrieval)?;
        Ok(State::Retrieval { answers, last: None })
    }

    fn step(&mut self) -> Result<Option<ResponseSnapshot>> {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Start => {
                    self.state = if self.use_retrieval() {
                        self.start_retrieval()?
                    } else {
                        State::Direct
                    };
                }
                State::Retrieval { mut answers, last } => match answers.next() {
                    Some(Ok(answer)) => {
                        let snapshot = ResponseSnapshot::with_sources(answer.text.clone(), answer.sources.clone());
                        self.state = State::Retrieval {
                            answers,
                            last: Some(answer),
                        };
                        return Ok(Some(snapshot));
                    }
                    Some(Err(err)) => return Err(EngineError::Retrieval(err)),
                    None => {
                        let text = last.map(|answer| answer.text).unwrap_or_default();
                        if !text.is_empty() || self.model.is_local_engine() {
                            if self.generator.verbose() {
                                debug!(decoded_output = text.len(), "Post-generate retrieval");
                            }
                            self.persisted = Some(text);
                            self.finalize();
                            return Ok(None);
                        }
                        debug!("Retrieval gave no answer, asking the model directly");
                        self.state = State::Direct;
                    }
                },
                State::Direct => {
                    if let Some(snapshot) = self.direct()? {
                        return Ok(Some(snapshot));
                    }
                }
                State::Streaming(mut task) => match task.run.next_fragment()? {
                    Some(fragment) => {
                        task.outputs.push_str(&fragment);
                        // Still echoing the prompt back.
                        if task.inputs_decoded.starts_with(task.outputs.as_str()) {
                            self.state = State::Streaming(task);
                            continue;
                        }
                        let response = self.generator.prompter.extract_response(
                            &task.outputs,
                            &task.inputs_decoded,
                            self.generator.config.runtime.sanitize_bot_response,
                        );
                        self.state = State::Streaming(task);
                        return Ok(Some(ResponseSnapshot::new(response)));
                    }
                    None => {
                        if self.generator.verbose() {
                            debug!(decoded_output = task.outputs.len(), outcome = ?task.run.outcome(), "Post-generate");
                        }
                        self.persisted = Some(task.outputs);
                        self.finalize();
                        return Ok(None);
                    }
                },
                State::Done => return Ok(None),
            }
        }
    }

    /// Generate without retrieval. Streaming requests move to the
    /// `Streaming` state and return `None`; everything else yields its
    /// single snapshot and finalizes.
    fn direct(&mut self) -> Result<Option<ResponseSnapshot>> {
        let generator = self.generator;
        let model = self.model;
        let runtime = &generator.config.runtime;
        let max_new_tokens = self.request.length.max_new_tokens;

        if let ModelKind::Pipeline { task, runner } = &model.kind {
            let ctx = FaultContext {
                prompt: self.prompt.clone(),
                inputs_decoded: self.prompt.clone(),
            };
            let _serialized = runtime.serialize_generation.then(|| generator.generate_lock.lock());
            let response = run_guarded(
                || runner.run_task(*task, &self.prompt, max_new_tokens),
                &ctx,
                generator.policy(),
                &self.release,
            )?
            .unwrap_or_default();
            self.persisted = Some(response.clone());
            self.finalize();
            return Ok(Some(ResponseSnapshot::new(response)));
        }

        let lm = self.model.causal_lm()?.clone();
        let tokenizer = self.model.tokenizer()?.clone();
        let model_max_length = tokenizer.model_max_length();

        let level = MemoryRestriction::try_from(runtime.memory_restriction_level)?;
        let budget = compute_budget(level, model_max_length);
        let prompt = trim_prompt(&self.prompt, budget.max_prompt_length);
        let mut input_ids = tokenizer.encode(prompt, true)?;
        let max_input_tokens = model_max_length.saturating_sub(max_new_tokens);
        if max_input_tokens == 0 {
            warn!(model_max_length, max_new_tokens, "No room left for input tokens, keeping the whole prompt");
        } else if input_ids.len() > max_input_tokens {
            let excess = input_ids.len() - max_input_tokens;
            debug!(dropped = excess, kept = max_input_tokens, "Truncating input ids from the front");
            input_ids.drain(..excess);
        }

        let fidelity = check_prompt_fidelity(tokenizer.as_ref(), &input_ids, prompt)?;

        let mut special_tokens = tokenizer.special_tokens();
        if self.model.base_model.to_lowercase().contains("gpt2") {
            special_tokens.pad = special_tokens.eos;
        }
        let mut config = GenerationConfig::new(&self.request.sampling, &self.request.length, special_tokens);
        if self.request.chat {
            config.num_return_sequences = 1;
        }
        let stopping = generator.stopping.as_ref().and_then(|factory| {
            factory.build(
                &self.request.prompt_type,
                self.request.prompt_dict.as_deref(),
                &tokenizer,
                &self.model.device,
                model_max_length,
            )
        });
        let args = GenerateArgs {
            input_ids,
            config,
            stopping,
        };
        let ctx = FaultContext {
            prompt: fidelity.prompt.clone(),
            inputs_decoded: fidelity.inputs_decoded.clone(),
        };
        if generator.verbose() {
            debug!(input_ids = args.input_ids.len(), fidelity = ?fidelity.matched, "Mid-generate");
        }

        let sanitize = runtime.sanitize_bot_response;
        if self.request.stream_output {
            let (sender, stream) = fragment_pipe(runtime.pipe_capacity, runtime.poll_interval, self.stop.clone());
            let mut streamer = TextStreamer::new(tokenizer, fidelity.decode_options, sender);
            let slot = OutcomeSlot::new();
            let policy = generator.policy();
            let release = self.release.clone();
            let lock = generator.generate_lock.clone();
            let serialize = runtime.serialize_generation;
            let worker = Worker::spawn(WORKER_NAME, slot.clone(), move || {
                let _serialized = serialize.then(|| lock.lock());
                let started = Instant::now();
                let result = run_guarded(
                    || lm.generate(&args, Some(&mut streamer as &mut dyn TokenSink)).map(|_| ()),
                    &ctx,
                    policy,
                    &release,
                );
                debug!(elapsed = ?started.elapsed(), "Generation call returned");
                result
            })?;
            self.state = State::Streaming(StreamingTask {
                run: StreamingRun::new(stream, worker, slot),
                outputs: String::new(),
                inputs_decoded: fidelity.inputs_decoded,
            });
            return Ok(None);
        }

        let mut collector = SequenceCollector::new();
        let result = {
            let _serialized = runtime.serialize_generation.then(|| generator.generate_lock.lock());
            run_guarded(
                || lm.generate(&args, Some(&mut collector as &mut dyn TokenSink)),
                &ctx,
                generator.policy(),
                &self.release,
            )
        };
        let sequences = match result? {
            Some(output) => output.sequences,
            None => {
                info!("Generation abandoned, answering with the partial sequence");
                vec![collector.into_ids()]
            }
        };

        let mut decoded = Vec::with_capacity(sequences.len());
        for sequence in &sequences {
            decoded.push(self.model.tokenizer()?.decode(sequence, fidelity.decode_options)?);
        }
        let response = decoded
            .iter()
            .map(|output| generator.prompter.extract_response(output, &fidelity.inputs_decoded, sanitize))
            .collect::<Vec<_>>()
            .join("\n");
        self.persisted = decoded.first().map(|first| format!("{}{first}", fidelity.prompt));
        if generator.verbose() {
            debug!(sequences = decoded.len(), response_chars = response.len(), "Post-generate");
        }
        self.finalize();
        Ok(Some(ResponseSnapshot::new(response)))
    }

    /// Join the worker, release the accelerator caches, then persist.
    /// Idempotent.
    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.state = State::Done;
        self.release.release();
        if let (Some(log), Some(output)) = (self.generator.output_log.as_deref(), self.persisted.take()) {
            if !output.is_empty() {
                log.persist(&output, &self.model.base_model);
            }
        }
        if self.generator.verbose() {
            debug!(elapsed = ?self.started.elapsed(), "Evaluation finished");
        }
    }
}

impl Iterator for Evaluation<'_> {
    type Item = Result<ResponseSnapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(snapshot)) => Some(Ok(snapshot)),
            Ok(None) => {
                self.finalize();
                None
            }
            Err(err) => {
                if err.is_recoverable() {
                    debug!(error = %err, "Evaluation ended early");
                } else {
                    warn!(base_model = %self.model.base_model, error = %err, "Evaluation failed");
                }
                self.finalize();
                Some(Err(err))
            }
        }
    }
}

impl Drop for Evaluation<'_> {
    fn drop(&mut self) {
        self.finalize();
    }
}
