use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::Tensor;
use candle_transformers::models::quantized_llama::ModelWeights;
use futures::StreamExt;
use llm_exec::{
    config::EngineConfig,
    gpu::{device_for, resolve_placement, HardwareInfo, PlacementRequest},
    model::{CandleDecoder, ForwardModel, HfTokenizer, ModelHandle},
    utils::{setup_logging, LogConfig},
    AcceleratorPool, EngineBuilder, GenerationRequest,
};
use tracing::info;

struct GgufLlama(ModelWeights);

impl ForwardModel for GgufLlama {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        self.0.forward(input, index_pos)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let weights = PathBuf::from(args.next().context("usage: simple_stream <model.gguf> <tokenizer.json>")?);
    let tokenizer_path = PathBuf::from(args.next().context("missing tokenizer.json path")?);

    let mut config = EngineConfig::default();
    config.model.base_model = weights.display().to_string();
    config.apply_env_overrides()?;

    // Initialize logging
    setup_logging(LogConfig::from(&config.monitoring))?;

    let hardware = HardwareInfo::detect();
    let plan = resolve_placement(&PlacementRequest::from_config(&config, &hardware, false), None);
    let device = device_for(plan.primary_target())?;

    info!("Loading {}", weights.display());
    let mut file = std::fs::File::open(&weights)?;
    let content = gguf_file::Content::read(&mut file)?;
    let model = ModelWeights::from_gguf(content, &mut file, &device)?;
    let tokenizer = Arc::new(HfTokenizer::from_file(&tokenizer_path, 4096)?);

    let decoder = Arc::new(CandleDecoder::new(GgufLlama(model), device.clone()));
    let handle = Arc::new(
        ModelHandle::decoder(config.model.base_model.clone(), decoder.clone(), tokenizer).with_device(device, plan),
    );
    let pool = AcceleratorPool::new();
    let cache_owner = decoder.clone();
    pool.register("kv-cache", move || cache_owner.clear_cache());
    let generator = Arc::new(
        EngineBuilder::new()
            .with_config(config.clone())
            .with_pool(pool)
            .build()?,
    );

    info!("Model loaded. Starting interaction loop...");
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let input = input.trim();
        if input == "exit" || input.is_empty() {
            break;
        }

        let request = GenerationRequest::from_defaults(&config.generation, input);
        let mut stream = Box::pin(generator.evaluate_stream(handle.clone(), request));
        let mut printed = 0;
        while let Some(snapshot) = stream.next().await {
            let snapshot = snapshot?;
            if let Some(delta) = snapshot.response.get(printed..) {
                print!("{delta}");
                std::io::stdout().flush()?;
            }
            printed = snapshot.response.len();
        }
        println!();
    }

    Ok(())
}
