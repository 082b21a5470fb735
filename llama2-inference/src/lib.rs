//! Inference engine for llama2-format model checkpoints.
//!
//! Loads a binary checkpoint and vocabulary, encodes a prompt with BPE, runs
//! the decoder-only transformer forward pass token by token over a growing
//! KV cache, and samples the continuation until a stop token or the step
//! limit.

pub mod configuration;
pub mod generation;
pub mod layers;
pub mod sampler;
pub mod tensor;
pub mod tokenizer;
pub mod transformer;
mod utils;

use anyhow::Result;
use log::debug;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::generation::{GenerationSession, SessionOutcome, StdoutSink};
use crate::sampler::Sampler;
use crate::tokenizer::Tokenizer;
use crate::transformer::TransformerBuilder;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: String,
    pub tokenizer_path: String,
    pub temperature: f32,
    pub topp: f32,
    pub steps: Option<usize>,
    pub ctx_length: Option<usize>,
    pub prompt: Option<String>,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<String>,
    tokenizer_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    steps: Option<usize>,
    ctx_length: Option<usize>,
    prompt: Option<String>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn tokenizer_path(mut self, path: Option<&String>) -> Self {
        self.tokenizer_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        Ok(InferenceConfig {
            checkpoint_path: self.checkpoint_path.ok_or("checkpoint_path is required")?,
            tokenizer_path: self.tokenizer_path.unwrap_or_else(|| "tokenizer.bin".to_string()),
            temperature: self.temperature.unwrap_or(1.0),
            topp: self.topp.unwrap_or(0.9),
            steps: self.steps,
            ctx_length: self.ctx_length,
            prompt: self.prompt,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_secs())
                    .unwrap_or(0)
            }),
        })
    }
}

/// Runs inference: loads model and vocabulary, generates from the prompt,
/// and streams pieces to stdout.
pub fn run_inference(inference_config: InferenceConfig) -> Result<SessionOutcome> {
    debug!("{inference_config:#?}");

    let mut transformer = TransformerBuilder::new(&inference_config.checkpoint_path)
        .with_ctx_length(inference_config.ctx_length)
        .build()?;

    debug!("{transformer:#?}");

    let config = transformer.get_config();
    let vocab_size = config.vocab_size;

    let mut tokenizer = Tokenizer::new(&inference_config.tokenizer_path, vocab_size)?;

    debug!("{tokenizer:#?}");

    let mut sampler = Sampler::new(
        vocab_size,
        inference_config.temperature,
        inference_config.topp,
        inference_config.seed,
    );

    let prompt = inference_config.prompt.as_deref().unwrap_or("");
    let mut sink = StdoutSink;

    let mut session = GenerationSession::new(
        &mut transformer,
        &mut tokenizer,
        &mut sampler,
        &mut sink,
        inference_config.steps,
    );

    let outcome = session.run(prompt)?;
    println!();

    Ok(outcome)
}
