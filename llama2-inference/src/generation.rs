use crate::sampler::Sampler;
use crate::tokenizer::{BOS_TOKEN_ID, EOS_TOKEN_ID, Tokenizer};
use crate::transformer::Transformer;
use anyhow::Result;
use log::info;
use std::io::{self, Write};
use std::time::Instant;

/// Receives decoded text pieces as they are produced during generation.
pub trait PieceSink {
    fn write_piece(&mut self, piece: &str) -> Result<()>;
}

/// Prints pieces to stdout, flushing after each one for incremental display.
///
/// A piece consisting of a single unprintable raw byte (from byte-fallback
/// tokens) is suppressed rather than written to the terminal.
pub struct StdoutSink;

impl PieceSink for StdoutSink {
    fn write_piece(&mut self, piece: &str) -> Result<()> {
        let bytes = piece.as_bytes();
        if bytes.len() == 1 && !(bytes[0].is_ascii_graphic() || bytes[0].is_ascii_whitespace()) {
            return Ok(());
        }

        print!("{piece}");
        io::stdout().flush()?;
        Ok(())
    }
}

/// Collects pieces into an owned string.
#[derive(Default)]
pub struct StringSink(pub String);

impl PieceSink for StringSink {
    fn write_piece(&mut self, piece: &str) -> Result<()> {
        self.0.push_str(piece);
        Ok(())
    }
}

/// Lifecycle of a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Encoding,
    Generating,
    Stopped,
    Exhausted,
}

/// How a completed session ended: a BOS/EOS stop token, or the step limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Stopped,
    Exhausted,
}

/// One autoregressive generation request.
///
/// Composes tokenizer, transformer, and sampler into the token loop: prompt
/// tokens are teacher-forced, subsequent tokens are sampled from the logits,
/// and every decoded piece is handed to the sink. The session owns the
/// position counter and enforces the context-length guard; the forward pass
/// itself treats an out-of-range position as a contract violation.
pub struct GenerationSession<'a, S: PieceSink> {
    transformer: &'a mut Transformer,
    tokenizer: &'a mut Tokenizer,
    sampler: &'a mut Sampler,
    sink: &'a mut S,
    step_limit: usize,
    state: SessionState,
    metrics: TokenMetrics,
}

impl<'a, S: PieceSink> GenerationSession<'a, S> {
    /// Creates a session. `step_limit` is clamped to `seq_len - 1` so the
    /// position can never reach the context length.
    pub fn new(
        transformer: &'a mut Transformer,
        tokenizer: &'a mut Tokenizer,
        sampler: &'a mut Sampler,
        sink: &'a mut S,
        step_limit: Option<usize>,
    ) -> Self {
        let max_steps = transformer.get_config().seq_len - 1;
        let step_limit = step_limit.unwrap_or(max_steps).min(max_steps);

        Self {
            transformer,
            tokenizer,
            sampler,
            sink,
            step_limit,
            state: SessionState::Idle,
            metrics: TokenMetrics::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the autoregressive loop until a stop token or the step limit.
    ///
    /// Fails without starting generation if the prompt encodes to zero
    /// tokens.
    pub fn run(&mut self, prompt: &str) -> Result<SessionOutcome> {
        self.state = SessionState::Encoding;
        let prompt_tokens = self.tokenizer.encode(prompt, true, false);
        if prompt_tokens.is_empty() {
            self.state = SessionState::Idle;
            anyhow::bail!("Prompt produced no tokens");
        }

        self.state = SessionState::Generating;
        let mut pos = 0;
        let mut token = prompt_tokens[0];

        while pos < self.step_limit {
            let logits = self.transformer.forward(token, pos);

            let next = if pos + 1 < prompt_tokens.len() {
                // Still teacher-forcing the prompt
                prompt_tokens[pos + 1]
            } else {
                self.metrics.start_generation();
                let next = self.sampler.sample(logits);
                self.metrics.increment_token();
                next
            };

            pos += 1;

            if next == BOS_TOKEN_ID || next == EOS_TOKEN_ID {
                self.state = SessionState::Stopped;
                self.metrics.report_and_reset();
                return Ok(SessionOutcome::Stopped);
            }

            let piece = self.tokenizer.decode(token, next);
            self.sink.write_piece(&piece)?;

            token = next;
        }

        self.state = SessionState::Exhausted;
        self.metrics.report_and_reset();
        Ok(SessionOutcome::Exhausted)
    }
}

/// Tracks token generation performance metrics
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report_and_reset(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                info!(
                    "Generated {} tokens in {:.2}s - {:.2} tokens/sec",
                    self.generated_count,
                    duration.as_secs_f64(),
                    tps
                );
            }
        }
        self.generated_count = 0;
    }
}
