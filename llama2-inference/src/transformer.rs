use crate::configuration::{ModelConfig, read_config};
use crate::layers::{FeedForward, Linear, MultiHeadAttention, RMSNorm, RunState, TokenEmbedding};
use crate::tensor::Tensor;
use crate::utils::MemoryMapper;
use anyhow::{Context, Result};
use std::fs::File;
use std::sync::Arc;

/// Main Transformer model implementing a decoder-only architecture:
///
/// - **Type**: Decoder-only transformer (autoregressive language model)
/// - **Attention**: Multi-head self-attention with Grouped Query Attention (GQA)
/// - **Position Encoding**: Rotary Position Embedding (RoPE)
/// - **Normalization**: RMSNorm applied before attention and FFN (pre-norm)
/// - **Activation**: SwiGLU in feed-forward networks
/// - **Classifier**: tied to the token embedding table
///
/// Weights are f32 views into one contiguous buffer owned by the model; the
/// KV cache and all scratch buffers live in [`RunState`], sized once from the
/// configuration.
pub struct Transformer {
    pub config: ModelConfig,
    token_embedding: TokenEmbedding,
    blocks: Vec<TransformerBlock>,
    final_norm: RMSNorm,
    lm_head: Linear,
    state: RunState,
}

impl Transformer {
    /// Forward pass through the transformer for autoregressive generation.
    ///
    /// Deterministic for fixed inputs and cache contents. Writes the key and
    /// value projections for `pos` into the cache and returns the logits over
    /// the vocabulary. The returned view aliases an internal buffer that is
    /// overwritten by the next call — consume it first.
    ///
    /// Panics if `token` or `pos` is out of range; invalid indices are
    /// contract violations, not recoverable errors.
    pub fn forward(&mut self, token: usize, pos: usize) -> &mut [f32] {
        assert!(
            token < self.config.vocab_size,
            "token id {} out of range (vocab_size {})",
            token,
            self.config.vocab_size
        );
        assert!(
            pos < self.config.seq_len,
            "position {} out of range (seq_len {})",
            pos,
            self.config.seq_len
        );

        // Token embedding
        self.token_embedding.forward(token, &mut self.state.x);

        // Process through transformer blocks
        for block in &self.blocks {
            block.forward(pos, &mut self.state);
        }

        // Final normalization
        self.final_norm.forward_inplace(&mut self.state.x);

        // Classification head (tied embedding weights)
        self.lm_head.forward(&mut self.state.logits, &self.state.x);

        &mut self.state.logits
    }

    pub fn get_config(&self) -> &ModelConfig {
        &self.config
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<'a, T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'a, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .finish()
    }
}

/// Transformer Block - Core decoder layer combining self-attention and feed-forward
///
/// **Structure** (pre-norm with residual connections):
/// ```text
/// x = x + Attention(RMSNorm(x))
/// x = x + FFN(RMSNorm(x))
/// ```
pub struct TransformerBlock {
    pub attn_norm: RMSNorm,
    pub attention: MultiHeadAttention,
    pub wo: Linear,
    pub ffn_norm: RMSNorm,
    pub feed_forward: FeedForward,
    pub layer_idx: usize,
}

impl TransformerBlock {
    pub fn new(
        attn_norm: RMSNorm,
        attention: MultiHeadAttention,
        wo: Linear,
        ffn_norm: RMSNorm,
        feed_forward: FeedForward,
        layer_idx: usize,
    ) -> Self {
        Self { attn_norm, attention, wo, ffn_norm, feed_forward, layer_idx }
    }

    fn forward(&self, pos: usize, state: &mut RunState) {
        // Attention block with residual connection
        self.attn_norm.forward(&mut state.xb, &state.x);
        self.attention.forward(pos, self.layer_idx, state);

        // Output projection, then residual add back into x
        self.wo.forward(&mut state.xb2, &state.xb);
        state.x.iter_mut().zip(state.xb2.iter()).for_each(|(x_val, &delta)| *x_val += delta);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(&mut state.xb, &state.x);
        self.feed_forward.forward(state);

        state.x.iter_mut().zip(state.xb.iter()).for_each(|(x_val, &delta)| *x_val += delta);
    }
}

impl std::fmt::Debug for TransformerBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("layer_idx", &self.layer_idx)
            .field("attn_norm", &self.attn_norm)
            .field("attention", &self.attention)
            .field("wo", &self.wo)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}

/// Builder pattern for creating transformer models from a checkpoint file.
pub struct TransformerBuilder {
    checkpoint_path: String,
    ctx_length: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(checkpoint_path: &str) -> Self {
        Self { checkpoint_path: checkpoint_path.to_string(), ctx_length: None }
    }

    /// Overrides the context window; clamped to the checkpoint's seq_len.
    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> Result<Transformer> {
        let file = File::open(&self.checkpoint_path)
            .with_context(|| format!("Failed to open checkpoint: {}", self.checkpoint_path))?;

        let mut mapper = MemoryMapper::new(file)?;

        // Read config from the first part of the file
        let mut config = read_config(&mut mapper)?;

        // The weight region length is fully determined by the config; reject
        // truncated or oversized files before touching any tensor
        let expected_bytes = config.checkpoint_bytes();
        if mapper.total_len() != expected_bytes {
            anyhow::bail!(
                "Checkpoint size mismatch: expected {} bytes for {:?}, file has {}",
                expected_bytes,
                config,
                mapper.total_len()
            );
        }

        let weights = Self::load_weights(&mut mapper, &config)?;
        debug_assert_eq!(mapper.remaining(), 0);

        // Apply context length override if provided (never grows the window)
        if let Some(ctx_len) = self.ctx_length {
            config.seq_len = ctx_len.min(config.seq_len);
        }

        // Initialize runtime state
        let state = RunState::new(&config);

        // Create transformer blocks
        let mut blocks = Vec::new();
        for layer_idx in 0..config.n_layers {
            let block = Self::create_transformer_block(&config, layer_idx, &weights);
            blocks.push(block);
        }

        // Create final normalization
        let final_norm = RMSNorm::new(weights.rms_final_weight.clone());

        // Create language model head: the classifier is the embedding table
        // used transposed, so it shares the same view
        let lm_head =
            Linear::new(weights.token_embedding_table.clone(), config.dim, config.vocab_size);

        // Create token embedding
        let token_embedding = TokenEmbedding::new(weights.token_embedding_table, config.dim);

        Ok(Transformer { config, token_embedding, blocks, final_norm, lm_head, state })
    }

    /// Loads all model weights from the checkpoint data.
    ///
    /// The weight region is materialized as one owned contiguous f32 buffer
    /// (converted from the file's little-endian order), then sliced into
    /// named tensor views without copying. Tensor order is fixed by the
    /// format; each per-layer array is contiguous across all layers.
    fn load_weights(mapper: &mut MemoryMapper, config: &ModelConfig) -> Result<TransformerWeights> {
        let ModelConfig { dim, n_layers, vocab_size, hidden_dim, .. } = *config;
        let kv_dim = config.kv_dim();

        let data = mapper
            .get_f32_buffer(config.n_weight_elements())
            .context("Failed to read weight data")?;
        let mut cursor = WeightCursor::new(data);

        let token_embedding_table = cursor
            .take(vocab_size * dim)
            .context("Failed to slice token embedding table")?;
        let rms_att_weight = cursor
            .take_layers(n_layers, dim)
            .context("Failed to slice attention normalization weights")?;
        let wq = cursor
            .take_layers(n_layers, dim * dim)
            .context("Failed to slice query projections")?;
        let wk = cursor
            .take_layers(n_layers, dim * kv_dim)
            .context("Failed to slice key projections")?;
        let wv = cursor
            .take_layers(n_layers, dim * kv_dim)
            .context("Failed to slice value projections")?;
        let wo = cursor
            .take_layers(n_layers, dim * dim)
            .context("Failed to slice output projections")?;
        let rms_ffn_weight = cursor
            .take_layers(n_layers, dim)
            .context("Failed to slice FFN normalization weights")?;
        let w1 = cursor
            .take_layers(n_layers, dim * hidden_dim)
            .context("Failed to slice FFN gate projections")?;
        let w2 = cursor
            .take_layers(n_layers, hidden_dim * dim)
            .context("Failed to slice FFN down projections")?;
        let w3 = cursor
            .take_layers(n_layers, dim * hidden_dim)
            .context("Failed to slice FFN up projections")?;
        let rms_final_weight =
            cursor.take(dim).context("Failed to slice final normalization weights")?;

        Ok(TransformerWeights {
            token_embedding_table,
            rms_att_weight,
            wq,
            wk,
            wv,
            wo,
            rms_ffn_weight,
            w1,
            w2,
            w3,
            rms_final_weight,
        })
    }

    fn create_transformer_block(
        model_config: &ModelConfig,
        layer_idx: usize,
        weights: &TransformerWeights,
    ) -> TransformerBlock {
        let dim = model_config.dim;
        let kv_dim = model_config.kv_dim();
        let hidden_dim = model_config.hidden_dim;

        let attn_norm = RMSNorm::new(weights.rms_att_weight[layer_idx].clone());

        // Attention projections
        let wq = Linear::new(weights.wq[layer_idx].clone(), dim, dim);
        let wk = Linear::new(weights.wk[layer_idx].clone(), dim, kv_dim);
        let wv = Linear::new(weights.wv[layer_idx].clone(), dim, kv_dim);
        let wo = Linear::new(weights.wo[layer_idx].clone(), dim, dim);

        let attention = MultiHeadAttention::new(wq, wk, wv, model_config);

        let ffn_norm = RMSNorm::new(weights.rms_ffn_weight[layer_idx].clone());

        // Feed-forward projections
        let w1 = Linear::new(weights.w1[layer_idx].clone(), dim, hidden_dim);
        let w2 = Linear::new(weights.w2[layer_idx].clone(), hidden_dim, dim);
        let w3 = Linear::new(weights.w3[layer_idx].clone(), dim, hidden_dim);

        let feed_forward = FeedForward::new(w1, w2, w3);

        TransformerBlock::new(attn_norm, attention, wo, ffn_norm, feed_forward, layer_idx)
    }
}

/// Sequential slicer over the shared weight buffer.
struct WeightCursor {
    data: Arc<[f32]>,
    offset: usize,
}

impl WeightCursor {
    fn new(data: Arc<[f32]>) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<Tensor> {
        let tensor = Tensor::new(self.data.clone(), self.offset, len)?;
        self.offset += len;
        Ok(tensor)
    }

    fn take_layers(&mut self, n_layers: usize, size_each: usize) -> Result<Vec<Tensor>> {
        (0..n_layers).map(|_| self.take(size_each)).collect()
    }
}

/// All learned parameters, as views into the single loaded weight buffer.
#[derive(Debug)]
struct TransformerWeights {
    /// Token embedding table, also used transposed as the classifier
    /// Shape: [vocab_size, dim]
    pub token_embedding_table: Tensor,

    /// RMS normalization weights for attention layers, one per layer
    /// Shape: [dim] each
    pub rms_att_weight: Vec<Tensor>,

    /// Query projections: [n_layers] × [dim, dim]
    pub wq: Vec<Tensor>,
    /// Key projections: [n_layers] × [dim, kv_dim]
    pub wk: Vec<Tensor>,
    /// Value projections: [n_layers] × [dim, kv_dim]
    pub wv: Vec<Tensor>,
    /// Output projections: [n_layers] × [dim, dim]
    pub wo: Vec<Tensor>,

    /// RMS normalization weights for feed-forward layers, one per layer
    /// Shape: [dim] each
    pub rms_ffn_weight: Vec<Tensor>,

    /// Gate projections: [n_layers] × [dim, hidden_dim]
    pub w1: Vec<Tensor>,
    /// Down projections: [n_layers] × [hidden_dim, dim]
    pub w2: Vec<Tensor>,
    /// Up projections: [n_layers] × [dim, hidden_dim]
    pub w3: Vec<Tensor>,

    /// Final RMS normalization weight before classification
    /// Shape: [dim]
    pub rms_final_weight: Tensor,
}
