use crate::configuration::ModelConfig;
use crate::tensor::{Tensor, matmul};
use rayon::prelude::*;

/// Epsilon value for numerical stability in normalization
const EPSILON: f32 = 1e-5;

/// Base frequency for RoPE (Rotary Position Embedding)
const ROPE_BASE_FREQ: f32 = 10000.0;

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Purpose**: Maps discrete vocabulary tokens to continuous vector space
/// **Shape**: [vocab_size, dim]
/// **Note**: Shared with the output classifier (weight tying)
pub struct TokenEmbedding {
    pub embedding_table: Tensor,
    pub dim: usize,
}

impl TokenEmbedding {
    pub fn new(embedding_table: Tensor, dim: usize) -> Self {
        Self { embedding_table, dim }
    }

    pub fn forward(&self, token: usize, output: &mut [f32]) {
        let start_idx = token * self.dim;
        let end_idx = start_idx + self.dim;
        output[..self.dim].copy_from_slice(&self.embedding_table.as_slice()[start_idx..end_idx]);
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.embedding_table.len() / self.dim))
            .finish()
    }
}

/// RMS Layer Normalization - alternative to LayerNorm used in modern LLMs
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
///
/// **Advantages over LayerNorm**:
/// - Computationally simpler (no mean subtraction)
/// - Scale-covariant: rmsnorm(k·x, w) == rmsnorm(x, w) for k > 0
pub struct RMSNorm {
    pub weight: Tensor,
}

impl RMSNorm {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let sum_of_squares = input.iter().map(|&x| x * x).sum::<f32>();
        let rms_norm_factor = 1.0f32 / ((sum_of_squares / input.len() as f32) + EPSILON).sqrt();

        output
            .iter_mut()
            .zip(input.iter())
            .zip(self.weight.as_slice().iter())
            .for_each(|((out, &inp), &w)| {
                *out = w * (rms_norm_factor * inp);
            });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let sum_of_squares = x.iter().map(|&val| val * val).sum::<f32>();
        let rms_norm_factor = 1.0f32 / ((sum_of_squares / x.len() as f32) + EPSILON).sqrt();

        x.iter_mut().zip(self.weight.as_slice().iter()).for_each(|(val, &w)| {
            *val = w * (rms_norm_factor * *val);
        });
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).finish()
    }
}

/// Rotary Position Embedding (RoPE) - relative position encoding mechanism
///
/// Rotates adjacent dimension pairs (2j, 2j+1) of the query/key vectors by a
/// position- and frequency-dependent angle `pos / 10000^(2j/head_size)`,
/// injecting relative position information without a learned position table.
pub struct RoPE {
    pub head_size: usize,
}

impl RoPE {
    pub fn new(head_size: usize) -> Self {
        Self { head_size }
    }

    /// Precomputes (cos, sin) per dimension pair for one position.
    pub fn compute_freqs(&self, pos: usize) -> Vec<(f32, f32)> {
        (0..self.head_size / 2)
            .map(|pair_idx| {
                let freq =
                    ROPE_BASE_FREQ.powf(-((2 * pair_idx) as f32) / self.head_size as f32);
                let angle = pos as f32 * freq;
                (angle.cos(), angle.sin())
            })
            .collect()
    }

    /// Rotates one head's worth of values in place. Dimensions are paired
    /// interleaved: (0,1), (2,3), ...
    pub fn apply(&self, head_slice: &mut [f32], freqs: &[(f32, f32)]) {
        debug_assert_eq!(head_slice.len(), self.head_size);

        head_slice
            .chunks_exact_mut(2)
            .zip(freqs.iter())
            .for_each(|(pair, &(cos_freq, sin_freq))| {
                let v0 = pair[0];
                let v1 = pair[1];
                pair[0] = v0 * cos_freq - v1 * sin_freq;
                pair[1] = v0 * sin_freq + v1 * cos_freq;
            });
    }
}

impl std::fmt::Debug for RoPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoPE").field("head_size", &self.head_size).finish()
    }
}

/// Dense linear layer over an f32 weight view.
pub struct Linear {
    pub weight: Tensor,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(weight: Tensor, in_features: usize, out_features: usize) -> Self {
        debug_assert_eq!(weight.len(), in_features * out_features);
        Self { weight, in_features, out_features }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        matmul(output, input, self.weight.as_slice(), self.in_features, self.out_features);
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA) optimization
///
/// **Architecture Details**:
/// - **Standard MHA**: n_heads query heads, n_heads key heads, n_heads value heads
/// - **GQA**: n_heads query heads, n_kv_heads key/value heads (n_kv_heads <= n_heads)
/// - **Memory Efficiency**: Reduces KV cache size by sharing key/value heads
///
/// **Components**:
/// - **Q, K, V Projections**: Linear transformations to query, key, value spaces
/// - **RoPE**: Rotary position embedding applied to queries and keys
/// - **Scaled Dot-Product Attention**: softmax(QK^T / sqrt(head_size))V over
///   the cached positions [0, pos] — causality holds by construction, no mask
///
/// Key/value projections for the current position are written straight into
/// the cache rows at [layer, pos]; earlier rows are only ever read.
pub struct MultiHeadAttention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub rope: RoPE,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_size: usize,
    pub kv_mul: usize,
    pub seq_len: usize,
}

impl MultiHeadAttention {
    pub fn new(wq: Linear, wk: Linear, wv: Linear, config: &ModelConfig) -> Self {
        Self {
            wq,
            wk,
            wv,
            rope: RoPE::new(config.head_size()),
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_size: config.head_size(),
            kv_mul: config.kv_mul(),
            seq_len: config.seq_len,
        }
    }

    /// Runs attention for one position. Reads the normalized activations in
    /// `state.xb` and overwrites them with the per-head attention outputs.
    pub fn forward(&self, pos: usize, layer_idx: usize, state: &mut RunState) {
        let kv_dim = self.n_kv_heads * self.head_size;
        let kv_cache_offset = layer_idx * self.seq_len * kv_dim;
        let current_pos_offset = kv_cache_offset + pos * kv_dim;

        // Compute Q, K, V projections; K and V land directly in the cache
        // rows for this (layer, pos)
        self.wq.forward(&mut state.q, &state.xb);
        self.wk.forward(
            &mut state.key_cache[current_pos_offset..current_pos_offset + kv_dim],
            &state.xb,
        );
        self.wv.forward(
            &mut state.value_cache[current_pos_offset..current_pos_offset + kv_dim],
            &state.xb,
        );

        // Rotate queries (all heads) and the freshly written keys (kv heads)
        let rope_freqs = self.rope.compute_freqs(pos);
        for head_idx in 0..self.n_heads {
            let q_range = head_idx * self.head_size..(head_idx + 1) * self.head_size;
            self.rope.apply(&mut state.q[q_range], &rope_freqs);
        }
        for head_idx in 0..self.n_kv_heads {
            let k_range = current_pos_offset + head_idx * self.head_size
                ..current_pos_offset + (head_idx + 1) * self.head_size;
            self.rope.apply(&mut state.key_cache[k_range], &rope_freqs);
        }

        self.compute_attention(pos, kv_cache_offset, state);
    }

    fn compute_attention(&self, pos: usize, kv_cache_offset: usize, state: &mut RunState) {
        let attention_scale = (self.head_size as f32).sqrt().recip();
        let kv_dim = self.n_kv_heads * self.head_size;

        state
            .att
            .par_chunks_mut(self.seq_len)
            .zip(state.xb.par_chunks_mut(self.head_size))
            .zip((0..self.n_heads).into_par_iter())
            .for_each(|((att_slice, xb_slice), head_idx)| {
                let q_range = head_idx * self.head_size..(head_idx + 1) * self.head_size;
                let kv_head_idx = head_idx / self.kv_mul;

                // Scores against every cached timestep up to and including pos
                let att_head = &mut att_slice[0..=pos];

                att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                    let k_cache_start =
                        kv_cache_offset + time_step * kv_dim + kv_head_idx * self.head_size;
                    let k_cache_end = k_cache_start + self.head_size;

                    *att_score = state.q[q_range.clone()]
                        .iter()
                        .zip(&state.key_cache[k_cache_start..k_cache_end])
                        .map(|(&q, &k)| q * k)
                        .sum::<f32>()
                        * attention_scale;
                });

                softmax(att_head);

                // Attention-weighted sum of the cached values
                xb_slice.fill(0.0);
                for time_step in 0..=pos {
                    let v_cache_start =
                        kv_cache_offset + time_step * kv_dim + kv_head_idx * self.head_size;
                    let v_cache_end = v_cache_start + self.head_size;
                    let attention_weight = att_head[time_step];

                    xb_slice
                        .iter_mut()
                        .zip(&state.value_cache[v_cache_start..v_cache_end])
                        .for_each(|(out, &value)| *out += attention_weight * value);
                }
            });
    }
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_size", &self.head_size)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// **Formula**: SwiGLU(x) = SiLU(W1·x) ⊙ (W3·x), projected back by W2,
/// where SiLU(v) = v · sigmoid(v).
pub struct FeedForward {
    pub w1: Linear, // Gate projection
    pub w2: Linear, // Down projection
    pub w3: Linear, // Up projection
}

impl FeedForward {
    pub fn new(w1: Linear, w2: Linear, w3: Linear) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads the normalized activations in `state.xb` and overwrites them
    /// with the FFN output.
    pub fn forward(&self, state: &mut RunState) {
        // Gate and up projections
        self.w1.forward(&mut state.hb, &state.xb);
        self.w3.forward(&mut state.hb2, &state.xb);

        // SwiGLU non-linearity
        state.hb.iter_mut().zip(state.hb2.iter()).for_each(|(gate_val, &linear_val)| {
            let silu_output = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
            *gate_val = silu_output * linear_val;
        });

        // Down projection
        self.w2.forward(&mut state.xb, &state.hb);
    }
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}

/// Applies numerically-stable softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

/// Runtime state for transformer inference.
///
/// This structure contains all the temporary buffers and caches needed
/// during model execution. Buffers are pre-allocated once from the model
/// configuration and never grow; the KV cache starts zeroed.
///
/// Mutated only by the forward pass — never share one instance across
/// concurrent calls.
#[derive(Debug)]
pub struct RunState {
    /// Primary activation buffer for current layer input
    /// Shape: [dim]
    pub x: Vec<f32>,

    /// Secondary activation buffer (normalized input, attention/FFN output)
    /// Shape: [dim]
    pub xb: Vec<f32>,

    /// Tertiary activation buffer for residual connections
    /// Shape: [dim]
    pub xb2: Vec<f32>,

    /// Hidden state buffer for feed-forward computations
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,

    /// Secondary hidden buffer for FFN gate operations
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,

    /// Query buffer for attention computation
    /// Shape: [dim]
    pub q: Vec<f32>,

    /// Attention weights buffer
    /// Shape: [n_heads, seq_len]
    pub att: Vec<f32>,

    /// Final output logits over vocabulary
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,

    /// Key-Value cache for efficient autoregressive generation
    /// Keys: [n_layers, seq_len, kv_dim]
    pub key_cache: Vec<f32>,
    /// Values: [n_layers, seq_len, kv_dim]
    pub value_cache: Vec<f32>,
}

impl RunState {
    /// Creates a new runtime state with pre-allocated buffers based on model configuration.
    pub fn new(config: &ModelConfig) -> Self {
        let ModelConfig { dim, hidden_dim, vocab_size, seq_len, n_layers, n_heads, .. } = *config;

        let kv_dim = config.kv_dim();

        Self {
            // Core activation buffers
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],

            // FFN buffers
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],

            // Attention-specific buffers
            q: vec![0.0; dim],
            att: vec![0.0; n_heads * seq_len],

            // Output buffer
            logits: vec![0.0; vocab_size],

            // KV cache for autoregressive generation
            key_cache: vec![0.0; n_layers * seq_len * kv_dim],
            value_cache: vec![0.0; n_layers * seq_len * kv_dim],
        }
    }
}
