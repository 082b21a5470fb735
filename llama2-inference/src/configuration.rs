use std::io::Cursor;

use crate::utils::MemoryMapper;
use anyhow::{Context, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};

/// Size of the checkpoint header in bytes (7 i32 fields).
pub const HEADER_SIZE: usize = 28;

/// Configuration struct for transformer models.
///
/// All fields are fixed at load time and immutable afterwards; every buffer
/// in the engine is sized from these values.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
}

impl ModelConfig {
    /// Dimension of a single attention head.
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Combined dimension of the key/value heads (< dim under GQA).
    pub fn kv_dim(&self) -> usize {
        (self.dim * self.n_kv_heads) / self.n_heads
    }

    /// How many query heads share one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Total number of f32 weight elements in the checkpoint, in the fixed
    /// tensor order: token embeddings, per-layer attention norms, wq, wk, wv,
    /// wo, FFN norms, w1, w2, w3, final norm. The classifier is tied to the
    /// embedding table and stores no extra elements.
    pub fn n_weight_elements(&self) -> usize {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, .. } = *self;
        let kv_dim = self.kv_dim();

        vocab_size * dim                  // token_embedding_table
            + n_layers * dim              // rms_att_weight
            + n_layers * dim * dim        // wq
            + n_layers * dim * kv_dim     // wk
            + n_layers * dim * kv_dim     // wv
            + n_layers * dim * dim        // wo
            + n_layers * dim              // rms_ffn_weight
            + n_layers * dim * hidden_dim // w1
            + n_layers * hidden_dim * dim // w2
            + n_layers * dim * hidden_dim // w3
            + dim // rms_final_weight
    }

    /// Exact expected checkpoint file size in bytes. Computable before any
    /// weight allocation; the loader rejects files whose length differs.
    pub fn checkpoint_bytes(&self) -> usize {
        HEADER_SIZE + self.n_weight_elements() * std::mem::size_of::<f32>()
    }
}

/// Raw header values as stored on disk.
#[derive(Debug, Clone, Copy)]
struct RawConfig {
    pub dim: i32,
    pub hidden_dim: i32,
    pub n_layers: i32,
    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub vocab_size: i32,
    pub seq_len: i32,
}

impl TryInto<ModelConfig> for RawConfig {
    type Error = Error;

    fn try_into(self) -> Result<ModelConfig> {
        validate_config(&self).with_context(|| "Invalid model configuration")?;

        Ok(ModelConfig {
            dim: self.dim as usize,
            hidden_dim: self.hidden_dim as usize,
            n_layers: self.n_layers as usize,
            n_heads: self.n_heads as usize,
            n_kv_heads: self.n_kv_heads as usize,
            vocab_size: self.vocab_size as usize,
            seq_len: self.seq_len as usize,
        })
    }
}

/// Reads and validates the model configuration from checkpoint data (mapper).
///
/// The configuration is stored as 7 consecutive i32 values in little-endian
/// format; values are byte-order-converted on hosts where that differs.
pub(crate) fn read_config(mapper: &mut MemoryMapper) -> Result<ModelConfig> {
    let data = mapper.get_bytes(HEADER_SIZE)?;

    let mut cursor = Cursor::new(data);

    // Use a macro to reduce repetitive error handling
    macro_rules! read_i32 {
        ($field:literal) => {
            cursor
                .read_i32::<LittleEndian>()
                .with_context(|| format!("Failed to read {}", $field))?
        };
    }

    let config = RawConfig {
        dim: read_i32!("dimension"),
        hidden_dim: read_i32!("hidden dimension"),
        n_layers: read_i32!("number of layers"),
        n_heads: read_i32!("number of heads"),
        n_kv_heads: read_i32!("number of KV heads"),
        vocab_size: read_i32!("vocabulary size"),
        seq_len: read_i32!("sequence length"),
    };

    config.try_into()
}

/// Validates the model configuration to ensure it's supported.
fn validate_config(config: &RawConfig) -> Result<()> {
    // Validate positive dimensions
    let dimensions = [
        ("dim", config.dim),
        ("hidden_dim", config.hidden_dim),
        ("n_layers", config.n_layers),
        ("n_heads", config.n_heads),
        ("n_kv_heads", config.n_kv_heads),
        ("vocab_size", config.vocab_size),
        ("seq_len", config.seq_len),
    ];

    for (name, value) in dimensions {
        if value <= 0 {
            anyhow::bail!("Invalid {}: must be positive, got {}", name, value);
        }
    }

    if config.dim % config.n_heads != 0 {
        anyhow::bail!(
            "Invalid head layout: dim {} is not divisible by n_heads {}",
            config.dim,
            config.n_heads
        );
    }

    if config.n_heads % config.n_kv_heads != 0 {
        anyhow::bail!(
            "Invalid GQA layout: n_heads {} is not divisible by n_kv_heads {}",
            config.n_heads,
            config.n_kv_heads
        );
    }

    Ok(())
}
