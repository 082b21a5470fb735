//! Shared helpers for building synthetic checkpoints and vocabularies.

#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use llama2_inference::configuration::ModelConfig;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes a checkpoint file: 7 little-endian i32 header fields followed by
/// the weight region as little-endian f32 values.
pub fn write_checkpoint(path: &Path, config: &ModelConfig, weights: &[f32]) {
    assert_eq!(weights.len(), config.n_weight_elements());

    let mut writer = BufWriter::new(File::create(path).unwrap());
    let header = [
        config.dim,
        config.hidden_dim,
        config.n_layers,
        config.n_heads,
        config.n_kv_heads,
        config.vocab_size,
        config.seq_len,
    ];
    for value in header {
        writer.write_i32::<LittleEndian>(value as i32).unwrap();
    }
    for &weight in weights {
        writer.write_f32::<LittleEndian>(weight).unwrap();
    }
    writer.flush().unwrap();
}

/// Writes a vocabulary file: u32 max token length, then per token a f32
/// score, i32 byte length, and the raw token bytes.
pub fn write_vocab(path: &Path, entries: &[(f32, Vec<u8>)]) {
    let max_len = entries.iter().map(|(_, bytes)| bytes.len()).max().unwrap_or(0) as u32;

    let mut writer = BufWriter::new(File::create(path).unwrap());
    writer.write_u32::<LittleEndian>(max_len).unwrap();
    for (score, bytes) in entries {
        writer.write_f32::<LittleEndian>(*score).unwrap();
        writer.write_i32::<LittleEndian>(bytes.len() as i32).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.flush().unwrap();
}

/// Builds a llama2-shaped vocabulary: ids 0..=2 are the reserved
/// `<unk>`/`<s>`/`</s>` tokens, ids 3..=258 the `<0xHH>` byte literals, and
/// the given custom tokens follow starting at id [`FIRST_CUSTOM_ID`].
pub fn base_vocab(customs: &[(&str, f32)]) -> Vec<(f32, Vec<u8>)> {
    let mut entries = vec![
        (0.0, b"<unk>".to_vec()),
        (0.0, b"<s>".to_vec()),
        (0.0, b"</s>".to_vec()),
    ];
    for byte in 0u16..=255 {
        entries.push((-1e6, format!("<0x{byte:02X}>").into_bytes()));
    }
    for &(text, score) in customs {
        entries.push((score, text.as_bytes().to_vec()));
    }
    entries
}

/// First token id assigned to custom entries by [`base_vocab`].
pub const FIRST_CUSTOM_ID: usize = 259;

/// Weight region where every projection matrix is zero and every norm weight
/// is one. The residual stream then carries the embedding row unchanged, so
/// the logits reduce to the tied classifier applied to the normalized
/// embedding.
pub fn passthrough_weights(config: &ModelConfig, embedding: &[f32]) -> Vec<f32> {
    assert_eq!(embedding.len(), config.vocab_size * config.dim);

    let ModelConfig { dim, hidden_dim, n_layers, .. } = *config;
    let kv_dim = config.kv_dim();

    let mut weights = Vec::with_capacity(config.n_weight_elements());
    weights.extend_from_slice(embedding);
    weights.extend(std::iter::repeat(1.0).take(n_layers * dim)); // attention norms
    weights.extend(std::iter::repeat(0.0).take(n_layers * dim * dim)); // wq
    weights.extend(std::iter::repeat(0.0).take(n_layers * dim * kv_dim)); // wk
    weights.extend(std::iter::repeat(0.0).take(n_layers * dim * kv_dim)); // wv
    weights.extend(std::iter::repeat(0.0).take(n_layers * dim * dim)); // wo
    weights.extend(std::iter::repeat(1.0).take(n_layers * dim)); // FFN norms
    weights.extend(std::iter::repeat(0.0).take(n_layers * dim * hidden_dim)); // w1
    weights.extend(std::iter::repeat(0.0).take(n_layers * hidden_dim * dim)); // w2
    weights.extend(std::iter::repeat(0.0).take(n_layers * dim * hidden_dim)); // w3
    weights.extend(std::iter::repeat(1.0).take(dim)); // final norm

    assert_eq!(weights.len(), config.n_weight_elements());
    weights
}

/// Deterministic non-trivial weight region, small enough in magnitude to
/// keep activations well-conditioned.
pub fn patterned_weights(config: &ModelConfig) -> Vec<f32> {
    (0..config.n_weight_elements()).map(|i| ((i % 13) as f32 - 6.0) * 0.05).collect()
}
