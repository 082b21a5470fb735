mod common;

use byteorder::{LittleEndian, WriteBytesExt};
use common::{passthrough_weights, patterned_weights, write_checkpoint};
use llama2_inference::configuration::{HEADER_SIZE, ModelConfig};
use llama2_inference::layers::RunState;
use llama2_inference::transformer::{Transformer, TransformerBuilder};
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

fn small_config() -> ModelConfig {
    ModelConfig {
        dim: 8,
        hidden_dim: 16,
        n_layers: 2,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 16,
        seq_len: 8,
    }
}

fn write_raw_header(path: &Path, values: [i32; 7]) {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(path).unwrap());
    for value in values {
        writer.write_i32::<LittleEndian>(value).unwrap();
    }
    writer.flush().unwrap();
}

fn build_patterned(dir: &Path) -> Transformer {
    let path = dir.join("model.bin");
    let config = small_config();
    write_checkpoint(&path, &config, &patterned_weights(&config));
    TransformerBuilder::new(path.to_str().unwrap()).build().unwrap()
}

#[test]
fn checkpoint_size_is_computable_from_the_header() {
    let config = small_config();
    // embeddings 128, norms 16+16+8, wq 128, wk 64, wv 64, wo 128,
    // w1/w2/w3 256 each
    assert_eq!(config.n_weight_elements(), 1320);
    assert_eq!(config.checkpoint_bytes(), HEADER_SIZE + 1320 * 4);
}

#[test]
fn derived_dimensions_follow_the_gqa_layout() {
    let config = small_config();
    assert_eq!(config.head_size(), 4);
    assert_eq!(config.kv_dim(), 4);
    assert_eq!(config.kv_mul(), 2);
}

#[test]
fn builder_loads_a_well_formed_checkpoint() {
    let dir = TempDir::new().unwrap();
    let transformer = build_patterned(dir.path());

    let loaded = transformer.get_config();
    assert_eq!(loaded.dim, 8);
    assert_eq!(loaded.n_layers, 2);
    assert_eq!(loaded.vocab_size, 16);
    assert_eq!(loaded.seq_len, 8);
}

#[test]
fn builder_rejects_a_size_mismatched_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    let config = small_config();
    write_checkpoint(&path, &config, &patterned_weights(&config));

    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();

    // truncated by one f32
    file.set_len((config.checkpoint_bytes() - 4) as u64).unwrap();
    assert!(TransformerBuilder::new(path.to_str().unwrap()).build().is_err());

    // oversized by one f32
    file.set_len((config.checkpoint_bytes() + 4) as u64).unwrap();
    assert!(TransformerBuilder::new(path.to_str().unwrap()).build().is_err());
}

#[test]
fn builder_rejects_non_positive_dimensions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    write_raw_header(&path, [0, 16, 1, 2, 1, 8, 8]);
    assert!(TransformerBuilder::new(path.to_str().unwrap()).build().is_err());
}

#[test]
fn builder_rejects_an_invalid_head_layout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    // dim not divisible by n_heads
    write_raw_header(&path, [10, 16, 1, 3, 1, 8, 8]);
    assert!(TransformerBuilder::new(path.to_str().unwrap()).build().is_err());

    // n_heads not divisible by n_kv_heads
    write_raw_header(&path, [12, 16, 1, 4, 3, 8, 8]);
    assert!(TransformerBuilder::new(path.to_str().unwrap()).build().is_err());
}

#[test]
fn builder_rejects_a_missing_file() {
    assert!(TransformerBuilder::new("/nonexistent/model.bin").build().is_err());
}

#[test]
fn context_override_shrinks_but_never_grows_the_window() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    let config = small_config();
    write_checkpoint(&path, &config, &patterned_weights(&config));

    let shrunk = TransformerBuilder::new(path.to_str().unwrap())
        .with_ctx_length(Some(4))
        .build()
        .unwrap();
    assert_eq!(shrunk.get_config().seq_len, 4);

    let capped = TransformerBuilder::new(path.to_str().unwrap())
        .with_ctx_length(Some(100))
        .build()
        .unwrap();
    assert_eq!(capped.get_config().seq_len, 8);
}

#[test]
fn run_state_buffers_are_sized_and_zeroed() {
    let config = small_config();
    let state = RunState::new(&config);

    assert_eq!(state.x.len(), 8);
    assert_eq!(state.hb.len(), 16);
    assert_eq!(state.att.len(), 2 * 8);
    assert_eq!(state.logits.len(), 16);
    assert_eq!(state.key_cache.len(), 2 * 8 * 4);
    assert_eq!(state.value_cache.len(), 2 * 8 * 4);
    assert!(state.key_cache.iter().all(|&v| v == 0.0));
    assert!(state.value_cache.iter().all(|&v| v == 0.0));
}

#[test]
fn forward_with_zeroed_projections_reduces_to_the_tied_classifier() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    let config = small_config();
    let dim = config.dim;

    let embedding: Vec<f32> =
        (0..config.vocab_size * dim).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect();
    write_checkpoint(&path, &config, &passthrough_weights(&config, &embedding));

    let mut transformer = TransformerBuilder::new(path.to_str().unwrap()).build().unwrap();
    let token = 5;
    let logits = transformer.forward(token, 0).to_vec();

    // zero projections leave the residual stream equal to the embedding row,
    // so each logit is dot(e_i, rmsnorm(e_token))
    let row = &embedding[token * dim..(token + 1) * dim];
    let mean_sq = row.iter().map(|&v| v * v).sum::<f32>() / dim as f32;
    let factor = 1.0 / (mean_sq + 1e-5).sqrt();
    for (i, &logit) in logits.iter().enumerate() {
        let expected: f32 = embedding[i * dim..(i + 1) * dim]
            .iter()
            .zip(row.iter())
            .map(|(&e, &r)| e * r * factor)
            .sum();
        assert!((logit - expected).abs() < 1e-4, "logit {i}: {logit} vs {expected}");
    }
}

#[test]
fn forward_is_deterministic_for_the_same_inputs() {
    let dir = TempDir::new().unwrap();
    let mut a = build_patterned(dir.path());
    let mut b = build_patterned(dir.path());

    let first = a.forward(3, 0).to_vec();
    let second = b.forward(3, 0).to_vec();
    assert_eq!(first, second);
}

#[test]
fn later_cache_rows_do_not_affect_earlier_positions() {
    let dir = TempDir::new().unwrap();
    let mut reference = build_patterned(dir.path());
    let mut polluted = build_patterned(dir.path());

    reference.forward(3, 0);
    let expected = reference.forward(4, 1).to_vec();

    // fill cache rows beyond the positions under test with unrelated tokens
    polluted.forward(3, 0);
    polluted.forward(9, 5);
    polluted.forward(9, 6);
    let actual = polluted.forward(4, 1).to_vec();

    assert_eq!(expected, actual);
}

#[test]
#[should_panic(expected = "position")]
fn forward_panics_on_an_out_of_range_position() {
    let dir = TempDir::new().unwrap();
    let mut transformer = build_patterned(dir.path());
    transformer.forward(0, 8);
}

#[test]
#[should_panic(expected = "token id")]
fn forward_panics_on_an_out_of_range_token() {
    let dir = TempDir::new().unwrap();
    let mut transformer = build_patterned(dir.path());
    transformer.forward(16, 0);
}
