//! Tokenizer for byte-level BPE language models.
//!
//! - Loads vocabulary and merge scores from a binary file.
//! - Encodes text into token IDs with greedy codepoint lookup, byte fallback,
//!   and iterative best-scoring-pair BPE merges.
//! - Decodes token IDs back to text pieces, handling raw-byte tokens and the
//!   SentencePiece leading-space convention.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::borrow::Cow;
use std::fs::File;
use std::io::Read;

/// Reserved beginning-of-sequence token ID.
pub const BOS_TOKEN_ID: usize = 1;
/// Reserved end-of-sequence token ID.
pub const EOS_TOKEN_ID: usize = 2;
/// Reserved unknown token ID; raw byte `b` falls back to id `b + 3`.
pub const UNK_TOKEN_ID: usize = 3;

/// Offset separating raw-byte fallback ids from the reserved ids 0..=2.
const BYTE_FALLBACK_OFFSET: usize = 3;

/// Tokenizer for byte-level BPE models.
///
/// Holds the vocabulary and merge scores. The string-sorted lookup index is
/// built lazily on the first encode call; a scratch buffer for candidate
/// merges is reused across calls.
pub struct Tokenizer {
    /// Vocabulary: each token is a byte sequence (not necessarily valid UTF-8)
    vocab: Vec<Vec<u8>>,
    /// Merge scores for BPE merges (higher is better)
    vocab_scores: Vec<f32>,
    /// Number of tokens in the vocabulary
    vocab_size: usize,
    /// Maximum token length (in bytes)
    max_token_length: u32,
    /// Vocabulary ids sorted by token bytes, for binary-search lookup.
    /// Built lazily on first encode.
    sorted_vocab: Option<Vec<usize>>,
    /// Scratch for merge candidates, sized 2*max_token_length + 3
    merge_buffer: Vec<u8>,
}

impl Tokenizer {
    /// Loads a tokenizer from a vocabulary file.
    ///
    /// File layout: one little-endian u32 (max token length), then
    /// `vocab_size` entries of (f32 score, i32 byte length, raw bytes).
    pub fn new(tokenizer_path: &str, vocab_size: usize) -> Result<Self> {
        let file = File::open(tokenizer_path)
            .with_context(|| format!("Failed to open tokenizer: {tokenizer_path}"))?;
        Self::from_reader(std::io::BufReader::new(file), vocab_size)
    }

    /// Loads the vocabulary from any byte source.
    pub fn from_reader<R: Read>(mut reader: R, vocab_size: usize) -> Result<Self> {
        let max_token_length = reader
            .read_u32::<LittleEndian>()
            .context("Failed to read max token length")?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut vocab_scores = Vec::with_capacity(vocab_size);

        // Read vocabulary: (score, length, bytes) for each token
        for i in 0..vocab_size {
            let score = reader
                .read_f32::<LittleEndian>()
                .with_context(|| format!("Failed to read score for token {i}"))?;
            vocab_scores.push(score);

            let len = reader
                .read_i32::<LittleEndian>()
                .with_context(|| format!("Failed to read length for token {i}"))?;
            if len < 0 {
                anyhow::bail!("Negative length {len} for token {i}");
            }

            let mut token_bytes = vec![0u8; len as usize];
            reader
                .read_exact(&mut token_bytes)
                .with_context(|| format!("Failed to read bytes for token {i}"))?;
            vocab.push(token_bytes);
        }

        Ok(Self {
            vocab,
            vocab_scores,
            vocab_size,
            max_token_length,
            sorted_vocab: None,
            merge_buffer: Vec::with_capacity(2 * max_token_length as usize + 3),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Decodes a token ID to a text piece (may be a lone raw byte that is
    /// not valid UTF-8 on its own).
    ///
    /// Out-of-range ids decode to the empty string. Following the BOS token,
    /// a leading space is stripped (SentencePiece prints a decorative space
    /// after BOS); afterwards, `<0xHH>` byte literals are replaced with the
    /// single byte they name.
    pub fn decode(&self, prev_token: usize, token: usize) -> Cow<'_, str> {
        let Some(piece) = self.vocab.get(token) else {
            return Cow::Borrowed("");
        };
        let mut piece: &[u8] = piece;

        if prev_token == BOS_TOKEN_ID && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }

        if let Some(byte_val) = parse_byte_literal(piece) {
            // SAFETY: a raw byte piece may be an incomplete UTF-8 sequence
            // (e.g. part of a multi-byte codepoint emitted via byte
            // fallback). The exact byte must be preserved so that adjacent
            // pieces concatenate back into valid text.
            return Cow::Owned(unsafe { String::from_utf8_unchecked(vec![byte_val]) });
        }

        match std::str::from_utf8(piece) {
            Ok(valid_str) => Cow::Borrowed(valid_str),
            Err(_) => {
                // SAFETY: same reasoning as above — vocabulary entries can
                // hold partial UTF-8 sequences that only combine into valid
                // text across pieces.
                let string = unsafe { String::from_utf8_unchecked(piece.to_vec()) };
                Cow::Owned(string)
            }
        }
    }

    /// Encodes a string into a sequence of token IDs using BPE.
    ///
    /// 1. Optionally prepends BOS; non-empty text also gets the dummy-prefix
    ///    space token (SentencePiece convention), or `<unk>` if the
    ///    vocabulary has no space token.
    /// 2. Scans the raw bytes, grouping UTF-8 continuation bytes (up to 4)
    ///    into codepoint candidates looked up exactly in the vocabulary;
    ///    unknown codepoints fall back to one id per raw byte, offset by 3.
    /// 3. Repeatedly merges the adjacent pair whose concatenation resolves
    ///    to the vocabulary entry with the strictly highest merge score
    ///    (first occurrence wins ties), until no pair resolves. Quadratic in
    ///    the token count, which is fine for prompt-sized inputs.
    /// 4. Optionally appends EOS.
    pub fn encode(&mut self, text: &str, bos: bool, eos: bool) -> Vec<usize> {
        self.ensure_sorted_vocab();

        let mut tokens = Vec::new();

        if bos {
            tokens.push(BOS_TOKEN_ID);
        }

        // add_dummy_prefix is true by default
        if !text.is_empty() {
            let dummy_prefix = self.str_lookup(b" ").unwrap_or(UNK_TOKEN_ID);
            tokens.push(dummy_prefix);
        }

        // Greedy codepoint pass over the raw byte sequence
        let bytes = text.as_bytes();
        let mut codepoint = Vec::with_capacity(4);
        for (i, &byte) in bytes.iter().enumerate() {
            // A non-continuation byte starts a fresh codepoint
            if byte & 0xC0 != 0x80 {
                codepoint.clear();
            }
            codepoint.push(byte);

            // Keep accumulating while the next byte continues this codepoint
            let next_is_continuation =
                bytes.get(i + 1).is_some_and(|&next| next & 0xC0 == 0x80);
            if next_is_continuation && codepoint.len() < 4 {
                continue;
            }

            match self.str_lookup(&codepoint) {
                Some(id) => tokens.push(id),
                None => {
                    // Byte fallback: one token per raw byte
                    tokens.extend(codepoint.iter().map(|&b| b as usize + BYTE_FALLBACK_OFFSET));
                }
            }
            codepoint.clear();
        }

        self.merge_tokens(&mut tokens);

        if eos {
            tokens.push(EOS_TOKEN_ID);
        }

        tokens
    }

    /// Merges tokens based on scores as long as any adjacent pair
    /// concatenates to a known vocabulary entry.
    fn merge_tokens(&mut self, tokens: &mut Vec<usize>) {
        let mut merge_buffer = std::mem::take(&mut self.merge_buffer);

        loop {
            let mut best_score = -1e10;
            let mut best: Option<(usize, usize)> = None; // (merged id, position)

            for i in 0..tokens.len().saturating_sub(1) {
                merge_buffer.clear();
                merge_buffer.extend_from_slice(&self.vocab[tokens[i]]);
                merge_buffer.extend_from_slice(&self.vocab[tokens[i + 1]]);

                if let Some(id) = self.str_lookup(&merge_buffer) {
                    if self.vocab_scores[id] > best_score {
                        best_score = self.vocab_scores[id];
                        best = Some((id, i));
                    }
                }
            }

            let Some((id, idx)) = best else {
                break; // no more mergeable pairs
            };

            tokens[idx] = id;
            tokens.remove(idx + 1);
        }

        self.merge_buffer = merge_buffer;
    }

    /// Builds the string-sorted lookup index on first use.
    fn ensure_sorted_vocab(&mut self) {
        if self.sorted_vocab.is_none() {
            let mut sorted: Vec<usize> = (0..self.vocab_size).collect();
            sorted.sort_unstable_by(|&a, &b| self.vocab[a].cmp(&self.vocab[b]));
            self.sorted_vocab = Some(sorted);
        }
    }

    /// Finds the exact match for a byte string in the vocabulary via binary
    /// search over the sorted index. Requires `ensure_sorted_vocab`.
    fn str_lookup(&self, bytes: &[u8]) -> Option<usize> {
        let sorted = self
            .sorted_vocab
            .as_deref()
            .expect("sorted vocabulary must be built before lookup");

        sorted
            .binary_search_by(|&id| self.vocab[id].as_slice().cmp(bytes))
            .ok()
            .map(|i| sorted[i])
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size)
            .field("max_token_length", &self.max_token_length)
            .finish_non_exhaustive()
    }
}

/// Parses a raw byte token of the form `<0xHH>`, returning the byte value.
fn parse_byte_literal(piece: &[u8]) -> Option<u8> {
    match piece {
        [b'<', b'0', b'x', hi, lo, b'>'] => {
            let hi = (*hi as char).to_digit(16)?;
            let lo = (*lo as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        }
        _ => None,
    }
}
