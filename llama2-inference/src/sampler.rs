use crate::layers::softmax;

/// Stores a probability and its associated index (token id).
#[derive(Clone, Debug)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Top-p/temperature sampler for language model logits.
///
/// Implements greedy argmax, temperature-scaled multinomial sampling, and
/// top-p (nucleus) sampling, driven by a seedable xorshift64* RNG for
/// reproducibility. Carries mutable sequential state (RNG, sort scratch) —
/// do not share one instance across concurrent sample calls.
#[derive(Debug)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    topp: f32,
    rng_state: u64,
}

impl Sampler {
    /// Creates a new sampler with the given vocabulary size, temperature,
    /// top-p, and RNG seed.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - Temperature for sampling (0.0 for greedy decoding)
    /// * `topp` - Top-p threshold; values outside (0, 1) disable nucleus sampling
    /// * `rng_seed` - Random seed for reproducibility
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        assert!(vocab_size > 0, "Vocab size must be positive");
        assert!(temperature >= 0.0, "Temperature must be non-negative");
        assert!((0.0..=1.0).contains(&topp), "Top-p must be between 0.0 and 1.0");

        Self {
            probindex: vec![ProbIndex { prob: 0.0, index: 0 }; vocab_size],
            temperature,
            topp,
            rng_state: rng_seed,
        }
    }

    /// xorshift64* random number generator; mutates the RNG state.
    pub fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1) with 24 bits of precision.
    pub fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Returns the index of the maximum logit (greedy decoding).
    /// Ties are broken by first occurrence.
    fn sample_argmax(logits: &[f32]) -> usize {
        let mut max_i = 0;
        let mut max_p = f32::NEG_INFINITY;
        for (i, &p) in logits.iter().enumerate() {
            if p > max_p {
                max_i = i;
                max_p = p;
            }
        }
        max_i
    }

    /// Multinomial sampling from a probability distribution (must sum to 1).
    /// `coin` is a random number in [0, 1).
    fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probabilities.len().saturating_sub(1) // in case of rounding errors
    }

    /// Top-p (nucleus) sampling: sample from the smallest set of tokens whose
    /// cumulative probability exceeds `topp`, so very unlikely tokens are
    /// never picked.
    fn sample_topp(&mut self, probabilities: &[f32], coin: f32) -> usize {
        // Tokens below this cannot be part of the nucleus, so the sort can
        // skip them entirely
        let cutoff = (1.0 - self.topp) / (probabilities.len().saturating_sub(1).max(1)) as f32;
        let mut n0 = 0;

        for (i, &prob) in probabilities.iter().enumerate() {
            if prob >= cutoff {
                self.probindex[n0] = ProbIndex { prob, index: i };
                n0 += 1;
            }
        }

        // Sort candidates by probability (descending); equal probabilities
        // have no defined order
        self.probindex[..n0].sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob));

        // Truncate where cumulative probability first exceeds topp
        let mut cumulative_prob = 0.0;
        let mut last_idx = n0.saturating_sub(1);
        for i in 0..n0 {
            cumulative_prob += self.probindex[i].prob;
            if cumulative_prob > self.topp {
                last_idx = i;
                break;
            }
        }

        // Sample from the truncated, renormalized list
        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for i in 0..=last_idx {
            cdf += self.probindex[i].prob;
            if r < cdf {
                return self.probindex[i].index;
            }
        }
        self.probindex[last_idx].index // rounding fallback
    }

    /// Samples a token index from logits using temperature and top-p.
    /// The logits are consumed: scaled and softmax-normalized in place.
    ///
    /// - Temperature 0 returns the argmax (greedy), ignoring the RNG.
    /// - Otherwise one uniform draw selects from the temperature-scaled
    ///   softmax distribution, optionally truncated by top-p.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        if self.temperature == 0.0 {
            Self::sample_argmax(logits)
        } else {
            // Apply temperature
            for logit in logits.iter_mut() {
                *logit /= self.temperature;
            }

            softmax(logits);

            let coin = self.random_f32();

            if self.topp <= 0.0 || self.topp >= 1.0 {
                Self::sample_mult(logits, coin)
            } else {
                self.sample_topp(logits, coin)
            }
        }
    }
}
