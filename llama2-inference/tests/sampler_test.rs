use llama2_inference::sampler::Sampler;

const SEED: u64 = 1234;

#[test]
fn rng_sequence_is_reproducible() {
    let mut sampler = Sampler::new(4, 1.0, 0.9, SEED);

    // xorshift64* outputs for seed 1234
    let expected: [u32; 6] =
        [3159758022, 1306163061, 1764681998, 1393191135, 4206814034, 754954053];
    for value in expected {
        assert_eq!(sampler.random_u32(), value);
    }
}

#[test]
fn rng_floats_are_deterministic_and_in_unit_interval() {
    let mut first = Sampler::new(4, 1.0, 0.9, SEED);
    assert_eq!(first.random_f32(), (3159758022u32 >> 8) as f32 / 16777216.0);

    let mut a = Sampler::new(4, 1.0, 0.9, SEED);
    let mut b = Sampler::new(4, 1.0, 0.9, SEED);
    for _ in 0..100 {
        let x = a.random_f32();
        assert!((0.0..1.0).contains(&x));
        assert_eq!(x, b.random_f32());
    }
}

#[test]
fn greedy_picks_max_and_breaks_ties_by_first_index() {
    let mut sampler = Sampler::new(5, 0.0, 0.9, SEED);
    let mut logits = vec![0.1, 0.5, 0.3, 0.5, 0.2];
    assert_eq!(sampler.sample(&mut logits), 1);
}

#[test]
fn greedy_ignores_the_seed() {
    for seed in [1u64, 42, SEED, u64::MAX] {
        let mut sampler = Sampler::new(4, 0.0, 0.9, seed);
        let mut logits = vec![-1.0, 2.0, 0.5, 1.9];
        assert_eq!(sampler.sample(&mut logits), 1);
    }
}

#[test]
fn nucleus_sampling_never_picks_the_excluded_tail() {
    // softmax([10, 8, -20, -20]) puts ~0.88 on index 0; with topp = 0.5 the
    // nucleus is exactly {0}
    let mut sampler = Sampler::new(4, 1.0, 0.5, SEED);
    for _ in 0..200 {
        let mut logits = vec![10.0, 8.0, -20.0, -20.0];
        assert_eq!(sampler.sample(&mut logits), 0);
    }
}

#[test]
fn nucleus_sampling_is_reproducible_for_a_seed() {
    let draw = |seed: u64| -> Vec<usize> {
        let mut sampler = Sampler::new(8, 0.8, 0.9, seed);
        (0..20)
            .map(|_| {
                let mut logits = vec![0.1, 0.7, 0.2, 0.9, 0.4, 0.3, 0.8, 0.6];
                sampler.sample(&mut logits)
            })
            .collect()
    };

    let indices = draw(SEED);
    assert_eq!(indices, draw(SEED));
    assert!(indices.iter().all(|&i| i < 8));
}

#[test]
fn disabled_topp_falls_back_to_plain_multinomial() {
    // topp values outside (0, 1) both take the unrestricted multinomial path
    let mut high = Sampler::new(6, 1.0, 1.0, SEED);
    let mut low = Sampler::new(6, 1.0, 0.0, SEED);
    for _ in 0..50 {
        let mut a = vec![0.3, 1.2, -0.4, 0.9, 0.0, 2.0];
        let mut b = a.clone();
        assert_eq!(high.sample(&mut a), low.sample(&mut b));
    }
}

#[test]
fn sampling_normalizes_logits_in_place() {
    let mut sampler = Sampler::new(4, 1.0, 1.0, SEED);
    let mut logits = vec![1.0, 2.0, 3.0, 4.0];
    sampler.sample(&mut logits);

    assert!((logits.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    assert!(logits.iter().all(|&p| p >= 0.0));
    // monotone logits stay monotone after softmax
    assert!(logits.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn temperature_flattens_the_distribution() {
    let mut sharp = Sampler::new(3, 0.5, 1.0, SEED);
    let mut flat = Sampler::new(3, 2.0, 1.0, SEED);

    let mut a = vec![1.0, 2.0, 3.0];
    let mut b = a.clone();
    sharp.sample(&mut a);
    flat.sample(&mut b);

    assert!(a[2] > b[2]);
    assert!(a[0] < b[0]);
}
