//! Integration tests for the decoders using scripted mock decoders.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::Distribution;
use rand::SeedableRng;
use sketch_decode::mocks::{mock_encoder_output, MockState, ScriptedDecoder};
use sketch_decode::{
    batched_beam_search, monte_carlo_sample, naive_beam_search, Candidates, DecodeConfig,
    DecodeStrategy, Memory, SearchParams, StepDecoder,
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const SOS: usize = 0;
const EOS: usize = 1;

fn params(width: usize, max_len: usize) -> SearchParams {
    SearchParams { width, max_len, sos: SOS, eos: EOS }
}

fn host(t: burn::tensor::Tensor<TestBackend, 2>) -> Vec<f32> {
    t.into_data().to_vec().unwrap()
}

// ---------------------------------------------------------------------------
// Batched beam search agrees with per-example beam search
// ---------------------------------------------------------------------------

#[test]
fn test_batched_matches_naive() {
    let device = Default::default();
    for seed in 0..6u64 {
        for width in 1..=4 {
            let decoder = ScriptedDecoder::random(7, SOS, EOS, seed);
            let enc = mock_encoder_output::<TestBackend>(3, &device);
            let p = params(width, 6);

            let naive = naive_beam_search(&decoder, &enc, &p).unwrap();
            let batched = batched_beam_search(&decoder, &enc, &p).unwrap();

            assert_eq!(naive.tokens, batched.tokens, "seed={seed} width={width}");
            assert_eq!(batched.log_probs.dims(), [3, width]);
            for (a, b) in host(naive.log_probs).iter().zip(host(batched.log_probs).iter()) {
                assert!((a - b).abs() < 1e-4, "seed={seed} width={width}: {a} vs {b}");
            }
        }
    }
}

#[test]
fn test_batched_examples_are_independent() {
    // Decoding an example alone gives the same beams as decoding it in a batch.
    let device = Default::default();
    let decoder = ScriptedDecoder::random(6, SOS, EOS, 42);
    let p = params(3, 5);

    let batch = batched_beam_search(&decoder, &mock_encoder_output::<TestBackend>(4, &device), &p)
        .unwrap();
    let alone = batched_beam_search(&decoder, &mock_encoder_output::<TestBackend>(1, &device), &p)
        .unwrap();
    assert_eq!(batch.tokens[0], alone.tokens[0]);
}

#[test]
fn test_beam_scores_descending() {
    let device = Default::default();
    let decoder = ScriptedDecoder::random(8, SOS, EOS, 9);
    let enc = mock_encoder_output::<TestBackend>(2, &device);
    let cands = batched_beam_search(&decoder, &enc, &params(4, 7)).unwrap();
    let lp = host(cands.log_probs);
    for row in lp.chunks(4) {
        assert!(row.windows(2).all(|w| w[0] >= w[1] - 1e-6), "{row:?}");
    }
}

// ---------------------------------------------------------------------------
// Early stop
// ---------------------------------------------------------------------------

#[test]
fn test_batched_stops_after_one_step_when_all_emit_eos() {
    let device = Default::default();
    let decoder = ScriptedDecoder::eos_always(5, EOS);
    let enc = mock_encoder_output::<TestBackend>(3, &device);

    let cands = batched_beam_search(&decoder, &enc, &params(1, 20)).unwrap();

    assert_eq!(decoder.calls(), 1);
    assert_eq!(cands.tokens, vec![vec![Vec::<usize>::new()]; 3]);
    for lp in host(cands.log_probs) {
        assert!((lp - 0.9f32.ln()).abs() < 1e-5);
    }
}

#[test]
fn test_naive_stops_after_one_step_per_example() {
    let device = Default::default();
    let decoder = ScriptedDecoder::eos_always(5, EOS);
    let enc = mock_encoder_output::<TestBackend>(3, &device);

    naive_beam_search(&decoder, &enc, &params(1, 20)).unwrap();

    assert_eq!(decoder.calls(), 3);
    assert_eq!(decoder.row_counts(), vec![1, 1, 1]);
}

#[test]
fn test_batched_rows_per_step() {
    let device = Default::default();
    let decoder = ScriptedDecoder::random(6, SOS, EOS, 1);
    let enc = mock_encoder_output::<TestBackend>(2, &device);
    batched_beam_search(&decoder, &enc, &params(3, 6)).unwrap();

    let rows = decoder.row_counts();
    assert_eq!(rows[0], 2, "first step decodes one row per example");
    assert!(rows[1..].iter().all(|&r| r == 6));
    assert!(rows.len() <= 6);
}

// ---------------------------------------------------------------------------
// Monte Carlo
// ---------------------------------------------------------------------------

/// Transition table keyed by the input token.
fn chain(token: usize) -> Vec<f32> {
    match token {
        SOS => vec![0.0, 0.2, 0.5, 0.3],
        2 => vec![0.0, 0.4, 0.3, 0.3],
        3 => vec![0.0, 0.6, 0.2, 0.2],
        _ => vec![0.0, 0.1, 0.45, 0.45],
    }
}

#[test]
fn test_monte_carlo_log_prob_runs_through_first_eos() {
    let device = Default::default();
    let decoder = ScriptedDecoder::from_fn(4, |_, token| chain(token));
    let enc = mock_encoder_output::<TestBackend>(2, &device);
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let max_len = 5;

    let cands = monte_carlo_sample(&decoder, &enc, &params(8, max_len), &mut rng).unwrap();
    assert_eq!(decoder.calls(), max_len);
    let lp = host(cands.log_probs);

    for (b, samples) in cands.tokens.iter().enumerate() {
        assert_eq!(samples.len(), 8);
        for (s, tokens) in samples.iter().enumerate() {
            let mut expected = 0.0f32;
            let mut prev = SOS;
            for &t in tokens {
                expected += chain(prev)[t].ln();
                prev = t;
            }
            if tokens.len() < max_len {
                expected += chain(prev)[EOS].ln();
            }
            let got = lp[b * 8 + s];
            assert!((got - expected).abs() < 1e-4, "b={b} s={s} {tokens:?}: {got} vs {expected}");
        }
    }
}

#[test]
fn test_monte_carlo_immediate_eos_is_empty_and_zero() {
    let device = Default::default();
    let decoder = ScriptedDecoder::from_fn(4, |_, _| vec![0.0, 1.0, 0.0, 0.0]);
    let enc = mock_encoder_output::<TestBackend>(2, &device);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    let cands = monte_carlo_sample(&decoder, &enc, &params(3, 4), &mut rng).unwrap();

    assert!(cands.tokens.iter().flatten().all(|t| t.is_empty()));
    assert!(host(cands.log_probs).iter().all(|&lp| lp.abs() < 1e-6));
}

#[test]
fn test_monte_carlo_is_seeded() {
    let device = Default::default();
    let decoder = ScriptedDecoder::random(6, SOS, EOS, 3);
    let enc = mock_encoder_output::<TestBackend>(2, &device);
    let a = monte_carlo_sample(&decoder, &enc, &params(5, 6), &mut rand::rngs::StdRng::seed_from_u64(4))
        .unwrap();
    let b = monte_carlo_sample(&decoder, &enc, &params(5, 6), &mut rand::rngs::StdRng::seed_from_u64(4))
        .unwrap();
    assert_eq!(a.tokens, b.tokens);
}

// ---------------------------------------------------------------------------
// Gradients through candidate log-probabilities
// ---------------------------------------------------------------------------

/// Bigram decoder with a trainable logit table. Columns set to zero in
/// `allowed` get probability exactly 0.
struct BigramDecoder<B: Backend> {
    logits: Tensor<B, 2>,
    allowed: Tensor<B, 2>,
}

impl<B: Backend> BigramDecoder<B> {
    fn new(vocab: usize, device: &B::Device) -> Self {
        let allowed: Vec<f32> = (0..vocab * vocab)
            .map(|i| if i % vocab == SOS { 0.0 } else { 1.0 })
            .collect();
        Self {
            logits: Tensor::random([vocab, vocab], Distribution::Normal(0.0, 1.0), device).require_grad(),
            allowed: Tensor::from_data(TensorData::new(allowed, [vocab, vocab]), device),
        }
    }
}

impl<B: Backend> StepDecoder<B> for BigramDecoder<B> {
    type State = MockState<B>;

    fn vocab_size(&self) -> usize {
        self.logits.dims()[1]
    }

    fn step(
        &self,
        tokens: Tensor<B, 1, Int>,
        _state: MockState<B>,
        _memory: &Memory<B>,
    ) -> (Tensor<B, 2>, MockState<B>) {
        let rows = tokens.dims()[0];
        let probs = softmax(self.logits.clone().select(0, tokens.clone()), 1)
            * self.allowed.clone().select(0, tokens.clone());
        let probs = probs.clone() / probs.sum_dim(1);
        let last = tokens.float().reshape([rows, 1]);
        (probs, MockState { last })
    }
}

fn logit_grads(decoder: &BigramDecoder<TestAutodiffBackend>, cands: Candidates<TestAutodiffBackend>) -> Vec<f32> {
    let grads = cands.log_probs.sum().backward();
    decoder
        .logits
        .grad(&grads)
        .expect("logits receive a gradient")
        .into_data()
        .to_vec()
        .unwrap()
}

fn assert_useful(grads: &[f32], what: &str) {
    assert!(grads.iter().all(|g| g.is_finite()), "{what}: non-finite gradient {grads:?}");
    assert!(grads.iter().any(|g| g.abs() > 1e-8), "{what}: all-zero gradient");
}

#[test]
fn test_gradients_flow_through_every_decoder() {
    let device = Default::default();
    let p = params(3, 5);

    let decoder = BigramDecoder::<TestAutodiffBackend>::new(6, &device);
    let enc = mock_encoder_output::<TestAutodiffBackend>(2, &device);
    let batched = batched_beam_search(&decoder, &enc, &p).unwrap();
    assert_useful(&logit_grads(&decoder, batched), "batched beam");

    let decoder = BigramDecoder::<TestAutodiffBackend>::new(6, &device);
    let naive = naive_beam_search(&decoder, &enc, &p).unwrap();
    assert_useful(&logit_grads(&decoder, naive), "naive beam");

    let decoder = BigramDecoder::<TestAutodiffBackend>::new(6, &device);
    let mut rng = rand::rngs::StdRng::seed_from_u64(8);
    let sampled = monte_carlo_sample(&decoder, &enc, &params(4, 5), &mut rng).unwrap();
    assert_useful(&logit_grads(&decoder, sampled), "monte carlo");
}

#[test]
fn test_zero_probability_tokens_keep_gradients_finite() {
    // Every row gives SOS probability exactly 0 and beam search takes the
    // log over the whole row before picking.
    let device = Default::default();
    let decoder = BigramDecoder::<TestAutodiffBackend>::new(4, &device);
    let enc = mock_encoder_output::<TestAutodiffBackend>(1, &device);
    let cands = batched_beam_search(&decoder, &enc, &params(2, 3)).unwrap();
    assert!(cands.tokens.iter().flatten().flatten().all(|&t| t != SOS));
    let lp: Vec<f32> = cands.log_probs.clone().into_data().to_vec().unwrap();
    assert!(lp.iter().all(|v| v.is_finite()));
    assert_useful(&logit_grads(&decoder, cands), "zero-probability cells");
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[test]
fn test_config_drives_decode() {
    let device = Default::default();
    let cfg: DecodeConfig = toml::from_str(
        r#"
        strategy = "batched_beam"
        sample_size = 2
        decoder_len_limit = 4
        "#,
    )
    .unwrap();
    cfg.validate().unwrap();

    let decoder = ScriptedDecoder::random(5, SOS, EOS, 8);
    let enc = mock_encoder_output::<TestBackend>(2, &device);
    let mut rng = rand::rngs::StdRng::seed_from_u64(cfg.seed);
    let cands = sketch_decode::decode(&decoder, &enc, cfg.strategy, &cfg.params(SOS, EOS), &mut rng)
        .unwrap();
    assert_eq!(cfg.strategy, DecodeStrategy::BatchedBeam);
    assert_eq!(cands.width(), 2);
    assert!(cands.tokens.iter().flatten().all(|t| t.len() <= 4));
}
