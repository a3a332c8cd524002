//! Candidate generation: beam search (per example or batched), Monte Carlo
//! rollouts and greedy decoding.
//!
//! Every candidate-producing decoder returns [`Candidates`]: token lists of
//! shape `batch × width` (EOS stripped) and a `(batch, width)` tensor of
//! accumulated log-probabilities that still carries gradients back into the
//! decoder.

use burn::prelude::*;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::Rng;

use crate::beam::Beam;
use crate::config::DecodeStrategy;
use crate::decoder::{index_tensor, index_tensor_2d, DecoderState, EncoderOutput, StepDecoder};
use crate::tracker::BeamTracker;

/// Errors from setting up or running a decoder.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("beam width / sample size must be >= 1, got {0}")]
    InvalidWidth(usize),

    #[error("decoder length limit must be >= 1")]
    InvalidMaxLen,

    #[error("beam width {width} exceeds vocabulary size {vocab}")]
    WidthExceedsVocab { width: usize, vocab: usize },

    #[error("shape mismatch: expected {expected}, got {got}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("cannot decode an empty batch")]
    EmptyBatch,

    #[error("failed to read tensor data: {0}")]
    TensorData(String),

    #[error("cannot sample from output distribution: {0}")]
    Sampling(String),
}

/// Per-call search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    /// Beam width, or rollouts per example for Monte Carlo.
    pub width: usize,
    /// Maximum number of decoder steps.
    pub max_len: usize,
    pub sos: usize,
    pub eos: usize,
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.width == 0 {
            return Err(DecodeError::InvalidWidth(self.width));
        }
        if self.max_len == 0 {
            return Err(DecodeError::InvalidMaxLen);
        }
        Ok(())
    }

    /// Beam search additionally needs `width` distinct first tokens.
    pub fn validate_beam(&self, vocab_size: usize) -> Result<(), DecodeError> {
        self.validate()?;
        if self.width > vocab_size {
            return Err(DecodeError::WidthExceedsVocab {
                width: self.width,
                vocab: vocab_size,
            });
        }
        Ok(())
    }
}

/// Candidate sequences for a batch.
#[derive(Debug, Clone)]
pub struct Candidates<B: Backend> {
    /// `tokens[example][slot]`, EOS not included.
    pub tokens: Vec<Vec<Vec<usize>>>,
    /// Accumulated log-probability `(batch, width)`, EOS step included.
    pub log_probs: Tensor<B, 2>,
}

impl<B: Backend> Candidates<B> {
    pub fn batch_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn width(&self) -> usize {
        self.tokens.first().map_or(0, |t| t.len())
    }
}

fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, DecodeError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DecodeError::TensorData(format!("{e:?}")))
}

/// Log of a probability table. Zero cells are floored first so their
/// gradient through `log` stays finite.
fn safe_log<B: Backend>(probs: Tensor<B, 2>) -> Tensor<B, 2> {
    probs.clamp_min(f32::MIN_POSITIVE).log()
}

fn check_batch(batch: usize) -> Result<(), DecodeError> {
    if batch == 0 {
        return Err(DecodeError::EmptyBatch);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Single-example beam search
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Hypothesis<B: Backend, S> {
    tokens: Vec<usize>,
    log_prob: Tensor<B, 1>,
    state: S,
    last: usize,
}

/// A staged candidate. Tensors are only built for survivors.
enum Expansion {
    Carry(usize),
    Extend { parent: usize, token: usize },
}

/// Beam search over a single example (`enc` must hold exactly one row).
///
/// Returns the surviving hypotheses best first and their log-probabilities
/// as a `(width,)` tensor. A hypothesis that emitted EOS is carried forward
/// unchanged; the search stops as soon as every hypothesis has.
pub fn single_example_beam_search<B, D>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    params: &SearchParams,
) -> Result<(Vec<Vec<usize>>, Tensor<B, 1>), DecodeError>
where
    B: Backend,
    D: StepDecoder<B>,
{
    let vocab = decoder.vocab_size();
    params.validate_beam(vocab)?;
    if enc.batch_size() != 1 {
        return Err(DecodeError::BatchMismatch {
            expected: 1,
            got: enc.batch_size(),
        });
    }
    let device = enc.memory.device();

    let mut beam = Beam::new(1);
    beam.add(
        Hypothesis {
            tokens: Vec::new(),
            log_prob: Tensor::<B, 1>::zeros([1], &device),
            state: enc.final_state.clone(),
            last: params.sos,
        },
        0.0,
    );

    for step in 0..params.max_len {
        if beam.iter().all(|e| e.elt.last == params.eos) {
            tracing::debug!(step, "all hypotheses terminated");
            break;
        }

        let parents = beam.into_elts_and_scores();
        let mut staged = Beam::new(params.width);
        let mut outputs: Vec<Option<(Tensor<B, 1>, D::State)>> = Vec::with_capacity(parents.len());

        for (i, (hyp, score)) in parents.iter().enumerate() {
            if hyp.last == params.eos {
                staged.add(Expansion::Carry(i), *score);
                outputs.push(None);
                continue;
            }
            let (probs, next_state) = decoder.step(
                index_tensor::<B>(&[hyp.last], &device),
                hyp.state.clone(),
                &enc.memory,
            );
            let log_probs = safe_log(probs).reshape([vocab]);
            for (token, &lp) in host_values(log_probs.clone())?.iter().enumerate() {
                staged.add(Expansion::Extend { parent: i, token }, score + lp as f64);
            }
            outputs.push(Some((log_probs, next_state)));
        }

        let mut next = Beam::new(params.width);
        for (expansion, score) in staged.into_elts_and_scores() {
            let hyp = match expansion {
                Expansion::Carry(i) => parents[i].0.clone(),
                Expansion::Extend { parent, token } => {
                    let Some((log_probs, state)) = &outputs[parent] else {
                        continue;
                    };
                    let prev = &parents[parent].0;
                    let mut tokens = prev.tokens.clone();
                    if token != params.eos {
                        tokens.push(token);
                    }
                    Hypothesis {
                        tokens,
                        log_prob: prev.log_prob.clone()
                            + log_probs.clone().slice([token..token + 1]),
                        state: state.clone(),
                        last: token,
                    }
                }
            };
            next.add(hyp, score);
        }
        beam = next;
    }

    let (tokens, log_probs): (Vec<_>, Vec<_>) = beam
        .into_elts_and_scores()
        .into_iter()
        .map(|(h, _)| (h.tokens, h.log_prob))
        .unzip();
    Ok((tokens, Tensor::cat(log_probs, 0)))
}

/// Single-example beam search applied to each example in turn.
pub fn naive_beam_search<B, D>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    params: &SearchParams,
) -> Result<Candidates<B>, DecodeError>
where
    B: Backend,
    D: StepDecoder<B>,
{
    let batch = enc.batch_size();
    check_batch(batch)?;
    let device = enc.memory.device();

    let mut tokens = Vec::with_capacity(batch);
    let mut rows = Vec::with_capacity(batch);
    for b in 0..batch {
        let one = enc.select(index_tensor::<B>(&[b], &device));
        let (example_tokens, log_probs) = single_example_beam_search(decoder, &one, params)?;
        tokens.push(example_tokens);
        rows.push(log_probs.unsqueeze::<2>());
    }
    Ok(Candidates {
        tokens,
        log_probs: Tensor::cat(rows, 0),
    })
}

// ---------------------------------------------------------------------------
// Batched beam search
// ---------------------------------------------------------------------------

/// Terminated rows may only continue with EOS, at zero cost.
fn freeze_terminated<B: Backend>(
    log_probs: Tensor<B, 2>,
    terminated: &[bool],
    vocab: usize,
    eos: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    if !terminated.iter().any(|&t| t) {
        return log_probs;
    }
    let rows = terminated.len();
    let mut blocked = Vec::with_capacity(rows * vocab);
    let mut eos_cells = Vec::with_capacity(rows * vocab);
    for &t in terminated {
        for tok in 0..vocab {
            blocked.push(t && tok != eos);
            eos_cells.push(t && tok == eos);
        }
    }
    let blocked = Tensor::<B, 2, Bool>::from_data(TensorData::new(blocked, [rows, vocab]), device);
    let eos_cells =
        Tensor::<B, 2, Bool>::from_data(TensorData::new(eos_cells, [rows, vocab]), device);
    log_probs
        .mask_fill(blocked, f32::NEG_INFINITY)
        .mask_fill(eos_cells, 0.0)
}

/// Beam search over the whole batch with one decoder call per step.
///
/// Produces the same hypotheses as [`naive_beam_search`]: every example keeps
/// `width` slots, a terminated slot is copied through, ties go to the lower
/// `(slot, token)` index, and the loop ends once every slot of every example
/// is terminated.
pub fn batched_beam_search<B, D>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    params: &SearchParams,
) -> Result<Candidates<B>, DecodeError>
where
    B: Backend,
    D: StepDecoder<B>,
{
    let vocab = decoder.vocab_size();
    params.validate_beam(vocab)?;
    let batch = enc.batch_size();
    check_batch(batch)?;
    let device = enc.memory.device();

    let mut tracker = BeamTracker::new(batch, params.width, vocab, params.eos);
    let mut inputs = vec![params.sos; batch];
    let mut memory = enc.memory.clone();
    let mut state = enc.final_state.clone();
    let mut acc = Tensor::<B, 2>::zeros([batch, 1], &device);

    for step in 0..params.max_len {
        if tracker.all_terminated() {
            tracing::debug!(step, "all beams terminated");
            break;
        }
        let cur = tracker.current_width();
        let rows = batch * cur;
        if state.batch_size() != rows {
            return Err(DecodeError::BatchMismatch {
                expected: rows,
                got: state.batch_size(),
            });
        }

        let terminated = tracker.flat_terminated();
        let (probs, next_state) = decoder.step(index_tensor::<B>(&inputs, &device), state, &memory);
        let log_probs = safe_log(probs);
        let tracked = tracker.advance(&host_values(log_probs.clone())?)?;

        let potential = (acc.reshape([rows, 1])
            + freeze_terminated(log_probs, &terminated, vocab, params.eos, &device))
        .reshape([batch, cur * vocab]);
        let picked: Vec<usize> = tracked.picked.iter().flatten().copied().collect();
        acc = potential.gather(1, index_tensor_2d::<B>(&picked, [batch, params.width], &device));

        let sources = index_tensor::<B>(&tracked.source_rows(cur), &device);
        if cur != params.width {
            memory = memory.select(sources.clone());
        }
        state = next_state.select(sources);
        inputs = tracked.flat_inputs();
    }

    Ok(Candidates {
        tokens: tracker.into_tokens(),
        log_probs: acc,
    })
}

// ---------------------------------------------------------------------------
// Monte Carlo sampling
// ---------------------------------------------------------------------------

/// Draw `width` independent rollouts per example.
///
/// Rollouts always run `max_len` steps. Reported tokens stop before the first
/// EOS and the log-probability sums every step up to and including it.
pub fn monte_carlo_sample<B, D, R>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    params: &SearchParams,
    rng: &mut R,
) -> Result<Candidates<B>, DecodeError>
where
    B: Backend,
    D: StepDecoder<B>,
    R: Rng,
{
    params.validate()?;
    let batch = enc.batch_size();
    check_batch(batch)?;
    let vocab = decoder.vocab_size();
    let device = enc.memory.device();
    let samples = params.width;
    let rows = samples * batch;

    // Row `s * batch + b` is rollout `s` of example `b`.
    let replicate: Vec<usize> = (0..samples).flat_map(|_| 0..batch).collect();
    let replicate = index_tensor::<B>(&replicate, &device);
    let memory = enc.memory.select(replicate.clone());
    let mut state = enc.final_state.clone().select(replicate);

    let mut inputs = vec![params.sos; rows];
    let mut traces: Vec<Vec<usize>> = vec![Vec::with_capacity(params.max_len); rows];
    let mut step_log_probs = Vec::with_capacity(params.max_len);

    for _ in 0..params.max_len {
        let (probs, next_state) = decoder.step(index_tensor::<B>(&inputs, &device), state, &memory);
        state = next_state;

        let host = host_values(probs.clone())?;
        let mut drawn = Vec::with_capacity(rows);
        for r in 0..rows {
            let dist = WeightedIndex::new(&host[r * vocab..(r + 1) * vocab])
                .map_err(|e| DecodeError::Sampling(e.to_string()))?;
            drawn.push(dist.sample(rng));
        }

        let chosen = index_tensor_2d::<B>(&drawn, [rows, 1], &device);
        step_log_probs.push(probs.gather(1, chosen).log());
        for (trace, &tok) in traces.iter_mut().zip(drawn.iter()) {
            trace.push(tok);
        }
        inputs = drawn;
    }

    let mut keep = Vec::with_capacity(rows * params.max_len);
    let mut truncated = Vec::with_capacity(rows);
    for trace in traces {
        let cut = trace.iter().position(|&t| t == params.eos);
        let last_kept = cut.unwrap_or(params.max_len - 1);
        keep.extend((0..params.max_len).map(|j| if j <= last_kept { 1.0f32 } else { 0.0 }));
        truncated.push(match cut {
            Some(pos) => trace[..pos].to_vec(),
            None => trace,
        });
    }
    let keep = Tensor::<B, 2>::from_data(TensorData::new(keep, [rows, params.max_len]), &device);

    let log_probs = (Tensor::cat(step_log_probs, 1) * keep)
        .sum_dim(1)
        .reshape([samples, batch])
        .swap_dims(0, 1);

    let mut tokens = vec![Vec::with_capacity(samples); batch];
    for (r, trace) in truncated.into_iter().enumerate() {
        tokens[r % batch].push(trace);
    }

    Ok(Candidates { tokens, log_probs })
}

// ---------------------------------------------------------------------------
// Greedy decoding and dispatch
// ---------------------------------------------------------------------------

/// Arg-max decoding, one output per example, truncated before the first EOS.
pub fn greedy_decode<B, D>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    max_len: usize,
    sos: usize,
    eos: usize,
) -> Result<Vec<Vec<usize>>, DecodeError>
where
    B: Backend,
    D: StepDecoder<B>,
{
    if max_len == 0 {
        return Err(DecodeError::InvalidMaxLen);
    }
    let batch = enc.batch_size();
    check_batch(batch)?;
    let vocab = decoder.vocab_size();
    let device = enc.memory.device();

    let mut inputs = vec![sos; batch];
    let mut state = enc.final_state.clone();
    let mut outputs: Vec<Vec<usize>> = vec![Vec::new(); batch];
    let mut done = vec![false; batch];

    for _ in 0..max_len {
        let (probs, next_state) =
            decoder.step(index_tensor::<B>(&inputs, &device), state, &enc.memory);
        state = next_state;
        let host = host_values(probs)?;
        for b in 0..batch {
            let row = &host[b * vocab..(b + 1) * vocab];
            let best = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc })
                .0;
            if !done[b] {
                if best == eos {
                    done[b] = true;
                } else {
                    outputs[b].push(best);
                }
            }
            inputs[b] = best;
        }
        if done.iter().all(|&d| d) {
            break;
        }
    }
    Ok(outputs)
}

/// Produce candidates with the configured strategy.
pub fn decode<B, D, R>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    strategy: DecodeStrategy,
    params: &SearchParams,
    rng: &mut R,
) -> Result<Candidates<B>, DecodeError>
where
    B: Backend,
    D: StepDecoder<B>,
    R: Rng,
{
    match strategy {
        DecodeStrategy::Beam => naive_beam_search(decoder, enc, params),
        DecodeStrategy::BatchedBeam => batched_beam_search(decoder, enc, params),
        DecodeStrategy::MonteCarlo => monte_carlo_sample(decoder, enc, params, rng),
    }
}
