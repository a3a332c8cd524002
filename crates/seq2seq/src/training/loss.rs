//! Reward-weighted losses for oracle-guided training and the supervised
//! cross-entropy used for maximum-likelihood training.

use std::fmt;

use burn::prelude::*;
use sketch_decode::{EncoderOutput, StepDecoder};

use crate::training::data::{Batch, SOS_ID};

/// Added to per-example reward sums before normalizing.
pub const REWARD_EPS: f32 = 1e-7;

/// How candidate rewards weight candidate log-probabilities.
///
/// All policies take `(batch, samples)` log-probabilities carrying gradients
/// and same-shaped rewards, which are detached before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardLossPolicy {
    /// `-mean_b mean_s(logp · r)`
    Plain,
    /// Rewards divided by their per-example sum, then `-mean_b sum_s`.
    Normalized,
    /// Rewards scaled by the candidate's own (detached) probability, then
    /// normalized per example; `-mean_b sum_s`.
    #[default]
    Origin,
    /// Rewards minus their per-example mean; `-mean_b mean_s`.
    Centered,
}

impl fmt::Display for RewardLossPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardLossPolicy::Plain => write!(f, "plain"),
            RewardLossPolicy::Normalized => write!(f, "normalized"),
            RewardLossPolicy::Origin => write!(f, "origin"),
            RewardLossPolicy::Centered => write!(f, "centered"),
        }
    }
}

impl RewardLossPolicy {
    /// Scalar loss and the reward reported for logging,
    /// `mean_b mean_s(exp(logp) · r)`.
    pub fn compute<B: Backend>(
        &self,
        log_probs: Tensor<B, 2>,
        rewards: Tensor<B, 2>,
    ) -> anyhow::Result<(Tensor<B, 1>, f64)> {
        anyhow::ensure!(
            log_probs.dims() == rewards.dims(),
            "log-probabilities {:?} and rewards {:?} differ in shape",
            log_probs.dims(),
            rewards.dims()
        );
        let rewards = rewards.detach();
        let probs = log_probs.clone().detach().exp();
        let reported: f64 = (probs.clone() * rewards.clone()).mean().into_scalar().elem();

        let weights = match self {
            RewardLossPolicy::Plain => rewards,
            RewardLossPolicy::Normalized => {
                let total = rewards.clone().sum_dim(1).add_scalar(REWARD_EPS);
                rewards / total
            }
            RewardLossPolicy::Origin => {
                let scaled = rewards * probs;
                let total = scaled.clone().sum_dim(1).add_scalar(REWARD_EPS);
                scaled / total
            }
            RewardLossPolicy::Centered => {
                let baseline = rewards.clone().mean_dim(1);
                rewards - baseline
            }
        };

        let weighted = log_probs.neg() * weights;
        let per_example = match self {
            RewardLossPolicy::Plain | RewardLossPolicy::Centered => weighted.mean_dim(1),
            RewardLossPolicy::Normalized | RewardLossPolicy::Origin => weighted.sum_dim(1),
        };
        Ok((per_example.mean(), reported))
    }
}

/// Summed negative log-likelihood of `targets` under `probs`, counting only
/// rows where `mask` is 1.
///
/// `probs`: `(rows, vocab)`, `targets`: `(rows,)`, `mask`: `(rows,)`.
pub fn masked_cross_entropy<B: Backend>(
    probs: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    mask: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let rows = targets.dims()[0];
    let picked = probs.gather(1, targets.reshape([rows, 1])).reshape([rows]);
    // Padded rows may pick a zero probability; keep their log finite.
    (picked.clamp_min(1e-12).log().neg() * mask).sum()
}

/// Per-token negative log-likelihood of the batch's gold outputs.
///
/// Decodes `batch.output_len` steps from `<SOS>`. With `teacher_forcing` the
/// gold token is fed back at every step, otherwise the arg-max prediction.
/// Returns the loss averaged over gold tokens and the token count.
pub fn supervised_loss<B, D>(
    decoder: &D,
    enc: &EncoderOutput<B, D::State>,
    batch: &Batch,
    teacher_forcing: bool,
) -> (Tensor<B, 1>, usize)
where
    B: Backend,
    D: StepDecoder<B>,
{
    let rows = batch.len();
    let device = enc.memory.device();
    let mask = batch.output_mask::<B>(&device);

    let mut inputs = Tensor::<B, 1, Int>::from_data(
        TensorData::new(vec![SOS_ID as i64; rows], [rows]),
        &device,
    );
    let mut state = enc.final_state.clone();
    let mut total = Tensor::<B, 1>::zeros([1], &device);

    for t in 0..batch.output_len {
        let (probs, next_state) = decoder.step(inputs, state, &enc.memory);
        state = next_state;

        let gold: Vec<i64> = batch.outputs_at(t).into_iter().map(|i| i as i64).collect();
        let gold = Tensor::<B, 1, Int>::from_data(TensorData::new(gold, [rows]), &device);
        let step_mask = mask.clone().slice([0..rows, t..t + 1]).reshape([rows]);

        inputs = if teacher_forcing {
            gold.clone()
        } else {
            probs.clone().argmax(1).reshape([rows])
        };
        total = total + masked_cross_entropy(probs, gold, step_mask);
    }

    let tokens = batch.num_output_tokens();
    (total / tokens.max(1) as f32, tokens)
}
