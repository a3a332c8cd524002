//! Scripted decoders for testing search code without a trained model.
//!
//! [`ScriptedDecoder`] computes each row's output distribution from the
//! example the row belongs to (read back from the memory tensor), the token
//! fed before the current one (kept in the recurrent state) and the current
//! input token. A search that mixes up memory or state rows therefore
//! produces different candidates, which is what the equivalence tests rely on.

use std::cell::{Cell, RefCell};

use burn::prelude::*;
use rand::{Rng, SeedableRng};

use crate::decoder::{DecoderState, EncoderOutput, Memory, StepDecoder};

/// Previous input token per row; negative before the first step.
#[derive(Debug, Clone)]
pub struct MockState<B: Backend> {
    pub last: Tensor<B, 2>,
}

impl<B: Backend> DecoderState<B> for MockState<B> {
    fn batch_size(&self) -> usize {
        self.last.dims()[0]
    }

    fn select(self, indices: Tensor<B, 1, Int>) -> Self {
        Self {
            last: self.last.select(0, indices),
        }
    }
}

type Script = Box<dyn Fn(usize, Option<usize>, usize) -> Vec<f32>>;

/// Decoder driven by a closure `(example, previous token, input token) -> weights`.
///
/// Weights are normalized per row. Counts every `step` call and the number of
/// rows it was given.
pub struct ScriptedDecoder {
    vocab_size: usize,
    script: Script,
    calls: Cell<usize>,
    rows: RefCell<Vec<usize>>,
}

impl ScriptedDecoder {
    /// Distribution depends on example and input token only.
    pub fn from_fn(vocab_size: usize, f: impl Fn(usize, usize) -> Vec<f32> + 'static) -> Self {
        Self::second_order(vocab_size, move |example, _, token| f(example, token))
    }

    /// Distribution depends on example, the token before the input and the input.
    pub fn second_order(
        vocab_size: usize,
        f: impl Fn(usize, Option<usize>, usize) -> Vec<f32> + 'static,
    ) -> Self {
        Self {
            vocab_size,
            script: Box::new(f),
            calls: Cell::new(0),
            rows: RefCell::new(Vec::new()),
        }
    }

    /// Emits EOS with probability 0.9 regardless of context.
    pub fn eos_always(vocab_size: usize, eos: usize) -> Self {
        let rest = 0.1 / (vocab_size.saturating_sub(1).max(1)) as f32;
        Self::from_fn(vocab_size, move |_, _| {
            (0..vocab_size).map(|t| if t == eos { 0.9 } else { rest }).collect()
        })
    }

    /// Random second-order table, fixed by `seed`, distinct for four example
    /// classes (`example % 4`). `sos` never gets probability mass.
    pub fn random(vocab_size: usize, sos: usize, eos: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let contexts = vocab_size + 1;
        let table: Vec<Vec<f32>> = (0..4 * contexts * vocab_size)
            .map(|_| {
                (0..vocab_size)
                    .map(|t| match t {
                        t if t == sos => 0.0,
                        t if t == eos => rng.gen_range(0.05..0.5),
                        _ => rng.gen_range(0.05..1.0),
                    })
                    .collect()
            })
            .collect();
        Self::second_order(vocab_size, move |example, before, token| {
            let before = before.unwrap_or(vocab_size);
            table[((example % 4) * contexts + before) * vocab_size + token].clone()
        })
    }

    /// Number of `step` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Rows passed to each `step` call, in order.
    pub fn row_counts(&self) -> Vec<usize> {
        self.rows.borrow().clone()
    }
}

impl<B: Backend> StepDecoder<B> for ScriptedDecoder {
    type State = MockState<B>;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state: MockState<B>,
        memory: &Memory<B>,
    ) -> (Tensor<B, 2>, MockState<B>) {
        let n = tokens.dims()[0];
        assert_eq!(memory.batch_size(), n, "memory rows out of sync with decoder rows");
        assert_eq!(state.batch_size(), n, "state rows out of sync with decoder rows");
        self.calls.set(self.calls.get() + 1);
        self.rows.borrow_mut().push(n);

        let device = memory.device();
        let token_ids: Vec<i64> = tokens.into_data().convert::<i64>().to_vec().expect("int data");
        let last: Vec<f32> = state.last.into_data().convert::<f32>().to_vec().expect("state data");
        let examples: Vec<f32> = memory
            .word_states
            .clone()
            .slice([0..n, 0..1, 0..1])
            .into_data()
            .convert::<f32>()
            .to_vec()
            .expect("memory data");

        let mut probs = Vec::with_capacity(n * self.vocab_size);
        for r in 0..n {
            let before = (last[r] >= 0.0).then_some(last[r] as usize);
            let weights = (self.script)(examples[r] as usize, before, token_ids[r] as usize);
            assert_eq!(weights.len(), self.vocab_size, "script returned wrong width");
            let total: f32 = weights.iter().sum();
            assert!(total > 0.0, "script returned an all-zero row");
            probs.extend(weights.iter().map(|w| w / total));
        }

        let probs = Tensor::<B, 2>::from_data(TensorData::new(probs, [n, self.vocab_size]), &device);
        let next: Vec<f32> = token_ids.iter().map(|&t| t as f32).collect();
        let next = MockState {
            last: Tensor::from_data(TensorData::new(next, [n, 1]), &device),
        };
        (probs, next)
    }
}

/// Encoder output for `batch` examples: memory row `b` holds the value `b`,
/// so decoders can tell which example a row belongs to.
pub fn mock_encoder_output<B: Backend>(
    batch: usize,
    device: &B::Device,
) -> EncoderOutput<B, MockState<B>> {
    let src_len = 2;
    let states: Vec<f32> = (0..batch)
        .flat_map(|b| std::iter::repeat(b as f32).take(src_len))
        .collect();
    EncoderOutput {
        memory: Memory {
            word_states: Tensor::from_data(TensorData::new(states, [batch, src_len, 1]), device),
            valid: Tensor::ones([batch, src_len], device),
        },
        final_state: MockState {
            last: Tensor::full([batch, 1], -1.0, device),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::index_tensor;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_rows_are_normalized() {
        let device = Default::default();
        let decoder = ScriptedDecoder::random(6, 0, 1, 5);
        let enc = mock_encoder_output::<TestBackend>(3, &device);
        let (probs, state) = StepDecoder::<TestBackend>::step(
            &decoder,
            index_tensor::<TestBackend>(&[0, 0, 0], &device),
            enc.final_state,
            &enc.memory,
        );
        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        assert_eq!(state.batch_size(), 3);
        assert_eq!(decoder.calls(), 1);
        assert_eq!(decoder.row_counts(), vec![3]);
    }

    #[test]
    fn test_example_identity_changes_distribution() {
        let device = Default::default();
        let decoder = ScriptedDecoder::random(6, 0, 1, 5);
        let enc = mock_encoder_output::<TestBackend>(2, &device);
        let (probs, _) = StepDecoder::<TestBackend>::step(
            &decoder,
            index_tensor::<TestBackend>(&[0, 0], &device),
            enc.final_state,
            &enc.memory,
        );
        let v: Vec<f32> = probs.into_data().to_vec().unwrap();
        assert_ne!(v[..6], v[6..]);
        assert_eq!(v[0], 0.0, "sos is never produced");
    }

    #[test]
    fn test_state_select_gathers_rows() {
        let device = Default::default();
        let state = MockState::<TestBackend> {
            last: Tensor::from_data(TensorData::new(vec![3.0f32, 4.0, 5.0], [3, 1]), &device),
        };
        let picked = state.select(index_tensor::<TestBackend>(&[2, 2, 0], &device));
        let v: Vec<f32> = picked.last.into_data().to_vec().unwrap();
        assert_eq!(v, vec![5.0, 5.0, 3.0]);
    }
}
