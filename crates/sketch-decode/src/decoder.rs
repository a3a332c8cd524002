//! The seam between the search algorithms and a concrete decoder.

use burn::prelude::*;

/// Recurrent state carried between decoder steps, one row per hypothesis.
pub trait DecoderState<B: Backend>: Clone {
    /// Number of rows held.
    fn batch_size(&self) -> usize;

    /// Gather rows along the batch dimension. Indices may repeat.
    fn select(self, indices: Tensor<B, 1, Int>) -> Self;
}

/// Encoder outputs attended over while decoding.
#[derive(Debug, Clone)]
pub struct Memory<B: Backend> {
    /// Per-token encoder states `(batch, src_len, dim)`.
    pub word_states: Tensor<B, 3>,
    /// 1.0 at real source tokens, 0.0 at padding `(batch, src_len)`.
    pub valid: Tensor<B, 2>,
}

impl<B: Backend> Memory<B> {
    pub fn batch_size(&self) -> usize {
        self.word_states.dims()[0]
    }

    pub fn src_len(&self) -> usize {
        self.word_states.dims()[1]
    }

    pub fn device(&self) -> B::Device {
        self.word_states.device()
    }

    /// Gather rows along the batch dimension.
    pub fn select(&self, indices: Tensor<B, 1, Int>) -> Self {
        Self {
            word_states: self.word_states.clone().select(0, indices.clone()),
            valid: self.valid.clone().select(0, indices),
        }
    }
}

/// Everything the search needs from encoding a batch.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend, S> {
    pub memory: Memory<B>,
    /// Initial decoder state, one row per example.
    pub final_state: S,
}

impl<B: Backend, S: DecoderState<B>> EncoderOutput<B, S> {
    pub fn batch_size(&self) -> usize {
        self.memory.batch_size()
    }

    /// Restrict or replicate examples by index.
    pub fn select(&self, indices: Tensor<B, 1, Int>) -> Self {
        Self {
            memory: self.memory.select(indices.clone()),
            final_state: self.final_state.clone().select(indices),
        }
    }
}

/// A decoder run one token at a time.
pub trait StepDecoder<B: Backend> {
    type State: DecoderState<B>;

    fn vocab_size(&self) -> usize;

    /// Consume the previous token of every row and return the output
    /// distribution `(rows, vocab)` (probabilities, not logits) with the
    /// updated state. `memory` holds one row per decoder row.
    fn step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state: Self::State,
        memory: &Memory<B>,
    ) -> (Tensor<B, 2>, Self::State);
}

/// Build a 1-D index tensor.
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

/// Build a `(rows, cols)` index tensor from row-major values.
pub fn index_tensor_2d<B: Backend>(
    indices: &[usize],
    shape: [usize; 2],
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}
