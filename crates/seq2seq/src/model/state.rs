use burn::nn::LstmState;
use burn::prelude::*;
use sketch_decode::DecoderState;

/// Decoder recurrent state: burn's [`LstmState`] with one row per hypothesis.
pub struct RecurrentState<B: Backend>(pub LstmState<B, 2>);

impl<B: Backend> RecurrentState<B> {
    pub fn new(hidden: Tensor<B, 2>, cell: Tensor<B, 2>) -> Self {
        Self(LstmState { cell, hidden })
    }

    pub fn zeros(rows: usize, d_hidden: usize, device: &B::Device) -> Self {
        Self::new(
            Tensor::zeros([rows, d_hidden], device),
            Tensor::zeros([rows, d_hidden], device),
        )
    }

    /// `(rows, d_hidden)`
    pub fn hidden(&self) -> Tensor<B, 2> {
        self.0.hidden.clone()
    }

    /// `(rows, d_hidden)`
    pub fn cell(&self) -> Tensor<B, 2> {
        self.0.cell.clone()
    }
}

impl<B: Backend> Clone for RecurrentState<B> {
    fn clone(&self) -> Self {
        Self::new(self.hidden(), self.cell())
    }
}

impl<B: Backend> std::fmt::Debug for RecurrentState<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurrentState")
            .field("hidden", &self.0.hidden)
            .field("cell", &self.0.cell)
            .finish()
    }
}

impl<B: Backend> DecoderState<B> for RecurrentState<B> {
    fn batch_size(&self) -> usize {
        self.0.hidden.dims()[0]
    }

    fn select(self, indices: Tensor<B, 1, Int>) -> Self {
        let LstmState { cell, hidden } = self.0;
        Self::new(hidden.select(0, indices.clone()), cell.select(0, indices))
    }
}
