//! Recurrent encoder over padded source batches.

use burn::nn::{Lstm, LstmConfig};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct RnnEncoderConfig {
    pub d_input: usize,
    pub d_hidden: usize,
    #[config(default = true)]
    pub bidirectional: bool,
}

/// LSTM encoder, optionally with a second LSTM reading each source backwards.
///
/// The backward direction reverses only the real tokens of every row, so
/// padding never reaches a real position in either direction.
#[derive(Module, Debug)]
pub struct RnnEncoder<B: Backend> {
    forward_lstm: Lstm<B>,
    backward_lstm: Option<Lstm<B>>,
}

impl RnnEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RnnEncoder<B> {
        let lstm = LstmConfig::new(self.d_input, self.d_hidden, true);
        RnnEncoder {
            forward_lstm: lstm.init(device),
            backward_lstm: self.bidirectional.then(|| lstm.init(device)),
        }
    }

    /// Width of each per-token encoder state.
    pub fn d_output(&self) -> usize {
        if self.bidirectional {
            2 * self.d_hidden
        } else {
            self.d_hidden
        }
    }
}

impl<B: Backend> RnnEncoder<B> {
    /// Embedded sources `(batch, len, d_input)` to per-token states
    /// `(batch, len, d_output)`. `lengths[b]` counts the real tokens of row `b`.
    pub fn forward(&self, embedded: Tensor<B, 3>, lengths: &[usize]) -> Tensor<B, 3> {
        let (forward, _) = self.forward_lstm.forward(embedded.clone(), None);
        match &self.backward_lstm {
            None => forward,
            Some(lstm) => {
                let reversed = reverse_within_lengths(embedded, lengths);
                let (backward, _) = lstm.forward(reversed, None);
                let backward = reverse_within_lengths(backward, lengths);
                Tensor::cat(vec![forward, backward], 2)
            }
        }
    }
}

/// Reverse the first `lengths[b]` positions of every row, leaving padding in place.
///
/// The permutation is its own inverse.
pub fn reverse_within_lengths<B: Backend>(x: Tensor<B, 3>, lengths: &[usize]) -> Tensor<B, 3> {
    let [batch, len, dim] = x.dims();
    let mut index = Vec::with_capacity(batch * len * dim);
    for &n in lengths.iter().take(batch) {
        let n = n.min(len);
        for t in 0..len {
            let src = if t < n { n - 1 - t } else { t };
            index.extend(std::iter::repeat(src as i64).take(dim));
        }
    }
    let index = Tensor::<B, 3, Int>::from_data(TensorData::new(index, [batch, len, dim]), &x.device());
    x.gather(1, index)
}
