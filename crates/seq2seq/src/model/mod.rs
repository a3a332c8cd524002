//! burn model: source embedding + LSTM encoder, attention LSTM decoder.
//!
//! ```text
//! source ids (batch, src_len)
//!   → Embedding(input_vocab→input_dim) → Dropout
//!   → RnnEncoder (bi-LSTM: 2·hidden_size) → Dropout      = word states
//!   → masked mean over real tokens → Linear → tanh       = initial hidden (cell = 0)
//!
//! per decoder step, previous token ids (rows,)
//!   → Embedding(output_vocab→output_dim) → Dropout → Lstm (one step)
//!   → dot attention over word states (padding masked)
//!   → tanh(Linear[hidden ‖ context]) → Dropout → Linear → softmax
//!   → probabilities (rows, output_vocab)
//! ```

pub mod encoder;
pub mod state;

use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm, LstmConfig,
};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use sketch_decode::{EncoderOutput, Memory, StepDecoder};

use crate::model::encoder::{RnnEncoder, RnnEncoderConfig};

pub use state::RecurrentState;

/// Attention score given to padded source positions.
const MASKED_SCORE: f32 = -1e9;

#[derive(Config, Debug)]
pub struct Seq2SeqConfig {
    /// Source vocabulary size, special symbols included.
    pub input_vocab: usize,
    /// Target vocabulary size, special symbols included.
    pub output_vocab: usize,
    #[config(default = 100)]
    pub input_dim: usize,
    #[config(default = 100)]
    pub output_dim: usize,
    #[config(default = 200)]
    pub hidden_size: usize,
    #[config(default = true)]
    pub bidirectional: bool,
    #[config(default = 0.2)]
    pub emb_dropout: f64,
    #[config(default = 0.2)]
    pub rnn_dropout: f64,
}

#[derive(Module, Debug)]
pub struct Seq2Seq<B: Backend> {
    input_emb: Embedding<B>,
    output_emb: Embedding<B>,
    emb_dropout: Dropout,
    rnn_dropout: Dropout,
    encoder: RnnEncoder<B>,
    /// Mean word state → initial decoder hidden.
    bridge: Linear<B>,
    decoder_lstm: Lstm<B>,
    /// Decoder hidden → attention query in word-state space.
    attn_query: Linear<B>,
    /// `[hidden ‖ context]` → attentional hidden.
    combine: Linear<B>,
    output: Linear<B>,
}

impl Seq2SeqConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Seq2Seq<B> {
        let encoder = RnnEncoderConfig::new(self.input_dim, self.hidden_size)
            .with_bidirectional(self.bidirectional);
        let d_memory = encoder.d_output();
        Seq2Seq {
            input_emb: EmbeddingConfig::new(self.input_vocab, self.input_dim).init(device),
            output_emb: EmbeddingConfig::new(self.output_vocab, self.output_dim).init(device),
            emb_dropout: DropoutConfig::new(self.emb_dropout).init(),
            rnn_dropout: DropoutConfig::new(self.rnn_dropout).init(),
            encoder: encoder.init(device),
            bridge: LinearConfig::new(d_memory, self.hidden_size).init(device),
            decoder_lstm: LstmConfig::new(self.output_dim, self.hidden_size, true).init(device),
            attn_query: LinearConfig::new(self.hidden_size, d_memory)
                .with_bias(false)
                .init(device),
            combine: LinearConfig::new(self.hidden_size + d_memory, self.hidden_size).init(device),
            output: LinearConfig::new(self.hidden_size, self.output_vocab).init(device),
        }
    }
}

impl<B: Backend> Seq2Seq<B> {
    /// Encode a padded source batch `(batch, src_len)`.
    ///
    /// `lengths[b]` counts the real tokens of row `b`; positions past it are
    /// masked out of attention and of the initial-state mean.
    pub fn encode(
        &self,
        inputs: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> EncoderOutput<B, RecurrentState<B>> {
        let [batch, src_len] = inputs.dims();
        let device = inputs.device();

        let embedded = self.emb_dropout.forward(self.input_emb.forward(inputs));
        let word_states = self.rnn_dropout.forward(self.encoder.forward(embedded, lengths));
        let d_memory = word_states.dims()[2];
        let valid = length_mask::<B>(lengths, src_len, &device);

        let summed = (word_states.clone() * valid.clone().unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .reshape([batch, d_memory]);
        let counts = valid.clone().sum_dim(1).clamp_min(1.0);
        let hidden = self.bridge.forward(summed / counts).tanh();
        let cell = Tensor::zeros(hidden.dims(), &device);

        EncoderOutput {
            memory: Memory { word_states, valid },
            final_state: RecurrentState::new(hidden, cell),
        }
    }
}

impl<B: Backend> StepDecoder<B> for Seq2Seq<B> {
    type State = RecurrentState<B>;

    fn vocab_size(&self) -> usize {
        self.output.weight.val().dims()[1]
    }

    fn step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state: RecurrentState<B>,
        memory: &Memory<B>,
    ) -> (Tensor<B, 2>, RecurrentState<B>) {
        let rows = tokens.dims()[0];
        let [_, src_len, d_memory] = memory.word_states.dims();

        let embedded = self.emb_dropout.forward(self.output_emb.forward(tokens.reshape([rows, 1])));
        let (_, next) = self.decoder_lstm.forward(embedded, Some(state.0));
        let state = RecurrentState(next);

        let query = self.attn_query.forward(state.hidden()).unsqueeze_dim::<3>(2);
        let scores = memory
            .word_states
            .clone()
            .matmul(query)
            .reshape([rows, src_len])
            .mask_fill(memory.valid.clone().equal_elem(0.0), MASKED_SCORE);
        let weights = softmax(scores, 1).unsqueeze_dim::<3>(1);
        let context = weights
            .matmul(memory.word_states.clone())
            .reshape([rows, d_memory]);

        let attended = self
            .combine
            .forward(Tensor::cat(vec![state.hidden(), context], 1))
            .tanh();
        let logits = self.output.forward(self.rnn_dropout.forward(attended));
        (softmax(logits, 1), state)
    }
}

/// `(batch, len)` float mask: 1.0 at `t < lengths[b]`, else 0.0.
pub fn length_mask<B: Backend>(lengths: &[usize], len: usize, device: &B::Device) -> Tensor<B, 2> {
    let data: Vec<f32> = lengths
        .iter()
        .flat_map(|&n| (0..len).map(move |t| if t < n { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(data, [lengths.len(), len]), device)
}
