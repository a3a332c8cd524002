//! Batched sequence search over a recurrent decoder.
//!
//! Produces K candidate output sequences per input together with their
//! accumulated log-probabilities. The decoder itself is abstracted behind
//! [`StepDecoder`] so the search algorithms can be tested with scripted
//! mocks (no trained model needed).
//!
//! # Key types
//!
//! - [`Beam`]: bounded top-K container with first-inserted-wins tie breaking
//! - [`BeamTracker`]: flat-index bookkeeping for batched beam expansion
//! - [`StepDecoder`] / [`DecoderState`]: the decoder seam, one step at a time
//! - [`Candidates`]: the shared output contract of every decoder
//! - [`DecodeConfig`] / [`DecodeStrategy`]: configuration loaded from TOML

pub mod beam;
pub mod config;
pub mod decoder;
pub mod mocks;
pub mod search;
pub mod tracker;

pub use beam::{Beam, ScoredEntry};
pub use config::{DecodeConfig, DecodeStrategy};
pub use decoder::{DecoderState, EncoderOutput, Memory, StepDecoder};
pub use search::{
    batched_beam_search, decode, greedy_decode, monte_carlo_sample, naive_beam_search,
    single_example_beam_search, Candidates, DecodeError, SearchParams,
};
pub use tracker::{unflatten, BeamTracker, TrackedStep};
