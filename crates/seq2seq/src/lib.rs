//! Attention sequence-to-sequence parser from questions to query sketches.
//!
//! Provides the burn encoder/decoder (the decoder implements
//! [`sketch_decode::StepDecoder`], so every search strategy runs on it),
//! dataset indexing, the reward-weighted loss policies, and the supervised
//! and oracle-guided training loops.

pub mod model;
pub mod parser;
pub mod training;

pub use model::{Seq2Seq, Seq2SeqConfig};
pub use parser::{evaluate, Derivation, EvalReport, NearestNeighborParser, SemanticParser, Seq2SeqParser};
pub use training::checkpoint::{CheckpointMeta, CheckpointStore};
pub use training::data::{load_datasets, Dataset, Example, Indexer};
pub use training::loss::RewardLossPolicy;
pub use training::trainer::{train_mle, train_rl, warm_start, Checkpointing, TrainingConfig};
