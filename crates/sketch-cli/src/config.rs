//! TOML config loading for the `deep-sketch` CLI.
//!
//! Deserializes `configs/train.toml` with `[model]`, `[training]`, `[decode]`,
//! `[oracle]` and `[cache]` sections, then merges with CLI overrides.
//! Priority: built-in defaults < TOML values < CLI flags.

use std::path::{Path, PathBuf};

use reward_cache::{CacheConfig, OracleConfig, OracleMode};
use seq2seq::{Dataset, RewardLossPolicy, Seq2SeqConfig, TrainingConfig};
use serde::Deserialize;
use sketch_decode::{DecodeConfig, DecodeStrategy};

/// Top-level structure matching `configs/train.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct DeepSketchToml {
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub training: TrainingOverrides,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Optional overrides for `Seq2SeqConfig`. Vocabulary sizes come from the dataset.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub input_dim: Option<usize>,
    pub output_dim: Option<usize>,
    pub hidden_size: Option<usize>,
    pub bidirectional: Option<bool>,
    pub emb_dropout: Option<f64>,
    pub rnn_dropout: Option<f64>,
}

/// Optional overrides for `TrainingConfig`.
///
/// The output length limit lives in `[decode]` and is shared with the trainer.
#[derive(Debug, Default, Deserialize)]
pub struct TrainingOverrides {
    pub epochs: Option<usize>,
    pub lr: Option<f64>,
    pub batch_size: Option<usize>,
    pub clip_grad: Option<f64>,
    pub saving_from: Option<usize>,
    pub saving_interval: Option<usize>,
    pub p_forcing: Option<f64>,
    pub reverse_input: Option<bool>,
    pub epoch_start: Option<usize>,
    pub start_size: Option<usize>,
    pub seed: Option<u64>,
    pub loss_policy: Option<RewardLossPolicy>,
}

/// Training flags shared by `train` and `train-rl`.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct TrainingFlags {
    /// Override the number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Override the learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    /// Override the batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Override the gradient-norm clip.
    #[arg(long)]
    pub clip_grad: Option<f64>,
    /// Override the maximum output length (EOS included).
    #[arg(long)]
    pub decoder_len_limit: Option<usize>,
    /// Feed questions to the encoder in reverse order.
    #[arg(long)]
    pub reverse_input: bool,
    /// Reward loss policy: plain, normalized, origin or centered.
    #[arg(long, value_parser = parse_loss_policy)]
    pub loss_policy: Option<RewardLossPolicy>,
}

/// Oracle and decoding flags for `train-rl`.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct OracleFlags {
    /// Oracle backend: sketch or dfa.
    #[arg(long, value_parser = parse_oracle_mode)]
    pub oracle_mode: Option<OracleMode>,
    /// Per-candidate oracle time budget in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Decode training batches with Monte Carlo rollouts instead of beam search.
    #[arg(long)]
    pub do_montecarlo: bool,
    /// Override the beam width / number of rollouts.
    #[arg(long)]
    pub sample_size: Option<usize>,
    /// Override the cache file prefix.
    #[arg(long)]
    pub cache_id: Option<String>,
}

pub fn parse_loss_policy(s: &str) -> Result<RewardLossPolicy, String> {
    match s {
        "plain" => Ok(RewardLossPolicy::Plain),
        "normalized" => Ok(RewardLossPolicy::Normalized),
        "origin" => Ok(RewardLossPolicy::Origin),
        "centered" => Ok(RewardLossPolicy::Centered),
        other => Err(format!(
            "unknown loss policy {other:?} (expected plain, normalized, origin or centered)"
        )),
    }
}

pub fn parse_oracle_mode(s: &str) -> Result<OracleMode, String> {
    match s {
        "sketch" => Ok(OracleMode::Sketch),
        "dfa" => Ok(OracleMode::Dfa),
        other => Err(format!("unknown oracle mode {other:?} (expected sketch or dfa)")),
    }
}

/// Load and deserialize a `DeepSketchToml`. `None` yields the built-in defaults.
pub fn load_toml(path: Option<&Path>) -> anyhow::Result<DeepSketchToml> {
    let Some(path) = path else {
        return Ok(DeepSketchToml::default());
    };
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: DeepSketchToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Model hyper-parameters for `data`'s vocabularies.
pub fn build_model_config(overrides: &ModelOverrides, data: &Dataset) -> Seq2SeqConfig {
    let mut config = Seq2SeqConfig::new(data.input_indexer.len(), data.output_indexer.len());
    if let Some(n) = overrides.input_dim {
        config.input_dim = n;
    }
    if let Some(n) = overrides.output_dim {
        config.output_dim = n;
    }
    if let Some(n) = overrides.hidden_size {
        config.hidden_size = n;
    }
    if let Some(b) = overrides.bidirectional {
        config.bidirectional = b;
    }
    if let Some(p) = overrides.emb_dropout {
        config.emb_dropout = p;
    }
    if let Some(p) = overrides.rnn_dropout {
        config.rnn_dropout = p;
    }
    config
}

/// Decoding settings from `[decode]`, `--decoder-len-limit`, the oracle flags
/// and the global `--seed`.
pub fn build_decode_config(
    base: &DecodeConfig,
    training: &TrainingFlags,
    oracle: &OracleFlags,
    seed_cli: Option<u64>,
) -> DecodeConfig {
    let mut config = base.clone();
    if let Some(n) = training.decoder_len_limit {
        config.decoder_len_limit = n;
    }
    if oracle.do_montecarlo {
        config.strategy = DecodeStrategy::MonteCarlo;
    }
    if let Some(n) = oracle.sample_size {
        config.sample_size = n;
    }
    if let Some(seed) = seed_cli {
        config.seed = seed;
    }
    config
}

/// Trainer settings. The output length limit lives only in the decode config.
pub fn build_training_config(
    overrides: &TrainingOverrides,
    flags: &TrainingFlags,
    seed_cli: Option<u64>,
) -> TrainingConfig {
    let mut config = TrainingConfig::new();

    // TOML overrides
    if let Some(n) = overrides.epochs {
        config.epochs = n;
    }
    if let Some(lr) = overrides.lr {
        config.lr = lr;
    }
    if let Some(n) = overrides.batch_size {
        config.batch_size = n;
    }
    if let Some(c) = overrides.clip_grad {
        config.clip_grad = c;
    }
    if let Some(n) = overrides.saving_from {
        config.saving_from = n;
    }
    if let Some(n) = overrides.saving_interval {
        config.saving_interval = n;
    }
    if let Some(p) = overrides.p_forcing {
        config.p_forcing = p;
    }
    if let Some(r) = overrides.reverse_input {
        config.reverse_input = r;
    }
    if let Some(n) = overrides.epoch_start {
        config.epoch_start = n;
    }
    if let Some(n) = overrides.start_size {
        config.start_size = n;
    }
    if let Some(seed) = overrides.seed {
        config.seed = seed;
    }
    if let Some(policy) = overrides.loss_policy {
        config.loss_policy = policy;
    }

    // CLI flags take highest priority
    if let Some(n) = flags.epochs {
        config.epochs = n;
    }
    if let Some(lr) = flags.lr {
        config.lr = lr;
    }
    if let Some(n) = flags.batch_size {
        config.batch_size = n;
    }
    if let Some(c) = flags.clip_grad {
        config.clip_grad = c;
    }
    if flags.reverse_input {
        config.reverse_input = true;
    }
    if let Some(policy) = flags.loss_policy {
        config.loss_policy = policy;
    }
    if let Some(seed) = seed_cli {
        config.seed = seed;
    }
    config
}

pub fn build_oracle_config(base: &OracleConfig, flags: &OracleFlags) -> OracleConfig {
    let mut config = base.clone();
    if let Some(mode) = flags.oracle_mode {
        config.mode = mode;
    }
    if let Some(t) = flags.timeout {
        config.timeout_secs = t;
    }
    config
}

pub fn build_cache_config(base: &CacheConfig, dir_cli: Option<PathBuf>, cache_id_cli: Option<String>) -> CacheConfig {
    let mut config = base.clone();
    if let Some(dir) = dir_cli {
        config.dir = dir;
    }
    if let Some(id) = cache_id_cli {
        config.cache_id = id;
    }
    config
}
