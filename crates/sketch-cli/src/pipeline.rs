//! Subcommand implementations.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use burn::backend::{Autodiff, NdArray};
use reward_cache::{CacheFlushGuard, CacheSummary, DfaOracle, Oracle, OracleEvaluator, RewardCache};
use seq2seq::parser::SemanticParser;
use seq2seq::{
    evaluate, load_datasets, train_mle, train_rl, warm_start, CheckpointStore, Checkpointing,
    NearestNeighborParser, Seq2SeqParser,
};

use crate::config::{
    build_cache_config, build_decode_config, build_model_config, build_oracle_config,
    build_training_config, load_toml, OracleFlags, TrainingFlags,
};
use crate::shutdown::Shutdown;

type TrainBackend = Autodiff<NdArray<f32>>;
type InferBackend = NdArray<f32>;

/// Arguments every subcommand takes.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Dataset name; splits are read from `<data-dir>/<dataset>/{train,dev}.tsv`.
    pub dataset: String,
    /// Path to a config TOML file. Built-in defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Root directory of the datasets.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    /// Directory for model checkpoints.
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,
    /// Override the reward cache directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Checkpoint name prefix.
    #[arg(long, default_value = "model")]
    pub model_id: String,
    /// Seed for shuffling, teacher forcing and Monte Carlo sampling.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub common: CommonArgs,
    pub training: TrainingFlags,
}

/// Arguments for the `train-rl` subcommand.
#[derive(Debug)]
pub struct TrainRlArgs {
    pub common: CommonArgs,
    pub training: TrainingFlags,
    pub oracle: OracleFlags,
    /// Start from this checkpoint instead of warm-starting with MLE.
    pub warm_model_id: Option<String>,
}

/// Arguments for the `eval` subcommand.
#[derive(Debug)]
pub struct EvalArgs {
    pub common: CommonArgs,
    pub training: TrainingFlags,
    pub oracle: OracleFlags,
    /// Checkpoint suffix, e.g. `best` or an epoch number.
    pub checkpoint: String,
    /// Also score predictions by DFA equivalence.
    pub denotation: bool,
    pub outfile: Option<PathBuf>,
}

/// Arguments for the `nearest-neighbor` subcommand.
#[derive(Debug)]
pub struct NearestNeighborArgs {
    pub common: CommonArgs,
    pub outfile: Option<PathBuf>,
}

/// Arguments for the `cache-summary` subcommand.
#[derive(Debug)]
pub struct CacheSummaryArgs {
    pub common: CommonArgs,
    pub cache_id: Option<String>,
}

/// Maximum-likelihood training with dev-perplexity checkpointing.
pub fn run_train(args: TrainArgs, shutdown: &Shutdown) -> anyhow::Result<()> {
    let start = Instant::now();
    let common = &args.common;
    let toml = load_toml(common.config.as_deref())?;
    let decode = build_decode_config(&toml.decode, &args.training, &OracleFlags::default(), common.seed);
    let training = build_training_config(&toml.training, &args.training, common.seed);

    let data = load_datasets(&common.data_dir, &common.dataset, decode.decoder_len_limit)?;
    let model_config = build_model_config(&toml.model, &data);
    let device = Default::default();
    let store = CheckpointStore::new(&common.checkpoint_dir, &common.dataset);

    tracing::info!(
        dataset = common.dataset,
        model_id = common.model_id,
        epochs = training.epochs,
        lr = training.lr,
        batch_size = training.batch_size,
        "Starting supervised training"
    );
    train_mle(
        &training,
        &model_config,
        model_config.init::<TrainBackend>(&device),
        &data.train,
        &data.dev,
        Some(Checkpointing {
            store: &store,
            model_id: &common.model_id,
        }),
        shutdown.stop(),
        &device,
    )?;

    println!("\n--- Training Summary ---");
    println!("Dataset: {}", common.dataset);
    println!("Interrupted: {}", shutdown.stop().load(Ordering::Relaxed));
    println!("Checkpoints: {}", store.stem(&common.model_id).display());
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Warm start, then oracle-guided training through the reward cache.
pub fn run_train_rl(args: TrainRlArgs, shutdown: &Shutdown) -> anyhow::Result<()> {
    let start = Instant::now();
    let common = &args.common;
    let toml = load_toml(common.config.as_deref())?;
    let decode = build_decode_config(&toml.decode, &args.training, &args.oracle, common.seed);
    decode.validate()?;
    let training = build_training_config(&toml.training, &args.training, common.seed);
    training.validate()?;
    let oracle_config = build_oracle_config(&toml.oracle, &args.oracle);
    let cache_config = build_cache_config(&toml.cache, common.cache_dir.clone(), args.oracle.cache_id.clone());

    let data = load_datasets(&common.data_dir, &common.dataset, decode.decoder_len_limit)?;
    let model_config = build_model_config(&toml.model, &data);
    let device = Default::default();
    let store = CheckpointStore::new(&common.checkpoint_dir, &common.dataset);

    let model = warm_start::<TrainBackend>(
        &training,
        &model_config,
        &data,
        &store,
        &common.model_id,
        args.warm_model_id.as_deref(),
        shutdown.stop(),
        &device,
    )?;
    if shutdown.stop().load(Ordering::Relaxed) {
        tracing::warn!("Interrupted during warm start, skipping RL training");
        return Ok(());
    }

    let oracle = Oracle::from_config(&oracle_config, &common.dataset)?;
    let cache_path = cache_config.path_for(&common.dataset);
    let mut cache = CacheFlushGuard::new(
        RewardCache::open(&cache_path, oracle)?.with_abort(shutdown.abort_flag()),
    );
    tracing::info!(
        mode = ?oracle_config.mode,
        entries = cache.len(),
        path = %cache_path.display(),
        "Opened reward cache"
    );

    let trained = train_rl(
        &training,
        &decode,
        &model_config,
        model,
        &data,
        &mut cache,
        Checkpointing {
            store: &store,
            model_id: &common.model_id,
        },
        shutdown.stop(),
        &device,
    );
    if let Err(e) = trained {
        if shutdown.is_aborted() {
            drop(cache);
            tracing::warn!(path = %cache_path.display(), "RL training aborted, reward cache flushed");
        }
        return Err(e);
    }

    let stats = cache.stats();
    println!("\n--- RL Training Summary ---");
    println!("Dataset: {}", common.dataset);
    println!("Interrupted: {}", shutdown.stop().load(Ordering::Relaxed));
    println!("Cache: {} ({} entries)", cache_path.display(), stats.entries);
    println!("Oracle calls: {} (cache hits: {})", stats.misses, stats.hits);
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Greedy-decode dev with a saved checkpoint and report accuracy.
pub fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    let common = &args.common;
    let toml = load_toml(common.config.as_deref())?;
    let decode = build_decode_config(&toml.decode, &args.training, &args.oracle, common.seed);
    let training = build_training_config(&toml.training, &args.training, common.seed);

    let data = load_datasets(&common.data_dir, &common.dataset, decode.decoder_len_limit)?;
    let store = CheckpointStore::new(&common.checkpoint_dir, &common.dataset);
    let model_id = format!("{}-{}", common.model_id, args.checkpoint);
    let model_config = store.load_config(&model_id)?;
    anyhow::ensure!(
        model_config.input_vocab == data.input_indexer.len()
            && model_config.output_vocab == data.output_indexer.len(),
        "checkpoint {model_id} was trained on different vocabularies ({}/{} vs {}/{})",
        model_config.input_vocab,
        model_config.output_vocab,
        data.input_indexer.len(),
        data.output_indexer.len()
    );
    let device = Default::default();
    let model = store.load::<InferBackend>(&model_config, &model_id, &device)?;
    let parser = Seq2SeqParser::new(
        model,
        data.output_indexer.clone(),
        training.batch_size,
        decode.decoder_len_limit,
        training.reverse_input,
        device,
    );

    let mut dfa = if args.denotation {
        Some(DfaOracle::new(&build_oracle_config(&toml.oracle, &args.oracle))?)
    } else {
        None
    };
    let denotation = dfa.as_mut().map(|o| o as &mut dyn OracleEvaluator);
    report(&common.dataset, &data.dev, &parser, denotation, args.outfile.as_deref())
}

/// Evaluate the nearest-neighbor baseline on dev.
pub fn run_nearest_neighbor(args: NearestNeighborArgs) -> anyhow::Result<()> {
    let common = &args.common;
    let toml = load_toml(common.config.as_deref())?;
    let data = load_datasets(&common.data_dir, &common.dataset, toml.decode.decoder_len_limit)?;
    let parser = NearestNeighborParser::new(&data.train);
    report(&common.dataset, &data.dev, &parser, None, args.outfile.as_deref())
}

fn report<P: SemanticParser>(
    dataset: &str,
    dev: &[seq2seq::Example],
    parser: &P,
    denotation: Option<&mut dyn OracleEvaluator>,
    outfile: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let report = evaluate(dev, parser, denotation, outfile)?;
    report.log();

    println!("\n--- Evaluation Summary ---");
    println!("Dataset: {dataset}");
    println!("Examples: {}", report.examples);
    println!("Exact match: {:.1}%", report.exact_match_rate() * 100.0);
    println!("Token accuracy: {:.1}%", report.token_accuracy() * 100.0);
    if let Some(rate) = report.denotation_rate() {
        println!("Denotation match: {:.1}%", rate * 100.0);
    }
    Ok(())
}

/// Print statistics from a reward cache file.
pub fn run_cache_summary(args: CacheSummaryArgs) -> anyhow::Result<()> {
    let common = &args.common;
    let toml = load_toml(common.config.as_deref())?;
    let cache_config = build_cache_config(&toml.cache, common.cache_dir.clone(), args.cache_id);
    let path = cache_config.path_for(&common.dataset);
    anyhow::ensure!(path.exists(), "no reward cache at {}", path.display());
    let summary = CacheSummary::from_path(&path)?;

    println!("--- Reward Cache Summary ---");
    println!("File: {}", path.display());
    println!("Entries: {}", summary.entries);
    println!("Coverage: {} ({:.1}%)", summary.coverage, summary.coverage_rate() * 100.0);
    println!("Matches: {} ({:.1}%)", summary.matches, summary.match_rate() * 100.0);
    println!("Mean reward: {:.4}", summary.mean_reward);
    Ok(())
}
