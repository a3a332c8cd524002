//! Integration tests for the seq2seq crate.
//!
//! Train tiny models end to end on synthetic question/sketch pairs: MLE
//! training, the RL loop against an in-process oracle and reward cache,
//! checkpoints, warm starts, and evaluation. All use the NdArray backend.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use tempfile::TempDir;

use reward_cache::mocks::MockOracle;
use reward_cache::{CacheFlushGuard, CacheSummary, RewardCache};
use seq2seq::training::data::{index_datasets, make_batches, sort_by_input_len, EOS_ID, SOS_ID};
use seq2seq::training::trainer::dev_perplexity;
use seq2seq::{
    evaluate, load_datasets, train_mle, train_rl, warm_start, CheckpointStore, Checkpointing, Dataset,
    NearestNeighborParser, RewardLossPolicy, Seq2SeqConfig, Seq2SeqParser, TrainingConfig,
};
use sketch_decode::{batched_beam_search, naive_beam_search, DecodeConfig, DecodeStrategy, SearchParams};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const PAIRS: &[(&str, &str)] = &[
    ("lines with a vowel", "contains ( <VOW> )"),
    ("lines starting with a number", "startwith ( <NUM> )"),
    ("lines ending in a letter", "endwith ( <LET> )"),
    ("lines with the word dog", "contains ( dog )"),
    ("lines starting with a vowel", "startwith ( <VOW> )"),
    ("lines ending in a number", "endwith ( <NUM> )"),
];

fn owned(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(x, y)| (x.to_string(), y.to_string())).collect()
}

fn toy_dataset() -> Dataset {
    index_datasets(&owned(PAIRS), &owned(&PAIRS[..3]), 8)
}

fn toy_model_config(data: &Dataset) -> Seq2SeqConfig {
    Seq2SeqConfig::new(data.input_indexer.len(), data.output_indexer.len())
        .with_input_dim(8)
        .with_output_dim(8)
        .with_hidden_size(12)
        .with_emb_dropout(0.0)
        .with_rnn_dropout(0.0)
}

fn toy_training_config() -> TrainingConfig {
    TrainingConfig::new()
        .with_batch_size(2)
        .with_lr(0.01)
        .with_saving_from(1)
        .with_saving_interval(1)
}

fn write_split(dir: &Path, name: &str, pairs: &[(&str, &str)]) {
    let body: String = pairs.iter().map(|(x, y)| format!("{x}\t{y}\n")).collect();
    std::fs::write(dir.join(name), body).unwrap();
}

// ---------------------------------------------------------------------------
// Supervised training
// ---------------------------------------------------------------------------

#[test]
fn test_mle_training_lowers_perplexity() {
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let model = model_config.init::<TestAutodiffBackend>(&device);

    let mut train = data.train.clone();
    sort_by_input_len(&mut train);
    let batches = make_batches(&train, 2, false);
    let before = dev_perplexity(&model.valid(), &batches, &device);

    let config = toy_training_config().with_epochs(30);
    let shutdown = AtomicBool::new(false);
    let model = train_mle(&config, &model_config, model, &data.train, &data.dev, None, &shutdown, &device)
        .unwrap();
    let after = dev_perplexity(&model.valid(), &batches, &device);

    assert!(after.is_finite());
    assert!(after < before, "perplexity did not drop: {before} -> {after}");
}

#[test]
fn test_mle_checkpoints() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");
    let config = toy_training_config().with_epochs(3).with_saving_from(2);
    let shutdown = AtomicBool::new(false);

    train_mle(
        &config,
        &model_config,
        model_config.init::<TestAutodiffBackend>(&device),
        &data.train,
        &data.dev,
        Some(Checkpointing {
            store: &store,
            model_id: "mle",
        }),
        &shutdown,
        &device,
    )
    .unwrap();

    assert!(!store.exists("mle-1"));
    assert!(store.exists("mle-2"));
    assert!(store.exists("mle-3"));
    assert!(store.exists("mle-best"));
    let meta = store.load_meta("mle-best").unwrap();
    assert!(meta.epoch >= 2);
    assert!(meta.dev_metric.is_some());
}

// ---------------------------------------------------------------------------
// Decoding on the real model
// ---------------------------------------------------------------------------

#[test]
fn test_batched_beam_matches_naive_on_model() {
    let device = Default::default();
    let data = toy_dataset();
    let model = toy_model_config(&data).init::<TestBackend>(&device);

    let mut examples = data.train.clone();
    sort_by_input_len(&mut examples);
    let batch = &make_batches(&examples, 3, false)[0];
    let enc = model.encode(batch.input_tensor::<TestBackend>(&device), &batch.input_lens);
    let params = SearchParams {
        width: 3,
        max_len: 6,
        sos: SOS_ID,
        eos: EOS_ID,
    };

    let naive = naive_beam_search(&model, &enc, &params).unwrap();
    let batched = batched_beam_search(&model, &enc, &params).unwrap();
    assert_eq!(naive.tokens, batched.tokens);

    let a: Vec<f32> = naive.log_probs.into_data().to_vec().unwrap();
    let b: Vec<f32> = batched.log_probs.into_data().to_vec().unwrap();
    assert_eq!(a.len(), 9);
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-4, "{x} vs {y}");
    }
}

// ---------------------------------------------------------------------------
// Oracle-guided training
// ---------------------------------------------------------------------------

fn decode_config(strategy: DecodeStrategy) -> DecodeConfig {
    DecodeConfig {
        strategy,
        sample_size: 2,
        decoder_len_limit: 5,
        seed: 7,
    }
}

#[test]
fn test_rl_loop_writes_cache_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");
    let cache_path = dir.path().join("toy-cache.parquet");

    let oracle = MockOracle::new().with_match("contains ( <VOW> )");
    let mut cache = CacheFlushGuard::new(RewardCache::open(&cache_path, oracle).unwrap());
    let config = toy_training_config()
        .with_epochs(2)
        .with_loss_policy(RewardLossPolicy::Origin);
    let shutdown = AtomicBool::new(false);

    train_rl(
        &config,
        &decode_config(DecodeStrategy::MonteCarlo),
        &model_config,
        model_config.init::<TestAutodiffBackend>(&device),
        &data,
        &mut cache,
        Checkpointing {
            store: &store,
            model_id: "rl",
        },
        &shutdown,
        &device,
    )
    .unwrap();

    assert!(store.exists("rl-1"));
    assert!(store.exists("rl-2"));
    assert!(store.exists("rl-best"));
    assert!(store.load_meta("rl-best").unwrap().dev_metric.unwrap() <= 0.0);

    assert!(cache.oracle().calls() > 0);
    assert_eq!(cache.stats().pending, 0);
    assert!(cache_path.exists());
    let summary = CacheSummary::from_path(&cache_path).unwrap();
    assert_eq!(summary.entries, cache.len());
}

#[test]
fn test_rl_cache_is_reused_across_runs() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");
    let cache_path = dir.path().join("toy-cache.parquet");
    let config = toy_training_config().with_epochs(1).with_lr(1e-9);
    let shutdown = AtomicBool::new(false);
    let model = model_config.init::<TestAutodiffBackend>(&device);

    let run = |oracle: MockOracle| -> usize {
        let mut cache = CacheFlushGuard::new(RewardCache::open(&cache_path, oracle).unwrap());
        train_rl(
            &config,
            &decode_config(DecodeStrategy::Beam),
            &model_config,
            model.clone(),
            &data,
            &mut cache,
            Checkpointing {
                store: &store,
                model_id: "rl",
            },
            &shutdown,
            &device,
        )
        .unwrap();
        cache.oracle().calls()
    };

    let first = run(MockOracle::new());
    assert!(first > 0);
    let second = run(MockOracle::new());
    assert!(second < first, "second run made {second} oracle calls, first made {first}");
}

#[test]
fn test_rl_shutdown_stops_before_first_batch() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");
    let mut cache =
        CacheFlushGuard::new(RewardCache::open(dir.path().join("c.parquet"), MockOracle::new()).unwrap());
    let shutdown = AtomicBool::new(true);

    train_rl(
        &toy_training_config().with_epochs(5),
        &decode_config(DecodeStrategy::BatchedBeam),
        &model_config,
        model_config.init::<TestAutodiffBackend>(&device),
        &data,
        &mut cache,
        Checkpointing {
            store: &store,
            model_id: "rl",
        },
        &shutdown,
        &device,
    )
    .unwrap();

    assert_eq!(cache.oracle().calls(), 0);
    assert!(!store.exists("rl-1"));
}

#[test]
fn test_rl_oracle_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");

    struct Refusing;
    impl reward_cache::OracleEvaluator for Refusing {
        fn cache_key(&self, candidate: &str, ctx: &reward_cache::OracleContext) -> String {
            format!("{}:{}\t{candidate}", ctx.split, ctx.example_id)
        }
        fn evaluate(
            &mut self,
            candidate: &str,
            _ctx: &reward_cache::OracleContext,
        ) -> Result<reward_cache::OracleOutcome, reward_cache::OracleError> {
            Err(reward_cache::OracleError::Rejected(candidate.to_string()))
        }
    }

    let mut cache = CacheFlushGuard::new(RewardCache::open(dir.path().join("c.parquet"), Refusing).unwrap());
    let shutdown = AtomicBool::new(false);
    let result = train_rl(
        &toy_training_config().with_epochs(1),
        &decode_config(DecodeStrategy::Beam),
        &model_config,
        model_config.init::<TestAutodiffBackend>(&device),
        &data,
        &mut cache,
        Checkpointing {
            store: &store,
            model_id: "rl",
        },
        &shutdown,
        &device,
    );
    assert!(result.is_err());
    assert!(!store.exists("rl-1"));
}

#[test]
fn test_rl_rejects_sample_size_too_wide_for_dev_beam() {
    // Monte Carlo may draw more samples than there are tokens, but dev
    // evaluation runs beam search with the same width.
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");
    let mut cache =
        CacheFlushGuard::new(RewardCache::open(dir.path().join("c.parquet"), MockOracle::new()).unwrap());
    let shutdown = AtomicBool::new(false);
    let decode = DecodeConfig {
        sample_size: data.output_indexer.len() + 1,
        ..decode_config(DecodeStrategy::MonteCarlo)
    };

    let result = train_rl(
        &toy_training_config().with_epochs(1),
        &decode,
        &model_config,
        model_config.init::<TestAutodiffBackend>(&device),
        &data,
        &mut cache,
        Checkpointing {
            store: &store,
            model_id: "rl",
        },
        &shutdown,
        &device,
    );
    assert!(result.is_err());
    assert_eq!(cache.oracle().calls(), 0, "rejected before any training batch");
    assert!(!store.exists("rl-1"));
}

// ---------------------------------------------------------------------------
// Warm start
// ---------------------------------------------------------------------------

#[test]
fn test_warm_start_trains_then_loads() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model_config = toy_model_config(&data);
    let store = CheckpointStore::new(dir.path(), "toy");
    let config = toy_training_config().with_epoch_start(2).with_start_size(4);
    let shutdown = AtomicBool::new(false);

    let trained = warm_start::<TestAutodiffBackend>(
        &config,
        &model_config,
        &data,
        &store,
        "exp",
        None,
        &shutdown,
        &device,
    )
    .unwrap();
    assert!(store.exists("exp-warm"));
    assert_eq!(store.load_meta("exp-warm").unwrap().epoch, 2);

    let loaded = warm_start::<TestAutodiffBackend>(
        &config,
        &model_config,
        &data,
        &store,
        "other",
        Some("exp-warm"),
        &shutdown,
        &device,
    )
    .unwrap();
    assert!(!store.exists("other-warm"));

    let mut examples = data.dev.clone();
    sort_by_input_len(&mut examples);
    let batches = make_batches(&examples, 3, false);
    let a = dev_perplexity(&trained.valid(), &batches, &device);
    let b = dev_perplexity(&loaded.valid(), &batches, &device);
    assert!((a - b).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[test]
fn test_seq2seq_parser_evaluates_dev() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let data = toy_dataset();
    let model = toy_model_config(&data).init::<TestBackend>(&device);
    let parser = Seq2SeqParser::new(model, data.output_indexer.clone(), 2, 6, false, device);
    let out = dir.path().join("preds.tsv");

    let mut oracle = MockOracle::new();
    let report = evaluate(&data.dev, &parser, Some(&mut oracle), Some(&out)).unwrap();
    assert_eq!(report.examples, data.dev.len());
    assert!(report.tokens_correct <= report.total_tokens);
    assert_eq!(report.denotation_match, Some(0));
    assert_eq!(oracle.calls(), data.dev.len());

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written.lines().count(), data.dev.len());
    assert!(written.starts_with("lines with a vowel\t"));
}

#[test]
fn test_nearest_neighbor_on_loaded_dataset() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("toy");
    std::fs::create_dir_all(&root).unwrap();
    write_split(&root, "train.tsv", PAIRS);
    write_split(
        &root,
        "dev.tsv",
        &[("lines ending in the number", "endwith ( <NUM> )"), ("lines with dog", "contains ( dog )")],
    );

    let data = load_datasets(dir.path(), "toy", 65).unwrap();
    assert_eq!(data.train.len(), PAIRS.len());
    assert_eq!(data.dev.len(), 2);

    let parser = NearestNeighborParser::new(&data.train);
    let report = evaluate(&data.dev, &parser, None, None).unwrap();
    assert_eq!(report.exact_match, 2);
    assert_eq!(report.tokens_correct, report.total_tokens);
}
