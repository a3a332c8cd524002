//! Supervised (MLE) and oracle-guided (RL) training loops.
//!
//! Both loops run Adam with gradient-norm clipping over batches built from
//! length-sorted examples, visiting batches in a seeded random order. The
//! shutdown flag is checked between batches so an interrupt leaves the model
//! and the reward cache in a consistent state.

use std::sync::atomic::{AtomicBool, Ordering};

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reward_cache::{BatchRewards, CacheFlushGuard, OracleContext, OracleError, OracleEvaluator, RewardCache};
use sketch_decode::{decode, Candidates, DecodeConfig, DecodeStrategy, StepDecoder};

use crate::model::{Seq2Seq, Seq2SeqConfig};
use crate::training::checkpoint::{CheckpointMeta, CheckpointStore};
use crate::training::data::{
    make_batches, sort_by_input_len, Batch, Dataset, Example, Indexer, DEV_SPLIT, EOS_ID, SOS_ID,
    TRAIN_SPLIT,
};
use crate::training::loss::{supervised_loss, RewardLossPolicy};
use crate::training::metrics::{RunningAvg, TokenLoss};

/// Hyper-parameters shared by the MLE and RL trainers.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 100)]
    pub epochs: usize,
    /// Adam learning rate.
    #[config(default = 1e-3)]
    pub lr: f64,
    #[config(default = 32)]
    pub batch_size: usize,
    /// Maximum gradient norm.
    #[config(default = 10.0)]
    pub clip_grad: f64,
    /// First epoch that is evaluated on dev and may be checkpointed.
    #[config(default = 50)]
    pub saving_from: usize,
    /// Epochs between numbered checkpoints (MLE).
    #[config(default = 10)]
    pub saving_interval: usize,
    /// Probability that a batch is decoded with teacher forcing.
    #[config(default = 1.0)]
    pub p_forcing: f64,
    /// Feed source tokens in reverse order.
    #[config(default = false)]
    pub reverse_input: bool,
    /// Warm-start MLE epochs before RL.
    #[config(default = 20)]
    pub epoch_start: usize,
    /// Warm-start on this many training examples (0 = all).
    #[config(default = 0)]
    pub start_size: usize,
    /// Seed for batch shuffling and teacher-forcing draws.
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = "RewardLossPolicy::Origin")]
    pub loss_policy: RewardLossPolicy,
}

impl TrainingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be >= 1");
        anyhow::ensure!(self.saving_interval > 0, "saving_interval must be >= 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.p_forcing),
            "p_forcing must be in [0, 1], got {}",
            self.p_forcing
        );
        anyhow::ensure!(self.lr > 0.0, "lr must be positive, got {}", self.lr);
        anyhow::ensure!(self.clip_grad > 0.0, "clip_grad must be positive, got {}", self.clip_grad);
        Ok(())
    }
}

/// Where a training run writes its checkpoints.
#[derive(Debug, Clone, Copy)]
pub struct Checkpointing<'a> {
    pub store: &'a CheckpointStore,
    pub model_id: &'a str,
}

impl Checkpointing<'_> {
    fn save<B: Backend>(
        &self,
        model: &Seq2Seq<B>,
        config: &Seq2SeqConfig,
        suffix: &str,
        meta: &CheckpointMeta,
    ) -> anyhow::Result<()> {
        self.store
            .save(model, config, &format!("{}-{suffix}", self.model_id), meta)?;
        Ok(())
    }
}

fn progress_bar(len: usize, label: String) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(label);
    pb
}

fn sorted(examples: &[Example]) -> Vec<Example> {
    let mut examples = examples.to_vec();
    sort_by_input_len(&mut examples);
    examples
}

// ---------------------------------------------------------------------------
// Supervised training
// ---------------------------------------------------------------------------

/// Mean per-token loss of `model` on `batches` with teacher forcing, as
/// perplexity.
pub fn dev_perplexity<B: Backend>(model: &Seq2Seq<B>, batches: &[Batch], device: &B::Device) -> f64 {
    let mut acc = TokenLoss::default();
    for batch in batches {
        let enc = model.encode(batch.input_tensor::<B>(device), &batch.input_lens);
        let (loss, tokens) = supervised_loss(model, &enc, batch, true);
        let loss: f64 = loss.into_scalar().elem();
        acc.update(loss, tokens);
    }
    acc.perplexity()
}

/// Maximum-likelihood training.
///
/// With `checkpoints`, every epoch from `saving_from` on is scored by dev
/// perplexity: `"-best"` is written whenever it improves and `"-<epoch>"`
/// every `saving_interval` epochs. Without, the model is only returned.
#[allow(clippy::too_many_arguments)]
pub fn train_mle<B: AutodiffBackend>(
    config: &TrainingConfig,
    model_config: &Seq2SeqConfig,
    mut model: Seq2Seq<B>,
    train: &[Example],
    dev: &[Example],
    checkpoints: Option<Checkpointing<'_>>,
    shutdown: &AtomicBool,
    device: &B::Device,
) -> anyhow::Result<Seq2Seq<B>> {
    config.validate()?;
    anyhow::ensure!(!train.is_empty(), "no training examples");

    let train = sorted(train);
    let dev = sorted(dev);
    let train_batches = make_batches(&train, config.batch_size, config.reverse_input);
    let dev_batches = make_batches(&dev, config.batch_size, config.reverse_input);

    let mut optimizer = AdamConfig::new()
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.clip_grad as f32)))
        .init();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut order: Vec<usize> = (0..train_batches.len()).collect();
    let mut best_perplexity = f64::INFINITY;

    tracing::info!(
        examples = train.len(),
        batches = train_batches.len(),
        epochs = config.epochs,
        "Starting MLE training"
    );

    for epoch in 1..=config.epochs {
        order.shuffle(&mut rng);
        let mut epoch_loss = TokenLoss::default();
        let pb = progress_bar(order.len(), format!("MLE epoch {epoch}"));

        for &bi in &order {
            if shutdown.load(Ordering::Relaxed) {
                pb.abandon();
                tracing::warn!(epoch, "Shutdown requested, stopping MLE training");
                return Ok(model);
            }
            let batch = &train_batches[bi];
            let enc = model.encode(batch.input_tensor::<B>(device), &batch.input_lens);
            let forcing = rng.gen::<f64>() < config.p_forcing;
            let (loss, tokens) = supervised_loss(&model, &enc, batch, forcing);
            let loss_val: f64 = loss.clone().into_scalar().elem();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(config.lr, model, grads);
            epoch_loss.update(loss_val, tokens);
            pb.inc(1);
        }
        pb.finish_and_clear();
        tracing::info!(epoch, loss = epoch_loss.mean(), tokens = epoch_loss.tokens(), "MLE epoch done");

        let Some(ckpt) = checkpoints else { continue };
        if epoch < config.saving_from {
            continue;
        }
        let perplexity = dev_perplexity(&model.valid(), &dev_batches, device);
        tracing::info!(epoch, dev_perplexity = perplexity, "Dev evaluation");
        let meta = CheckpointMeta {
            epoch,
            dev_metric: Some(perplexity),
        };
        if perplexity < best_perplexity {
            best_perplexity = perplexity;
            ckpt.save(&model, model_config, "best", &meta)?;
        }
        if (epoch - config.saving_from) % config.saving_interval == 0 {
            ckpt.save(&model, model_config, &epoch.to_string(), &meta)?;
        }
    }

    Ok(model)
}

/// Initial model for RL: `warm_model_id` loaded from `store`, or a fresh
/// model trained for `epoch_start` MLE epochs on the first `start_size`
/// training examples and saved as `"<model_id>-warm"`.
#[allow(clippy::too_many_arguments)]
pub fn warm_start<B: AutodiffBackend>(
    config: &TrainingConfig,
    model_config: &Seq2SeqConfig,
    data: &Dataset,
    store: &CheckpointStore,
    model_id: &str,
    warm_model_id: Option<&str>,
    shutdown: &AtomicBool,
    device: &B::Device,
) -> anyhow::Result<Seq2Seq<B>> {
    if let Some(warm_id) = warm_model_id {
        tracing::info!(warm_model_id = warm_id, "Loading warm-start model");
        return store.load(model_config, warm_id, device);
    }

    let take = match config.start_size {
        0 => data.train.len(),
        n => n.min(data.train.len()),
    };
    tracing::info!(examples = take, epochs = config.epoch_start, "Warm-starting with MLE");
    let warm_config = config.clone().with_epochs(config.epoch_start);
    let model = train_mle(
        &warm_config,
        model_config,
        model_config.init::<B>(device),
        &data.train[..take],
        &data.dev,
        None,
        shutdown,
        device,
    )?;
    let meta = CheckpointMeta {
        epoch: config.epoch_start,
        dev_metric: None,
    };
    store.save(&model, model_config, &format!("{model_id}-warm"), &meta)?;
    Ok(model)
}

// ---------------------------------------------------------------------------
// Oracle-guided training
// ---------------------------------------------------------------------------

/// Dev-set oracle evaluation summed over batches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OracleEval {
    pub examples: usize,
    pub coverage: usize,
    pub matches: usize,
    /// Mean over batches of the policy's reported reward.
    pub reward: f64,
}

fn score_candidates<O: OracleEvaluator>(
    cache: &mut RewardCache<O>,
    tokens: &[Vec<Vec<usize>>],
    batch: &Batch,
    examples: &[Example],
    indexer: &Indexer,
    split: &str,
) -> Result<BatchRewards, OracleError> {
    let contexts: Vec<OracleContext> = batch
        .indices
        .iter()
        .map(|&i| {
            let ex = &examples[i];
            OracleContext::new(split, ex.id, ex.y_tok.join(" "))
        })
        .collect();
    let candidates: Vec<Vec<Vec<String>>> = tokens
        .iter()
        .map(|samples| samples.iter().map(|t| indexer.symbols(t)).collect())
        .collect();
    cache.score_batch(&candidates, &contexts)
}

fn rewards_tensor<B: Backend>(rewards: &[Vec<f32>], device: &B::Device) -> Tensor<B, 2> {
    let rows = rewards.len();
    let cols = rewards.first().map_or(0, Vec::len);
    let flat: Vec<f32> = rewards.iter().flatten().copied().collect();
    Tensor::from_data(TensorData::new(flat, [rows, cols]), device)
}

/// Score one batch of candidates and turn them into the policy loss.
#[allow(clippy::too_many_arguments)]
fn candidate_loss<B: Backend, O: OracleEvaluator>(
    candidates: Candidates<B>,
    cache: &mut RewardCache<O>,
    batch: &Batch,
    examples: &[Example],
    indexer: &Indexer,
    split: &str,
    policy: RewardLossPolicy,
    device: &B::Device,
) -> anyhow::Result<(Tensor<B, 1>, f64, BatchRewards)> {
    let scored = score_candidates(cache, &candidates.tokens, batch, examples, indexer, split)?;
    let rewards = rewards_tensor::<B>(&scored.rewards, device);
    let (loss, reward) = policy.compute(candidates.log_probs, rewards)?;
    Ok((loss, reward, scored))
}

/// Strategy used to decode dev: Monte Carlo is replaced by per-example beam.
pub fn dev_strategy(strategy: DecodeStrategy) -> DecodeStrategy {
    match strategy {
        DecodeStrategy::MonteCarlo => DecodeStrategy::Beam,
        other => other,
    }
}

/// Decode dev with [`dev_strategy`] and score the candidates with the oracle.
#[allow(clippy::too_many_arguments)]
pub fn oracle_eval<B: Backend, O: OracleEvaluator>(
    model: &Seq2Seq<B>,
    batches: &[Batch],
    examples: &[Example],
    indexer: &Indexer,
    cache: &mut RewardCache<O>,
    decode_config: &DecodeConfig,
    policy: RewardLossPolicy,
    device: &B::Device,
) -> anyhow::Result<OracleEval> {
    let strategy = dev_strategy(decode_config.strategy);
    let params = decode_config.params(SOS_ID, EOS_ID);
    let mut rng = StdRng::seed_from_u64(decode_config.seed);

    let mut eval = OracleEval::default();
    let mut reward_sum = 0.0;
    for batch in batches {
        let enc = model.encode(batch.input_tensor::<B>(device), &batch.input_lens);
        let candidates = decode(model, &enc, strategy, &params, &mut rng)?;
        let (_, reward, scored) =
            candidate_loss(candidates, cache, batch, examples, indexer, DEV_SPLIT, policy, device)?;
        eval.examples += batch.len();
        eval.coverage += scored.num_coverage;
        eval.matches += scored.num_match;
        reward_sum += reward;
    }
    if !batches.is_empty() {
        eval.reward = reward_sum / batches.len() as f64;
    }
    Ok(eval)
}

/// RL training against the reward oracle.
///
/// Every batch is decoded with `decode_config.strategy`, scored through
/// `cache`, and trained on the reward-weighted loss. After each epoch the
/// model is evaluated on dev, saved as `"-<epoch>"`, the cache is rewritten,
/// and `"-best"` is saved when the dev match count has not decreased.
/// Oracle errors abort training; the caller's guard still flushes the cache.
#[allow(clippy::too_many_arguments)]
pub fn train_rl<B: AutodiffBackend, O: OracleEvaluator>(
    config: &TrainingConfig,
    decode_config: &DecodeConfig,
    model_config: &Seq2SeqConfig,
    mut model: Seq2Seq<B>,
    data: &Dataset,
    cache: &mut CacheFlushGuard<O>,
    checkpoints: Checkpointing<'_>,
    shutdown: &AtomicBool,
    device: &B::Device,
) -> anyhow::Result<Seq2Seq<B>> {
    config.validate()?;
    decode_config.validate()?;
    anyhow::ensure!(!data.train.is_empty(), "no training examples");

    let train = sorted(&data.train);
    let dev = sorted(&data.dev);
    let train_batches = make_batches(&train, config.batch_size, config.reverse_input);
    let dev_batches = make_batches(&dev, config.batch_size, config.reverse_input);
    let params = decode_config.params(SOS_ID, EOS_ID);
    let eval_strategy = dev_strategy(decode_config.strategy);
    if eval_strategy != decode_config.strategy {
        tracing::info!(
            train = ?decode_config.strategy,
            dev = ?eval_strategy,
            "Dev evaluation decodes with beam search"
        );
    }
    // Beam search needs `sample_size` distinct first tokens; fail before the
    // first epoch rather than at the first dev evaluation.
    params.validate_beam(model.vocab_size())?;

    let mut optimizer = AdamConfig::new()
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.clip_grad as f32)))
        .init();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut sample_rng = StdRng::seed_from_u64(decode_config.seed);
    let mut order: Vec<usize> = (0..train_batches.len()).collect();
    let mut best_metric = f64::INFINITY;
    let mut stats = RunningAvg::new();

    tracing::info!(
        examples = train.len(),
        batches = train_batches.len(),
        strategy = ?decode_config.strategy,
        sample_size = decode_config.sample_size,
        loss_policy = %config.loss_policy,
        "Starting RL training"
    );

    'epochs: for epoch in 1..=config.epochs {
        order.shuffle(&mut rng);
        stats.reset();
        let pb = progress_bar(order.len(), format!("RL epoch {epoch}"));

        for (i, &bi) in order.iter().enumerate() {
            if shutdown.load(Ordering::Relaxed) {
                pb.abandon();
                tracing::warn!(epoch, batch = i, "Shutdown requested, stopping RL training");
                break 'epochs;
            }
            let batch = &train_batches[bi];
            let enc = model.encode(batch.input_tensor::<B>(device), &batch.input_lens);
            let candidates = decode(&model, &enc, decode_config.strategy, &params, &mut sample_rng)?;
            let (loss, reward, scored) = candidate_loss(
                candidates,
                cache,
                batch,
                &train,
                &data.output_indexer,
                TRAIN_SPLIT,
                config.loss_policy,
                device,
            )?;
            let loss_val: f64 = loss.clone().into_scalar().elem();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(config.lr, model, grads);
            stats.update(loss_val, reward, scored.num_coverage, scored.num_match, batch.len());
            tracing::debug!(
                epoch,
                batch = i,
                coverage = scored.num_coverage,
                matches = scored.num_match,
                loss = loss_val,
                reward,
                "RL batch"
            );
            pb.inc(1);
        }
        pb.finish_and_clear();

        let cache_stats = cache.stats();
        tracing::info!(
            epoch,
            coverage = stats.coverage,
            matches = stats.matches,
            loss = stats.mean_loss(),
            reward = stats.mean_reward(),
            cache_hits = cache_stats.hits,
            cache_misses = cache_stats.misses,
            "RL epoch done: {}",
            stats.display()
        );

        let eval = oracle_eval(
            &model.valid(),
            &dev_batches,
            &dev,
            &data.output_indexer,
            cache,
            decode_config,
            config.loss_policy,
            device,
        )?;
        let metric = -(eval.matches as f64);
        tracing::info!(
            epoch,
            coverage = eval.coverage,
            matches = eval.matches,
            examples = eval.examples,
            reward = eval.reward,
            "Dev oracle evaluation"
        );

        let meta = CheckpointMeta {
            epoch,
            dev_metric: Some(metric),
        };
        checkpoints.save(&model, model_config, &epoch.to_string(), &meta)?;
        if cache.rewrite()? {
            tracing::info!(epoch, entries = cache.len(), path = %cache.path().display(), "Reward cache rewritten");
        }
        if metric <= best_metric {
            best_metric = metric;
            checkpoints.save(&model, model_config, "best", &meta)?;
        }
    }

    cache.finish()?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use reward_cache::mocks::MockOracle;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_training_defaults() {
        let config = TrainingConfig::new();
        assert_eq!(config.epochs, 100);
        assert!((config.lr - 1e-3).abs() < 1e-12);
        assert_eq!(config.batch_size, 32);
        assert!((config.clip_grad - 10.0).abs() < 1e-12);
        assert_eq!(config.saving_from, 50);
        assert_eq!(config.saving_interval, 10);
        assert!(!config.reverse_input);
        assert_eq!(config.epoch_start, 20);
        assert_eq!(config.start_size, 0);
        assert_eq!(config.loss_policy, RewardLossPolicy::Origin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(TrainingConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::new().with_saving_interval(0).validate().is_err());
        assert!(TrainingConfig::new().with_p_forcing(1.5).validate().is_err());
    }

    #[test]
    fn test_dev_strategy_never_samples() {
        assert_eq!(dev_strategy(DecodeStrategy::MonteCarlo), DecodeStrategy::Beam);
        assert_eq!(dev_strategy(DecodeStrategy::Beam), DecodeStrategy::Beam);
        assert_eq!(dev_strategy(DecodeStrategy::BatchedBeam), DecodeStrategy::BatchedBeam);
    }

    #[test]
    fn test_rewards_tensor_shape() {
        let device = Default::default();
        let t = rewards_tensor::<TestBackend>(&[vec![1.0, 0.0, 0.5], vec![0.0, 0.0, 1.0]], &device);
        assert_eq!(t.dims(), [2, 3]);
        let values: Vec<f32> = t.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 0.0, 0.5, 0.0, 0.0, 1.0]);
    }

    fn toy_example(id: u64, x: &[usize], y: &[usize], y_tok: &[&str]) -> Example {
        Example {
            id,
            x: String::new(),
            x_tok: vec![],
            y: y_tok.join(" "),
            y_tok: y_tok.iter().map(|s| s.to_string()).collect(),
            x_indexed: x.to_vec(),
            y_indexed: y.to_vec(),
        }
    }

    #[test]
    fn test_score_candidates_builds_contexts() {
        let mut indexer = Indexer::with_specials();
        let a = indexer.add("a");
        let b = indexer.add("b");
        let examples = vec![
            toy_example(7, &[4], &[a, EOS_ID], &["a"]),
            toy_example(9, &[4, 5], &[b, EOS_ID], &["b"]),
        ];
        let batch = Batch::new(&examples, vec![1, 0], false);

        let dir = tempfile::tempdir().unwrap();
        let oracle = MockOracle::new().with_match("b");
        let mut cache = RewardCache::open(dir.path().join("c.parquet"), oracle).unwrap();
        let tokens = vec![vec![vec![b], vec![a]], vec![vec![b], vec![a, b]]];
        let scored = score_candidates(&mut cache, &tokens, &batch, &examples, &indexer, TRAIN_SPLIT).unwrap();

        assert_eq!(scored.rewards.len(), 2);
        assert_eq!(scored.rewards[0][0], 1.0);
        assert_eq!(scored.num_match, 2);
        assert_eq!(cache.oracle().calls(), 4);
        assert!(cache.get("train:9\tb").is_some());
        assert!(cache.get("train:7\ta b").is_some());
    }

    #[test]
    fn test_mle_shutdown_returns_untrained_model() {
        let device = Default::default();
        let examples = vec![toy_example(0, &[4, 5], &[4, EOS_ID], &["x"])];
        let model_config = Seq2SeqConfig::new(6, 5)
            .with_input_dim(4)
            .with_output_dim(4)
            .with_hidden_size(3);
        let model = model_config.init::<TestAutodiffBackend>(&device);
        let shutdown = AtomicBool::new(true);
        let config = TrainingConfig::new().with_epochs(3);
        let trained =
            train_mle(&config, &model_config, model, &examples, &[], None, &shutdown, &device).unwrap();
        let _ = trained.valid();
    }
}
