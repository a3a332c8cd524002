//! Model checkpoints named `{dir}/{dataset}-{model_id}`.
//!
//! Each checkpoint is three files sharing that stem: the weights
//! (`.mpk`, burn's named MessagePack recorder), the model config
//! (`.config.json`) and run metadata (`.meta.json`).

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::model::{Seq2Seq, Seq2SeqConfig};

/// Metadata saved alongside each checkpoint.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Epoch the weights were taken at (0 for warm-start models loaded as-is).
    pub epoch: usize,
    /// Dev perplexity (MLE) or negated dev match count (RL), if evaluated.
    pub dev_metric: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    dataset: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, dataset: &str) -> Self {
        Self {
            dir: dir.into(),
            dataset: dataset.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem for `model_id`, e.g. `checkpoints/deepregex-exp1-best`.
    pub fn stem(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("{}-{model_id}", self.dataset))
    }

    fn with_suffix(&self, model_id: &str, suffix: &str) -> PathBuf {
        let mut name = self.stem(model_id).into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn exists(&self, model_id: &str) -> bool {
        self.with_suffix(model_id, ".mpk").exists()
    }

    pub fn save<B: Backend>(
        &self,
        model: &Seq2Seq<B>,
        config: &Seq2SeqConfig,
        model_id: &str,
        meta: &CheckpointMeta,
    ) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = self.stem(model_id);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(stem.clone(), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save model {model_id}: {e}"))?;

        let config_path = self.with_suffix(model_id, ".config.json");
        config
            .save(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to save {}: {e}", config_path.display()))?;

        let meta_path = self.with_suffix(model_id, ".meta.json");
        serde_json::to_writer(std::fs::File::create(&meta_path)?, meta)?;

        tracing::info!(model_id, epoch = meta.epoch, path = %stem.display(), "Checkpoint saved");
        Ok(stem)
    }

    pub fn load_config(&self, model_id: &str) -> anyhow::Result<Seq2SeqConfig> {
        let path = self.with_suffix(model_id, ".config.json");
        Seq2SeqConfig::load(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load model config from {}: {e}", path.display()))
    }

    pub fn load_meta(&self, model_id: &str) -> anyhow::Result<CheckpointMeta> {
        let path = self.with_suffix(model_id, ".meta.json");
        let file = std::fs::File::open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        serde_json::from_reader(file).map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
    }

    /// Create a model from `config` and load the saved weights on top.
    pub fn load<B: Backend>(
        &self,
        config: &Seq2SeqConfig,
        model_id: &str,
        device: &B::Device,
    ) -> anyhow::Result<Seq2Seq<B>> {
        let stem = self.stem(model_id);
        let model = config
            .init::<B>(device)
            .load_file(stem.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)
            .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", stem.display()))?;
        tracing::info!(model_id, path = %stem.display(), "Checkpoint loaded");
        Ok(model)
    }
}
