//! Process-scoped memo of oracle outcomes with Parquet persistence.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::oracle::OracleEvaluator;
use crate::store;
use crate::types::{CacheError, OracleContext, OracleError, OracleOutcome};

/// Rewards for a `batch × samples` block of candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRewards {
    /// `rewards[example][sample]`
    pub rewards: Vec<Vec<f32>>,
    /// Examples with at least one covering candidate.
    pub num_coverage: usize,
    /// Examples with at least one exactly matching candidate.
    pub num_match: usize,
}

/// Lookup counters since the cache was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Aggregate view over stored outcomes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSummary {
    pub entries: usize,
    pub coverage: usize,
    pub matches: usize,
    pub mean_reward: f64,
}

impl CacheSummary {
    pub fn from_entries<'a>(outcomes: impl IntoIterator<Item = &'a OracleOutcome>) -> Self {
        let mut summary = CacheSummary {
            entries: 0,
            coverage: 0,
            matches: 0,
            mean_reward: 0.0,
        };
        let mut total = 0.0;
        for o in outcomes {
            summary.entries += 1;
            summary.coverage += o.coverage as usize;
            summary.matches += o.exact_match as usize;
            total += o.reward;
        }
        if summary.entries > 0 {
            summary.mean_reward = total / summary.entries as f64;
        }
        summary
    }

    /// Summarize a cache file without opening an oracle.
    pub fn from_path(path: &Path) -> Result<Self, CacheError> {
        let entries = store::read_entries(path)?;
        Ok(Self::from_entries(entries.values()))
    }

    pub fn coverage_rate(&self) -> f64 {
        self.coverage as f64 / self.entries.max(1) as f64
    }

    pub fn match_rate(&self) -> f64 {
        self.matches as f64 / self.entries.max(1) as f64
    }
}

/// Memoizes an [`OracleEvaluator`].
///
/// The oracle is called at most once per distinct key while the cache lives.
/// Entries computed since the last [`rewrite`](Self::rewrite) are tracked as
/// pending; a rewrite merges them with whatever is on disk and replaces the
/// file atomically. Nothing is ever evicted.
///
/// Once the abort flag from [`with_abort`](Self::with_abort) is set, misses
/// fail with [`OracleError::Aborted`] instead of reaching the oracle; hits
/// are still served.
pub struct RewardCache<O> {
    oracle: O,
    path: PathBuf,
    abort: Option<Arc<AtomicBool>>,
    entries: HashMap<String, OracleOutcome>,
    pending: HashSet<String>,
    hits: u64,
    misses: u64,
}

impl<O: OracleEvaluator> RewardCache<O> {
    /// Open the cache stored at `path`, loading existing entries if the file exists.
    pub fn open(path: impl Into<PathBuf>, oracle: O) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = store::read_entries(&path)?;
        tracing::info!(entries = entries.len(), path = %path.display(), "Opened reward cache");
        Ok(Self {
            oracle,
            path,
            abort: None,
            entries,
            pending: HashSet::new(),
            hits: 0,
            misses: 0,
        })
    }

    /// Stop calling the oracle once `flag` is set.
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Cached outcome for `candidate` (sketch tokens), computing it on a miss.
    pub fn lookup_or_compute(
        &mut self,
        candidate: &[String],
        ctx: &OracleContext,
    ) -> Result<OracleOutcome, OracleError> {
        let sketch = candidate.join(" ");
        let key = self.oracle.cache_key(&sketch, ctx);
        if let Some(outcome) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(*outcome);
        }

        if self.abort.as_ref().is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(OracleError::Aborted);
        }
        self.misses += 1;
        let outcome = self.oracle.evaluate(&sketch, ctx)?;
        self.entries.insert(key.clone(), outcome);
        self.pending.insert(key);
        Ok(outcome)
    }

    /// Score every candidate of a batch; `candidates[b][s]` is checked against `contexts[b]`.
    pub fn score_batch(
        &mut self,
        candidates: &[Vec<Vec<String>>],
        contexts: &[OracleContext],
    ) -> Result<BatchRewards, OracleError> {
        if candidates.len() != contexts.len() {
            return Err(OracleError::Protocol(format!(
                "{} candidate groups for {} examples",
                candidates.len(),
                contexts.len()
            )));
        }

        let mut rewards = Vec::with_capacity(candidates.len());
        let mut num_coverage = 0;
        let mut num_match = 0;
        for (samples, ctx) in candidates.iter().zip(contexts) {
            let mut row = Vec::with_capacity(samples.len());
            let mut covered = false;
            let mut matched = false;
            for candidate in samples {
                let outcome = self.lookup_or_compute(candidate, ctx)?;
                covered |= outcome.coverage;
                matched |= outcome.exact_match;
                row.push(outcome.reward as f32);
            }
            num_coverage += covered as usize;
            num_match += matched as usize;
            rewards.push(row);
        }

        Ok(BatchRewards {
            rewards,
            num_coverage,
            num_match,
        })
    }

    /// Persist entries computed since the last rewrite.
    ///
    /// Merges with the entries currently on disk, so entries written by an
    /// earlier run are kept. Returns `Ok(false)` without touching the file
    /// when nothing is pending.
    pub fn rewrite(&mut self) -> Result<bool, CacheError> {
        if self.pending.is_empty() {
            return Ok(false);
        }

        let mut merged = store::read_entries(&self.path)?;
        let on_disk = merged.len();
        merged.extend(self.entries.iter().map(|(k, v)| (k.clone(), *v)));
        store::write_entries(&self.path, &merged)?;

        tracing::info!(
            new_entries = self.pending.len(),
            on_disk,
            entries = merged.len(),
            path = %self.path.display(),
            "Rewrote reward cache"
        );
        self.pending.clear();
        self.entries = merged;
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<&OracleOutcome> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            pending: self.pending.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub fn summary(&self) -> CacheSummary {
        CacheSummary::from_entries(self.entries.values())
    }
}
