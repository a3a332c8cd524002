use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Errors from evaluating a candidate with the oracle.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// Oracle process exited unexpectedly.
    #[error("oracle process exited unexpectedly")]
    ProcessDied,

    /// No answer within the hard timeout (seconds).
    #[error("oracle timed out after {0}s")]
    Timeout(u64),

    /// Malformed request or response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The oracle answered with an error message.
    #[error("oracle rejected candidate: {0}")]
    Rejected(String),

    /// The run was aborted before this candidate reached the oracle.
    #[error("oracle calls aborted by interrupt")]
    Aborted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from loading or persisting the cache file.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("unexpected cache file layout: {0}")]
    Schema(String),

    #[error("failed to move cache file into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// What the oracle says about one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleOutcome {
    pub reward: f64,
    /// Candidate is well-formed / reachable.
    pub coverage: bool,
    /// Candidate meets the correctness criterion exactly.
    #[serde(rename = "match")]
    pub exact_match: bool,
}

/// The example a candidate is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OracleContext {
    /// `"train"` or `"val"`.
    pub split: String,
    pub example_id: u64,
    /// Gold sketch, space-joined.
    pub ground_truth: String,
}

impl OracleContext {
    pub fn new(split: &str, example_id: u64, ground_truth: impl Into<String>) -> Self {
        Self {
            split: split.to_string(),
            example_id,
            ground_truth: ground_truth.into(),
        }
    }
}

/// Which oracle backend scores candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleMode {
    /// Sketch coverage check against the example's gold program.
    #[default]
    Sketch,
    /// DFA equivalence against the gold sketch.
    Dfa,
}

/// Oracle process configuration, the `[oracle]` TOML section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub mode: OracleMode,

    /// Oracle executable.
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Extra arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Per-candidate time budget passed to the oracle.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra time allowed on top of `timeout_secs` before the worker gives up.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Restart the oracle process after this many requests.
    #[serde(default = "default_max_requests")]
    pub max_requests_per_worker: u64,
}

fn default_program() -> PathBuf {
    PathBuf::from("sketch-oracle")
}
fn default_timeout_secs() -> u64 {
    2
}
fn default_grace_secs() -> u64 {
    5
}
fn default_max_requests() -> u64 {
    10_000
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            mode: OracleMode::default(),
            program: default_program(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            grace_secs: default_grace_secs(),
            max_requests_per_worker: default_max_requests(),
        }
    }
}

/// Where the cache lives, the `[cache]` TOML section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_cache_id")]
    pub cache_id: String,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}
fn default_cache_id() -> String {
    "cache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            cache_id: default_cache_id(),
        }
    }
}

impl CacheConfig {
    /// `{dir}/{cache_id}_{dataset}.parquet`
    pub fn path_for(&self, dataset: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.parquet", self.cache_id, dataset))
    }
}
