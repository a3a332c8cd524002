//! Memoized reward oracle for RL training on sketches.
//!
//! Checking a candidate sketch against an external oracle (sketch execution or
//! DFA equivalence) is slow, and the same candidates come back epoch after
//! epoch. [`RewardCache`] calls the oracle at most once per distinct key for
//! the lifetime of the process and persists results to a Parquet file so that
//! later runs start warm.
//!
//! # Key types
//!
//! - [`OracleEvaluator`]: the oracle seam: `evaluate` plus a cache key
//! - [`Oracle`]: the configured backend, [`SketchOracle`] or [`DfaOracle`]
//! - [`OracleWorker`]: JSON-lines child process with timeout and recycling
//! - [`RewardCache`]: key → outcome map with merge-on-rewrite persistence
//! - [`CacheFlushGuard`]: rewrites the cache when dropped, on any exit path

pub mod cache;
pub mod guard;
pub mod mocks;
pub mod oracle;
pub mod protocol;
pub mod store;
pub mod types;
pub mod worker;

pub use cache::{BatchRewards, CacheStats, CacheSummary, RewardCache};
pub use guard::CacheFlushGuard;
pub use oracle::{DfaOracle, Oracle, OracleEvaluator, SketchOracle};
pub use protocol::{OracleRequest, OracleResponse};
pub use types::{
    CacheConfig, CacheError, OracleConfig, OracleContext, OracleError, OracleMode, OracleOutcome,
};
pub use worker::OracleWorker;
