//! Oracle backends behind one evaluation seam.

use crate::protocol::OracleRequest;
use crate::types::{OracleConfig, OracleContext, OracleError, OracleMode, OracleOutcome};
use crate::worker::OracleWorker;

/// Scores a candidate sketch (space-joined tokens) against an example.
pub trait OracleEvaluator {
    /// Key under which the outcome for `(candidate, ctx)` is memoized.
    fn cache_key(&self, candidate: &str, ctx: &OracleContext) -> String;

    fn evaluate(&mut self, candidate: &str, ctx: &OracleContext) -> Result<OracleOutcome, OracleError>;
}

/// Checks that a sketch covers the example's gold program.
///
/// Outcomes depend on the example, so keys carry split and example id.
pub struct SketchOracle {
    worker: OracleWorker,
    dataset: String,
    timeout_secs: u64,
}

impl SketchOracle {
    pub fn new(config: &OracleConfig, dataset: &str) -> Result<Self, OracleError> {
        Ok(Self {
            worker: OracleWorker::new(config)?,
            dataset: dataset.to_string(),
            timeout_secs: config.timeout_secs,
        })
    }
}

impl OracleEvaluator for SketchOracle {
    fn cache_key(&self, candidate: &str, ctx: &OracleContext) -> String {
        format!("{}:{}\t{}", ctx.split, ctx.example_id, candidate)
    }

    fn evaluate(&mut self, candidate: &str, ctx: &OracleContext) -> Result<OracleOutcome, OracleError> {
        self.worker.request(&OracleRequest::Sketch {
            dataset: self.dataset.clone(),
            split: ctx.split.clone(),
            example_id: ctx.example_id,
            sketch: candidate.to_string(),
            timeout_secs: self.timeout_secs,
        })
    }
}

/// Checks DFA language equivalence with the gold sketch.
///
/// Outcomes depend only on the two sketches, so the same pair is shared
/// across examples and splits.
pub struct DfaOracle {
    worker: OracleWorker,
    timeout_secs: u64,
}

impl DfaOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        Ok(Self {
            worker: OracleWorker::new(config)?,
            timeout_secs: config.timeout_secs,
        })
    }
}

impl OracleEvaluator for DfaOracle {
    fn cache_key(&self, candidate: &str, ctx: &OracleContext) -> String {
        format!("{}\t{}", ctx.ground_truth, candidate)
    }

    fn evaluate(&mut self, candidate: &str, ctx: &OracleContext) -> Result<OracleOutcome, OracleError> {
        self.worker.request(&OracleRequest::Dfa {
            ground_truth: ctx.ground_truth.clone(),
            candidate: candidate.to_string(),
            timeout_secs: self.timeout_secs,
        })
    }
}

/// The oracle selected by configuration.
pub enum Oracle {
    Sketch(SketchOracle),
    Dfa(DfaOracle),
}

impl Oracle {
    pub fn from_config(config: &OracleConfig, dataset: &str) -> Result<Self, OracleError> {
        tracing::info!(
            mode = ?config.mode,
            program = %config.program.display(),
            timeout_secs = config.timeout_secs,
            "Configured oracle"
        );
        Ok(match config.mode {
            OracleMode::Sketch => Oracle::Sketch(SketchOracle::new(config, dataset)?),
            OracleMode::Dfa => Oracle::Dfa(DfaOracle::new(config)?),
        })
    }

    pub fn mode(&self) -> OracleMode {
        match self {
            Oracle::Sketch(_) => OracleMode::Sketch,
            Oracle::Dfa(_) => OracleMode::Dfa,
        }
    }
}

impl OracleEvaluator for Oracle {
    fn cache_key(&self, candidate: &str, ctx: &OracleContext) -> String {
        match self {
            Oracle::Sketch(o) => o.cache_key(candidate, ctx),
            Oracle::Dfa(o) => o.cache_key(candidate, ctx),
        }
    }

    fn evaluate(&mut self, candidate: &str, ctx: &OracleContext) -> Result<OracleOutcome, OracleError> {
        match self {
            Oracle::Sketch(o) => o.evaluate(candidate, ctx),
            Oracle::Dfa(o) => o.evaluate(candidate, ctx),
        }
    }
}
