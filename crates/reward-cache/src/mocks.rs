//! In-process oracle for tests.

use std::collections::{HashMap, HashSet};

use crate::oracle::OracleEvaluator;
use crate::types::{OracleContext, OracleError, OracleOutcome};

/// Oracle with canned outcomes per sketch and a record of every call.
///
/// Unknown sketches score 0 with neither flag set. Keys follow the sketch
/// oracle (`split:example_id \t sketch`).
#[derive(Debug, Default)]
pub struct MockOracle {
    outcomes: HashMap<String, OracleOutcome>,
    failures: HashSet<String>,
    evaluated: Vec<String>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// `sketch` scores 1.0 and both covers and matches.
    pub fn with_match(self, sketch: &str) -> Self {
        self.with_outcome(
            sketch,
            OracleOutcome {
                reward: 1.0,
                coverage: true,
                exact_match: true,
            },
        )
    }

    /// `sketch` scores 0.5 and covers without matching.
    pub fn with_coverage(self, sketch: &str) -> Self {
        self.with_outcome(
            sketch,
            OracleOutcome {
                reward: 0.5,
                coverage: true,
                exact_match: false,
            },
        )
    }

    pub fn with_outcome(mut self, sketch: &str, outcome: OracleOutcome) -> Self {
        self.outcomes.insert(sketch.to_string(), outcome);
        self
    }

    /// Evaluating `sketch` fails with [`OracleError::Rejected`].
    pub fn with_failure(mut self, sketch: &str) -> Self {
        self.failures.insert(sketch.to_string());
        self
    }

    /// Number of `evaluate` calls.
    pub fn calls(&self) -> usize {
        self.evaluated.len()
    }

    /// Sketches passed to `evaluate`, in call order.
    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.clone()
    }
}

impl OracleEvaluator for MockOracle {
    fn cache_key(&self, candidate: &str, ctx: &OracleContext) -> String {
        format!("{}:{}\t{}", ctx.split, ctx.example_id, candidate)
    }

    fn evaluate(&mut self, candidate: &str, _ctx: &OracleContext) -> Result<OracleOutcome, OracleError> {
        self.evaluated.push(candidate.to_string());
        if self.failures.contains(candidate) {
            return Err(OracleError::Rejected(format!("scripted failure for {candidate:?}")));
        }
        Ok(self.outcomes.get(candidate).copied().unwrap_or(OracleOutcome {
            reward: 0.0,
            coverage: false,
            exact_match: false,
        }))
    }
}
