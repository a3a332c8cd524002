//! JSON-lines wire format spoken with the oracle process.
//!
//! One request object per line, tagged by `cmd`; one response object per line,
//! either an outcome or `{"error": "..."}`.

use serde::{Deserialize, Serialize};

use crate::types::{OracleError, OracleOutcome};

/// A request to the oracle process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OracleRequest {
    /// Check a sketch against a dataset example.
    Sketch {
        dataset: String,
        split: String,
        example_id: u64,
        sketch: String,
        timeout_secs: u64,
    },
    /// Check language equivalence of two sketches' automata.
    Dfa {
        ground_truth: String,
        candidate: String,
        timeout_secs: u64,
    },
}

impl OracleRequest {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn timeout_secs(&self) -> u64 {
        match self {
            OracleRequest::Sketch { timeout_secs, .. } | OracleRequest::Dfa { timeout_secs, .. } => {
                *timeout_secs
            }
        }
    }
}

/// A response line from the oracle process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OracleResponse {
    Error { error: String },
    Outcome(OracleOutcome),
}

impl OracleResponse {
    /// Parse one response line.
    pub fn parse(line: &str) -> Result<Self, OracleError> {
        serde_json::from_str(line)
            .map_err(|e| OracleError::Protocol(format!("bad response {line:?}: {e}")))
    }

    pub fn into_outcome(self) -> Result<OracleOutcome, OracleError> {
        match self {
            OracleResponse::Outcome(outcome) => Ok(outcome),
            OracleResponse::Error { error } => Err(OracleError::Rejected(error)),
        }
    }
}
