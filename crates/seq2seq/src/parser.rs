//! Semantic parsers and their evaluation.
//!
//! [`Seq2SeqParser`] greedily decodes with a trained model;
//! [`NearestNeighborParser`] copies the output of the most similar training
//! question. [`evaluate`] scores either against gold sketches.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use burn::prelude::*;
use reward_cache::{OracleContext, OracleEvaluator};
use sketch_decode::greedy_decode;

use crate::model::Seq2Seq;
use crate::training::data::{Batch, Example, Indexer, DEV_SPLIT, EOS_ID, SOS_ID};
use crate::training::metrics::render_ratio;

/// A predicted output with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    /// Model probability, or similarity for the nearest-neighbor baseline.
    pub prob: f64,
    pub y_toks: Vec<String>,
}

pub trait SemanticParser {
    /// Derivations per example, best first.
    fn decode(&self, examples: &[Example]) -> anyhow::Result<Vec<Vec<Derivation>>>;
}

// ---------------------------------------------------------------------------
// Nearest neighbor
// ---------------------------------------------------------------------------

/// Returns the output of the training example whose question has the highest
/// Jaccard similarity with the input. Ties go to the earliest example.
pub struct NearestNeighborParser {
    neighbors: Vec<(HashSet<String>, Vec<String>)>,
}

impl NearestNeighborParser {
    pub fn new(train: &[Example]) -> Self {
        let neighbors = train
            .iter()
            .map(|ex| (ex.x_tok.iter().cloned().collect(), ex.y_tok.clone()))
            .collect();
        Self { neighbors }
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

impl SemanticParser for NearestNeighborParser {
    fn decode(&self, examples: &[Example]) -> anyhow::Result<Vec<Vec<Derivation>>> {
        Ok(examples
            .iter()
            .map(|ex| {
                let words: HashSet<String> = ex.x_tok.iter().cloned().collect();
                let mut best: Option<(f64, &Vec<String>)> = None;
                for (neighbor, y_tok) in &self.neighbors {
                    let sim = jaccard(&words, neighbor);
                    if best.map_or(true, |(b, _)| sim > b) {
                        best = Some((sim, y_tok));
                    }
                }
                best.map(|(prob, y)| Derivation {
                    prob,
                    y_toks: y.clone(),
                })
                .into_iter()
                .collect()
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Seq2seq
// ---------------------------------------------------------------------------

/// Greedy decoding with a trained model, `batch_size` examples at a time.
pub struct Seq2SeqParser<B: Backend> {
    model: Seq2Seq<B>,
    output_indexer: Indexer,
    batch_size: usize,
    decoder_len_limit: usize,
    reverse_input: bool,
    device: B::Device,
}

impl<B: Backend> Seq2SeqParser<B> {
    pub fn new(
        model: Seq2Seq<B>,
        output_indexer: Indexer,
        batch_size: usize,
        decoder_len_limit: usize,
        reverse_input: bool,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            output_indexer,
            batch_size: batch_size.max(1),
            decoder_len_limit,
            reverse_input,
            device,
        }
    }
}

impl<B: Backend> SemanticParser for Seq2SeqParser<B> {
    fn decode(&self, examples: &[Example]) -> anyhow::Result<Vec<Vec<Derivation>>> {
        let mut derivations = Vec::with_capacity(examples.len());
        let indices: Vec<usize> = (0..examples.len()).collect();
        for chunk in indices.chunks(self.batch_size) {
            let batch = Batch::new(examples, chunk.to_vec(), self.reverse_input);
            let enc = self
                .model
                .encode(batch.input_tensor::<B>(&self.device), &batch.input_lens);
            let outputs = greedy_decode(&self.model, &enc, self.decoder_len_limit, SOS_ID, EOS_ID)?;
            derivations.extend(outputs.into_iter().map(|ids| {
                vec![Derivation {
                    prob: 1.0,
                    y_toks: self.output_indexer.symbols(&ids),
                }]
            }));
        }
        Ok(derivations)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalReport {
    pub examples: usize,
    pub exact_match: usize,
    pub tokens_correct: usize,
    pub total_tokens: usize,
    /// Predictions the oracle judged equivalent to gold, when one was given.
    pub denotation_match: Option<usize>,
}

impl EvalReport {
    pub fn exact_match_rate(&self) -> f64 {
        ratio(self.exact_match, self.examples)
    }

    pub fn token_accuracy(&self) -> f64 {
        ratio(self.tokens_correct, self.total_tokens)
    }

    pub fn denotation_rate(&self) -> Option<f64> {
        self.denotation_match.map(|n| ratio(n, self.examples))
    }

    pub fn log(&self) {
        tracing::info!("Exact logical form matches: {}", render_ratio(self.exact_match, self.examples));
        tracing::info!("Token-level accuracy: {}", render_ratio(self.tokens_correct, self.total_tokens));
        if let Some(n) = self.denotation_match {
            tracing::info!("Denotation matches: {}", render_ratio(n, self.examples));
        }
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Decode `examples` with `parser` and compare the top derivation with gold.
///
/// Token accuracy counts gold positions whose predicted token is equal. With
/// `denotation`, each prediction is also sent to the oracle under the dev
/// split. With `outfile`, writes one `question \t prediction` line per example.
pub fn evaluate<P: SemanticParser + ?Sized>(
    examples: &[Example],
    parser: &P,
    mut denotation: Option<&mut dyn OracleEvaluator>,
    outfile: Option<&Path>,
) -> anyhow::Result<EvalReport> {
    let derivations = parser.decode(examples)?;
    anyhow::ensure!(
        derivations.len() == examples.len(),
        "parser returned {} results for {} examples",
        derivations.len(),
        examples.len()
    );

    let mut report = EvalReport {
        examples: examples.len(),
        denotation_match: denotation.as_ref().map(|_| 0),
        ..Default::default()
    };
    let mut lines = Vec::with_capacity(examples.len());

    for (ex, derivs) in examples.iter().zip(&derivations) {
        let pred: &[String] = derivs.first().map(|d| d.y_toks.as_slice()).unwrap_or_default();
        if pred == ex.y_tok.as_slice() {
            report.exact_match += 1;
        }
        report.tokens_correct += ex
            .y_tok
            .iter()
            .zip(pred)
            .filter(|(gold, p)| gold == p)
            .count();
        report.total_tokens += ex.y_tok.len();

        if let Some(oracle) = denotation.as_deref_mut() {
            let ctx = OracleContext::new(DEV_SPLIT, ex.id, ex.y_tok.join(" "));
            let outcome = oracle.evaluate(&pred.join(" "), &ctx)?;
            if outcome.exact_match {
                if let Some(n) = report.denotation_match.as_mut() {
                    *n += 1;
                }
            }
        }
        lines.push(format!("{}\t{}", ex.x, pred.join(" ")));
    }

    if let Some(path) = outfile {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for line in &lines {
            writeln!(file, "{line}")?;
        }
        tracing::info!(path = %path.display(), "Wrote predictions");
    }

    Ok(report)
}
