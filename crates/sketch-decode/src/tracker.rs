//! Bookkeeping for batched beam search.
//!
//! Scores for a batch are laid out as one `(slots × vocab)` block per
//! example. A pick inside that block is a flat index; `unflatten` maps it
//! back to `(source slot, emitted token)`. The tracker owns the per-slot
//! token lists, terminated flags and accumulated scores, so the tensor side
//! of the search only needs the picked flat indices and the source slots.

use std::cmp::Ordering;

use crate::search::DecodeError;

/// Split a flat `(slot, token)` index: `(flat / vocab_size, flat % vocab_size)`.
pub fn unflatten(flat: usize, vocab_size: usize) -> (usize, usize) {
    (flat / vocab_size, flat % vocab_size)
}

/// Result of one tracking step for a whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedStep {
    /// Picked flat indices per example, best first.
    pub picked: Vec<Vec<usize>>,
    /// Token fed to the decoder next, per example and slot.
    pub input_tokens: Vec<Vec<usize>>,
    /// Slot (within the same example) each new slot descends from.
    pub sources: Vec<Vec<usize>>,
}

impl TrackedStep {
    /// Input tokens in row order `example * width + slot`.
    pub fn flat_inputs(&self) -> Vec<usize> {
        self.input_tokens.iter().flatten().copied().collect()
    }

    /// Decoder rows to gather the next state from, in row order.
    ///
    /// `prev_width` is the number of slots per example in the previous step
    /// (1 right after the start token).
    pub fn source_rows(&self, prev_width: usize) -> Vec<usize> {
        self.sources
            .iter()
            .enumerate()
            .flat_map(|(b, srcs)| srcs.iter().map(move |&s| b * prev_width + s))
            .collect()
    }
}

/// Per-example beam state for batched beam search.
#[derive(Debug, Clone)]
pub struct BeamTracker {
    width: usize,
    vocab_size: usize,
    eos: usize,
    tokens: Vec<Vec<Vec<usize>>>,
    terminated: Vec<Vec<bool>>,
    scores: Vec<Vec<f64>>,
}

impl BeamTracker {
    /// Start tracking `batch_size` examples, each with a single empty,
    /// live slot (the start token).
    pub fn new(batch_size: usize, width: usize, vocab_size: usize, eos: usize) -> Self {
        Self {
            width,
            vocab_size,
            eos,
            tokens: vec![vec![Vec::new()]; batch_size],
            terminated: vec![vec![false]; batch_size],
            scores: vec![vec![0.0]; batch_size],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.tokens.len()
    }

    /// Slots per example currently held (1 before the first step).
    pub fn current_width(&self) -> usize {
        self.tokens.first().map_or(0, |t| t.len())
    }

    pub fn tokens(&self) -> &[Vec<Vec<usize>>] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Vec<Vec<usize>>> {
        self.tokens
    }

    pub fn terminated(&self) -> &[Vec<bool>] {
        &self.terminated
    }

    pub fn scores(&self) -> &[Vec<f64>] {
        &self.scores
    }

    /// Terminated flags in row order.
    pub fn flat_terminated(&self) -> Vec<bool> {
        self.terminated.iter().flatten().copied().collect()
    }

    /// True once every slot of every example has emitted EOS.
    pub fn all_terminated(&self) -> bool {
        self.terminated.iter().flatten().all(|&t| t)
    }

    /// Score a step and advance.
    ///
    /// `step_log_probs` holds `batch × current_width × vocab` log-probabilities
    /// in row order. A terminated slot contributes exactly one candidate, its
    /// EOS continuation with unchanged score; every other `(slot, token)`
    /// contributes `score + log_prob`. The best `width` candidates per example
    /// are picked (ties go to the lower flat index) and then tracked.
    pub fn advance(&mut self, step_log_probs: &[f32]) -> Result<TrackedStep, DecodeError> {
        let cur = self.current_width();
        let block = cur * self.vocab_size;
        let expected = self.batch_size() * block;
        if step_log_probs.len() != expected {
            return Err(DecodeError::BatchMismatch {
                expected,
                got: step_log_probs.len(),
            });
        }

        let mut picked = Vec::with_capacity(self.batch_size());
        let mut picked_scores = Vec::with_capacity(self.batch_size());
        for b in 0..self.batch_size() {
            let mut candidates: Vec<(usize, f64)> = Vec::with_capacity(block);
            for slot in 0..cur {
                let base = self.scores[b][slot];
                if self.terminated[b][slot] {
                    candidates.push((slot * self.vocab_size + self.eos, base));
                    continue;
                }
                let row = &step_log_probs[(b * cur + slot) * self.vocab_size..][..self.vocab_size];
                for (tok, &lp) in row.iter().enumerate() {
                    candidates.push((slot * self.vocab_size + tok, base + lp as f64));
                }
            }
            candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            candidates.truncate(self.width);
            if candidates.len() < self.width {
                return Err(DecodeError::WidthExceedsVocab {
                    width: self.width,
                    vocab: self.vocab_size,
                });
            }
            picked.push(candidates.iter().map(|c| c.0).collect::<Vec<_>>());
            picked_scores.push(candidates.iter().map(|c| c.1).collect::<Vec<_>>());
        }

        let step = self.track(&picked)?;
        self.scores = picked_scores;
        Ok(step)
    }

    /// Rebuild slots from picked flat indices.
    ///
    /// A slot descending from a terminated source copies it through unchanged
    /// (its score is carried over as well); a live source emitting EOS becomes
    /// terminated without appending EOS; any other token is appended.
    pub fn track(&mut self, picked: &[Vec<usize>]) -> Result<TrackedStep, DecodeError> {
        if picked.len() != self.batch_size() {
            return Err(DecodeError::BatchMismatch {
                expected: self.batch_size(),
                got: picked.len(),
            });
        }
        let cur = self.current_width();

        let mut next_tokens = Vec::with_capacity(picked.len());
        let mut next_terminated = Vec::with_capacity(picked.len());
        let mut next_scores = Vec::with_capacity(picked.len());
        let mut input_tokens = Vec::with_capacity(picked.len());
        let mut sources = Vec::with_capacity(picked.len());

        for (b, example_picks) in picked.iter().enumerate() {
            let mut b_tokens = Vec::with_capacity(example_picks.len());
            let mut b_terminated = Vec::with_capacity(example_picks.len());
            let mut b_scores = Vec::with_capacity(example_picks.len());
            let mut b_inputs = Vec::with_capacity(example_picks.len());
            let mut b_sources = Vec::with_capacity(example_picks.len());

            for &flat in example_picks {
                let (src, tok) = unflatten(flat, self.vocab_size);
                if src >= cur {
                    return Err(DecodeError::BatchMismatch { expected: cur, got: src + 1 });
                }
                let prev = &self.tokens[b][src];
                if self.terminated[b][src] {
                    b_tokens.push(prev.clone());
                    b_terminated.push(true);
                } else if tok == self.eos {
                    b_tokens.push(prev.clone());
                    b_terminated.push(true);
                } else {
                    let mut extended = prev.clone();
                    extended.push(tok);
                    b_tokens.push(extended);
                    b_terminated.push(false);
                }
                b_scores.push(self.scores[b][src]);
                b_inputs.push(tok);
                b_sources.push(src);
            }

            next_tokens.push(b_tokens);
            next_terminated.push(b_terminated);
            next_scores.push(b_scores);
            input_tokens.push(b_inputs);
            sources.push(b_sources);
        }

        self.tokens = next_tokens;
        self.terminated = next_terminated;
        self.scores = next_scores;

        Ok(TrackedStep {
            picked: picked.to_vec(),
            input_tokens,
            sources,
        })
    }
}
