//! Question/sketch datasets: TSV loading, vocabulary indexing and padded batches.
//!
//! A dataset named `D` lives in `{data_dir}/D/train.tsv` and
//! `{data_dir}/D/dev.tsv`, one `question \t sketch` pair per line. Both sides
//! are tokenized on whitespace. Vocabularies are built from the training split
//! only; unseen dev tokens map to `<UNK>`.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use burn::prelude::*;

use crate::model::length_mask;

pub const PAD_SYMBOL: &str = "<PAD>";
pub const SOS_SYMBOL: &str = "<SOS>";
pub const EOS_SYMBOL: &str = "<EOS>";
pub const UNK_SYMBOL: &str = "<UNK>";

pub const PAD_ID: usize = 0;
pub const SOS_ID: usize = 1;
pub const EOS_ID: usize = 2;
pub const UNK_ID: usize = 3;

/// Split names passed to the sketch oracle.
pub const TRAIN_SPLIT: &str = "train";
pub const DEV_SPLIT: &str = "val";

/// Bidirectional map between symbols and dense ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexer {
    objects: Vec<String>,
    ids: HashMap<String, usize>,
}

impl Default for Indexer {
    fn default() -> Self {
        Self::with_specials()
    }
}

impl Indexer {
    /// An indexer holding `<PAD> <SOS> <EOS> <UNK>` at ids 0..4.
    pub fn with_specials() -> Self {
        let mut indexer = Self {
            objects: Vec::new(),
            ids: HashMap::new(),
        };
        for symbol in [PAD_SYMBOL, SOS_SYMBOL, EOS_SYMBOL, UNK_SYMBOL] {
            indexer.add(symbol);
        }
        indexer
    }

    /// Id of `object`, assigning the next free id if it is new.
    pub fn add(&mut self, object: &str) -> usize {
        if let Some(&id) = self.ids.get(object) {
            return id;
        }
        let id = self.objects.len();
        self.objects.push(object.to_string());
        self.ids.insert(object.to_string(), id);
        id
    }

    pub fn index_of(&self, object: &str) -> Option<usize> {
        self.ids.get(object).copied()
    }

    pub fn index_or_unk(&self, object: &str) -> usize {
        self.index_of(object).unwrap_or(UNK_ID)
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.objects.get(id).map(String::as_str)
    }

    /// Symbols for `ids`, with out-of-range ids rendered as `<UNK>`.
    pub fn symbols(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.get(id).unwrap_or(UNK_SYMBOL).to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// One question/sketch pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// Line number within its split file (0-based, blank lines skipped).
    pub id: u64,
    pub x: String,
    pub x_tok: Vec<String>,
    pub y: String,
    pub y_tok: Vec<String>,
    pub x_indexed: Vec<usize>,
    /// Output ids ending in `<EOS>`.
    pub y_indexed: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Vec<Example>,
    pub dev: Vec<Example>,
    pub input_indexer: Indexer,
    pub output_indexer: Indexer,
}

/// Read `question \t sketch` lines. Blank lines are skipped.
pub fn read_pairs(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open dataset file {}: {e}", path.display()))?;
    let mut pairs = Vec::new();
    for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (x, y) = line.split_once('\t').ok_or_else(|| {
            anyhow::anyhow!("{}:{}: expected `question<TAB>sketch`", path.display(), lineno + 1)
        })?;
        pairs.push((x.trim().to_string(), y.trim().to_string()));
    }
    Ok(pairs)
}

/// Load and index the train and dev splits of `dataset`.
pub fn load_datasets(data_dir: &Path, dataset: &str, decoder_len_limit: usize) -> anyhow::Result<Dataset> {
    let root = data_dir.join(dataset);
    let train = read_pairs(&root.join("train.tsv"))?;
    let dev = read_pairs(&root.join("dev.tsv"))?;
    let data = index_datasets(&train, &dev, decoder_len_limit);
    tracing::info!(
        dataset,
        train = data.train.len(),
        dev = data.dev.len(),
        input_types = data.input_indexer.len(),
        output_types = data.output_indexer.len(),
        "Loaded dataset"
    );
    Ok(data)
}

fn tokenize(s: &str) -> Vec<String> {
    s.split_whitespace().map(String::from).collect()
}

/// Build vocabularies from `train` and index both splits.
///
/// Outputs keep at most `decoder_len_limit - 1` tokens so that the gold
/// sequence, `<EOS>` included, fits within the decoder length limit.
/// Examples with an empty question are dropped.
pub fn index_datasets(
    train: &[(String, String)],
    dev: &[(String, String)],
    decoder_len_limit: usize,
) -> Dataset {
    let mut input_indexer = Indexer::with_specials();
    let mut output_indexer = Indexer::with_specials();
    for (x, y) in train {
        for tok in x.split_whitespace() {
            input_indexer.add(tok);
        }
        for tok in y.split_whitespace() {
            output_indexer.add(tok);
        }
    }

    let keep = decoder_len_limit.saturating_sub(1);
    let index = |pairs: &[(String, String)]| -> Vec<Example> {
        let mut dropped = 0usize;
        let examples: Vec<Example> = pairs
            .iter()
            .enumerate()
            .filter_map(|(i, (x, y))| {
                let x_tok = tokenize(x);
                if x_tok.is_empty() {
                    dropped += 1;
                    return None;
                }
                let y_tok = tokenize(y);
                let x_indexed = x_tok.iter().map(|t| input_indexer.index_or_unk(t)).collect();
                let mut y_indexed: Vec<usize> = y_tok
                    .iter()
                    .take(keep)
                    .map(|t| output_indexer.index_or_unk(t))
                    .collect();
                y_indexed.push(EOS_ID);
                Some(Example {
                    id: i as u64,
                    x: x.clone(),
                    x_tok,
                    y: y.clone(),
                    y_tok,
                    x_indexed,
                    y_indexed,
                })
            })
            .collect();
        if dropped > 0 {
            tracing::warn!(dropped, "Dropped examples with an empty question");
        }
        examples
    };

    Dataset {
        train: index(train),
        dev: index(dev),
        input_indexer,
        output_indexer,
    }
}

/// Stable sort, longest question first.
pub fn sort_by_input_len(examples: &mut [Example]) {
    examples.sort_by(|a, b| b.x_indexed.len().cmp(&a.x_indexed.len()));
}

/// A padded batch of examples, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Positions of the batch's examples in the slice it was built from.
    pub indices: Vec<usize>,
    pub inputs: Vec<usize>,
    pub input_lens: Vec<usize>,
    pub input_len: usize,
    pub outputs: Vec<usize>,
    pub output_lens: Vec<usize>,
    pub output_len: usize,
}

impl Batch {
    /// Pad the given examples with `<PAD>`. With `reverse_input` each question
    /// is reversed before padding.
    pub fn new(examples: &[Example], indices: Vec<usize>, reverse_input: bool) -> Self {
        let rows: Vec<&Example> = indices.iter().map(|&i| &examples[i]).collect();
        let input_lens: Vec<usize> = rows.iter().map(|e| e.x_indexed.len()).collect();
        let output_lens: Vec<usize> = rows.iter().map(|e| e.y_indexed.len()).collect();
        let input_len = input_lens.iter().copied().max().unwrap_or(0);
        let output_len = output_lens.iter().copied().max().unwrap_or(0);

        let mut inputs = Vec::with_capacity(rows.len() * input_len);
        let mut outputs = Vec::with_capacity(rows.len() * output_len);
        for ex in &rows {
            let mut x = ex.x_indexed.clone();
            if reverse_input {
                x.reverse();
            }
            x.resize(input_len, PAD_ID);
            inputs.extend(x);

            let mut y = ex.y_indexed.clone();
            y.resize(output_len, PAD_ID);
            outputs.extend(y);
        }

        Self {
            indices,
            inputs,
            input_lens,
            input_len,
            outputs,
            output_lens,
            output_len,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Gold tokens (EOS included) across the batch.
    pub fn num_output_tokens(&self) -> usize {
        self.output_lens.iter().sum()
    }

    /// Gold token of every row at decoder step `t` (PAD past the end).
    pub fn outputs_at(&self, t: usize) -> Vec<usize> {
        (0..self.len()).map(|b| self.outputs[b * self.output_len + t]).collect()
    }

    pub fn input_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2, Int> {
        let data: Vec<i64> = self.inputs.iter().map(|&i| i as i64).collect();
        Tensor::from_data(TensorData::new(data, [self.len(), self.input_len]), device)
    }

    /// `(batch, output_len)` float mask over real gold positions.
    pub fn output_mask<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        length_mask::<B>(&self.output_lens, self.output_len, device)
    }
}

/// Consecutive batches of at most `batch_size` examples, in slice order.
pub fn make_batches(examples: &[Example], batch_size: usize, reverse_input: bool) -> Vec<Batch> {
    let size = batch_size.max(1);
    (0..examples.len())
        .collect::<Vec<_>>()
        .chunks(size)
        .map(|chunk| Batch::new(examples, chunk.to_vec(), reverse_input))
        .collect()
}
