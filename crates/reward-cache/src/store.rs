//! Parquet persistence for cache entries.
//!
//! A cache file holds one row per key: `key`, `reward`, `coverage`, `match`.
//! Files are replaced atomically: rows are written to a temporary file in the
//! same directory, which is then renamed over the old file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::types::{CacheError, OracleOutcome};

/// Arrow schema of cache files.
pub fn cache_schema() -> Schema {
    Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("reward", DataType::Float64, false),
        Field::new("coverage", DataType::Boolean, false),
        Field::new("match", DataType::Boolean, false),
    ])
}

/// Read every entry of a cache file. A missing file reads as empty.
pub fn read_entries(path: &Path) -> Result<HashMap<String, OracleOutcome>, CacheError> {
    let mut entries = HashMap::new();
    if !path.exists() {
        return Ok(entries);
    }

    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    for batch in reader {
        extract_entries(&batch?, &mut entries)?;
    }

    tracing::debug!(entries = entries.len(), path = %path.display(), "Read cache file");
    Ok(entries)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, CacheError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| CacheError::Schema(format!("missing column {name}")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CacheError::Schema(format!("column {name} has the wrong type")))
}

fn extract_entries(
    batch: &RecordBatch,
    entries: &mut HashMap<String, OracleOutcome>,
) -> Result<(), CacheError> {
    let keys = column::<StringArray>(batch, "key")?;
    let rewards = column::<Float64Array>(batch, "reward")?;
    let coverage = column::<BooleanArray>(batch, "coverage")?;
    let matches = column::<BooleanArray>(batch, "match")?;

    for i in 0..batch.num_rows() {
        if keys.is_null(i) {
            return Err(CacheError::Schema(format!("null key in row {i}")));
        }
        entries.insert(
            keys.value(i).to_string(),
            OracleOutcome {
                reward: rewards.value(i),
                coverage: coverage.value(i),
                exact_match: matches.value(i),
            },
        );
    }
    Ok(())
}

/// Replace the file at `path` with `entries`, sorted by key.
///
/// Either the new file is fully in place or the old one is untouched.
pub fn write_entries(path: &Path, entries: &HashMap<String, OracleOutcome>) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut rows: Vec<(&String, &OracleOutcome)> = entries.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));

    let schema = Arc::new(cache_schema());
    let keys: StringArray = rows.iter().map(|(k, _)| Some(k.as_str())).collect();
    let rewards: Float64Array = rows.iter().map(|(_, o)| Some(o.reward)).collect();
    let coverage: BooleanArray = rows.iter().map(|(_, o)| Some(o.coverage)).collect();
    let matches: BooleanArray = rows.iter().map(|(_, o)| Some(o.exact_match)).collect();
    let columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(keys),
        Arc::new(rewards),
        Arc::new(coverage),
        Arc::new(matches),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut writer = ArrowWriter::try_new(tmp.as_file().try_clone()?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;

    tracing::debug!(entries = rows.len(), path = %path.display(), "Wrote cache file");
    Ok(())
}
