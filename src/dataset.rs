//! JSONL record streams for the preparation and export stages, plus the
//! label-distribution summary printed at the end of a run.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use indexmap::IndexMap;

use crate::{
    error::AppResult,
    model::{ClassifiedComment, CommentRecord, Label},
};

/// Reads input records, one JSON object per line. Unparseable lines are
/// logged and skipped rather than failing the whole file.
pub fn read_records(path: &Path) -> AppResult<Vec<CommentRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CommentRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("skipping unparseable input line {}: {:?}", i + 1, e),
        }
    }

    tracing::info!("loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

pub fn write_results(path: &Path, results: &[ClassifiedComment]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for result in results {
        let line = serde_json::to_string(result)
            .map_err(|e| anyhow::anyhow!("serialize result {}: {e}", result.id))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Label counts in first-seen order, for the end-of-run report.
pub fn label_distribution(results: &[ClassifiedComment]) -> IndexMap<Label, usize> {
    let mut counts: IndexMap<Label, usize> = IndexMap::new();
    for result in results {
        *counts.entry(result.label).or_default() += 1;
    }
    counts
}
