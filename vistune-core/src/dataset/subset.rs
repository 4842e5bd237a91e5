//! Pull a subset of entries out of a relabeled export by id.

use super::entry::{DatasetEntry, load_entries, save_entries};
use crate::error::VistuneError;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub matched: Vec<DatasetEntry>,
    /// Sorted reference ids with no entry in the source.
    pub missing_ids: Vec<String>,
}

pub fn entry_ids(entries: &[DatasetEntry]) -> HashSet<String> {
    entries.iter().filter_map(DatasetEntry::id_key).collect()
}

/// Source entries whose id is in `ids`, stripped to the training fields, in source order.
pub fn extract_matching(source: Vec<DatasetEntry>, ids: &HashSet<String>) -> Extraction {
    let mut found = HashSet::new();
    let matched: Vec<DatasetEntry> = source
        .into_iter()
        .filter_map(|e| {
            let key = e.id_key().filter(|k| ids.contains(k))?;
            found.insert(key);
            Some(e.stripped())
        })
        .collect();
    let mut missing_ids: Vec<String> = ids.difference(&found).cloned().collect();
    missing_ids.sort();
    Extraction {
        matched,
        missing_ids,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub reference_ids: usize,
    pub source_entries: usize,
    pub matched: usize,
    pub missing_ids: Vec<String>,
}

/// Write the entries of `source` whose ids appear in `reference` to `output`.
pub fn extract_file(
    reference: &Path,
    source: &Path,
    output: &Path,
) -> Result<ExtractReport, VistuneError> {
    let ids = entry_ids(&load_entries(reference)?);
    let source_entries = load_entries(source)?;
    let source_count = source_entries.len();
    let extraction = extract_matching(source_entries, &ids);
    save_entries(output, &extraction.matched)?;
    Ok(ExtractReport {
        reference_ids: ids.len(),
        source_entries: source_count,
        matched: extraction.matched.len(),
        missing_ids: extraction.missing_ids,
    })
}
