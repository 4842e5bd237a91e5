//! Curated train/val/test splitting.

use super::entry::{DatasetEntry, load_entries, save_entries};
use crate::error::VistuneError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Split percentages; must sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl SplitRatios {
    pub fn new(train: f64, val: f64, test: f64) -> Result<Self, VistuneError> {
        if [train, val, test].iter().any(|p| p.is_nan() || *p < 0.0) {
            return Err(VistuneError::dataset("split percentages must be non-negative"));
        }
        if (train + val + test - 100.0).abs() > 0.001 {
            return Err(VistuneError::dataset(format!(
                "split percentages must sum to 100 (got {})",
                train + val + test
            )));
        }
        Ok(Self { train, val, test })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasetSplit {
    pub train: Vec<DatasetEntry>,
    pub val: Vec<DatasetEntry>,
    pub test: Vec<DatasetEntry>,
}

/// Entries approved for training, stripped of review fields.
pub fn curated(entries: Vec<DatasetEntry>) -> Vec<DatasetEntry> {
    entries
        .into_iter()
        .filter(DatasetEntry::is_curated)
        .map(DatasetEntry::stripped)
        .collect()
}

/// Shuffle with `seed` and cut by `ratios`. The test split takes the remainder.
pub fn split_entries(mut entries: Vec<DatasetEntry>, ratios: SplitRatios, seed: u64) -> DatasetSplit {
    let mut rng = StdRng::seed_from_u64(seed);
    entries.shuffle(&mut rng);

    let total = entries.len();
    let train_size = (total as f64 * ratios.train / 100.0) as usize;
    let val_size = ((total as f64 * ratios.val / 100.0) as usize).min(total - train_size);

    let test = entries.split_off(train_size + val_size);
    let val = entries.split_off(train_size);
    DatasetSplit {
        train: entries,
        val,
        test,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub total: usize,
    pub curated: usize,
    pub train: usize,
    pub val: usize,
    pub test: usize,
    pub files: Vec<PathBuf>,
}

/// Split `input` into `train.json`, `val.json` and `test.json` in `output_dir`
/// (defaults to the input's directory).
pub fn split_file(
    input: &Path,
    output_dir: Option<&Path>,
    ratios: SplitRatios,
    seed: u64,
) -> Result<SplitReport, VistuneError> {
    let entries = load_entries(input)?;
    let total = entries.len();
    let kept = curated(entries);
    info!(total, curated = kept.len(), "Filtered dataset");
    if kept.is_empty() {
        return Err(VistuneError::dataset(
            "no entries have checked=true and use_in_training=true",
        ));
    }
    let curated_count = kept.len();
    let split = split_entries(kept, ratios, seed);

    let out = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    std::fs::create_dir_all(&out)?;

    let mut files = Vec::new();
    for (name, part) in [
        ("train.json", &split.train),
        ("val.json", &split.val),
        ("test.json", &split.test),
    ] {
        let path = out.join(name);
        save_entries(&path, part)?;
        files.push(path);
    }

    Ok(SplitReport {
        total,
        curated: curated_count,
        train: split.train.len(),
        val: split.val.len(),
        test: split.test.len(),
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::entry::fixtures;

    fn numbered(n: usize) -> Vec<DatasetEntry> {
        (0..n)
            .map(|i| fixtures::curated(&i.to_string(), true, true))
            .collect()
    }

    #[test]
    fn test_ratios_must_sum_to_hundred() {
        assert!(SplitRatios::new(85.0, 0.0, 15.0).is_ok());
        assert!(SplitRatios::new(80.0, 10.0, 10.0005).is_ok());
        assert!(SplitRatios::new(80.0, 0.0, 10.0).is_err());
        assert!(SplitRatios::new(110.0, -10.0, 0.0).is_err());
    }

    #[test]
    fn test_split_sizes_floor_with_test_remainder() {
        let ratios = SplitRatios::new(85.0, 0.0, 15.0).unwrap();
        let split = split_entries(numbered(10), ratios, 42);
        assert_eq!(split.train.len(), 8);
        assert_eq!(split.val.len(), 0);
        assert_eq!(split.test.len(), 2);

        let ratios = SplitRatios::new(70.0, 15.0, 15.0).unwrap();
        let split = split_entries(numbered(7), ratios, 1);
        assert_eq!(split.train.len(), 4);
        assert_eq!(split.val.len(), 1);
        assert_eq!(split.test.len(), 2);
    }

    #[test]
    fn test_split_is_deterministic_per_seed() {
        let ratios = SplitRatios::new(50.0, 0.0, 50.0).unwrap();
        let ids = |s: &DatasetSplit| s.train.iter().map(|e| e.id.clone()).collect::<Vec<_>>();
        let a = split_entries(numbered(20), ratios, 42);
        let b = split_entries(numbered(20), ratios, 42);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_split_partitions_all_entries() {
        let ratios = SplitRatios::new(60.0, 20.0, 20.0).unwrap();
        let split = split_entries(numbered(33), ratios, 9);
        let mut all: Vec<String> = split
            .train
            .iter()
            .chain(&split.val)
            .chain(&split.test)
            .filter_map(|e| e.id_key())
            .collect();
        all.sort_by_key(|id| id.parse::<usize>().unwrap());
        let expected: Vec<String> = (0..33).map(|i| i.to_string()).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_split_file_filters_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("export.json");
        let mut entries = numbered(4);
        entries.push(fixtures::curated("skip-1", false, true));
        entries.push(fixtures::curated("skip-2", true, false));
        save_entries(&input, &entries).unwrap();

        let out = dir.path().join("splits");
        let ratios = SplitRatios::new(50.0, 0.0, 50.0).unwrap();
        let report = split_file(&input, Some(&out), ratios, 42).unwrap();
        assert_eq!(report.total, 6);
        assert_eq!(report.curated, 4);
        assert_eq!((report.train, report.val, report.test), (2, 0, 2));

        let train = load_entries(&out.join("train.json")).unwrap();
        assert!(train.iter().all(|e| e.extra.is_empty()));
        assert!(out.join("val.json").exists());
    }

    #[test]
    fn test_split_file_without_curated_entries() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("export.json");
        save_entries(&input, &[fixtures::curated("a", false, false)]).unwrap();
        let ratios = SplitRatios::new(85.0, 0.0, 15.0).unwrap();
        assert!(matches!(
            split_file(&input, None, ratios, 42),
            Err(VistuneError::Dataset(_))
        ));
    }
}
