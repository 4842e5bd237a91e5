//! Image reference auditing and copying.

use super::entry::DatasetEntry;
use crate::error::VistuneError;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Unique image names referenced by the dataset.
pub fn referenced_images(entries: &[DatasetEntry]) -> BTreeSet<String> {
    entries
        .iter()
        .flat_map(|e| e.image_names())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageAudit {
    pub entries: usize,
    pub referenced: usize,
    /// Sorted names absent from the image folder.
    pub missing: Vec<String>,
}

/// Check that every referenced image exists under `image_folder`.
pub fn audit_images(
    entries: &[DatasetEntry],
    image_folder: &Path,
) -> Result<ImageAudit, VistuneError> {
    if !image_folder.is_dir() {
        return Err(VistuneError::not_found(format!(
            "image folder {}",
            image_folder.display()
        )));
    }
    let referenced = referenced_images(entries);
    let missing = referenced
        .iter()
        .filter(|name| !image_folder.join(name).exists())
        .cloned()
        .collect();
    Ok(ImageAudit {
        entries: entries.len(),
        referenced: referenced.len(),
        missing,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub copied: Vec<String>,
    pub not_in_source: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Copy `missing` images from `source` into `destination`.
///
/// Per-file copy failures are collected rather than aborting the batch.
pub fn recover_missing(
    missing: &[String],
    source: &Path,
    destination: &Path,
) -> Result<RecoveryReport, VistuneError> {
    if !source.is_dir() {
        return Err(VistuneError::not_found(format!(
            "source folder {}",
            source.display()
        )));
    }
    std::fs::create_dir_all(destination)?;

    let mut report = RecoveryReport::default();
    for name in missing {
        let from = source.join(name);
        if !from.exists() {
            report.not_in_source.push(name.clone());
            continue;
        }
        match std::fs::copy(&from, destination.join(name)) {
            Ok(_) => {
                debug!(image = %name, "Copied");
                report.copied.push(name.clone());
            }
            Err(e) => {
                warn!(image = %name, error = %e, "Copy failed");
                report.failed.push((name.clone(), e.to_string()));
            }
        }
    }
    report.not_in_source.sort();
    Ok(report)
}

/// Middle of a capture file name, shared by every side of the same item.
///
/// `LB808077461GB_1_1529449791_20240924050421_TO.jpg` -> `1_1529449791_20240924050421`
pub fn base_filename(name: &str) -> &str {
    let base = name.rsplit_once('_').map_or(name, |(head, _)| head);
    base.split_once('_').map_or(base, |(_, rest)| rest)
}

/// `.jpg` files directly in `folder` whose name contains `base`.
pub fn related_images(base: &str, folder: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.ends_with(".jpg") && name.contains(base)
        })
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyReport {
    pub copied: usize,
    pub not_found: Vec<PathBuf>,
}

/// Copy each entry's images from `input` to `output`, once per file.
///
/// With `all_sides`, every related capture of the item is copied instead.
pub fn copy_entry_images(
    entries: &[DatasetEntry],
    input: &Path,
    output: &Path,
    all_sides: bool,
) -> Result<CopyReport, VistuneError> {
    std::fs::create_dir_all(output)?;
    let mut copied: HashSet<PathBuf> = HashSet::new();
    let mut report = CopyReport::default();

    for name in entries.iter().flat_map(|e| e.image_names()) {
        let sources = if all_sides {
            related_images(base_filename(name), input)
        } else {
            let path = input.join(name);
            if !path.exists() {
                warn!(image = %path.display(), "Image not found");
                report.not_found.push(path);
                continue;
            }
            vec![path]
        };

        for source in sources {
            if copied.contains(&source) {
                continue;
            }
            let Some(file_name) = source.file_name() else {
                continue;
            };
            std::fs::copy(&source, output.join(file_name))?;
            copied.insert(source);
        }
    }

    report.copied = copied.len();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::entry::fixtures;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), name.as_bytes()).unwrap();
    }

    #[test]
    fn test_base_filename() {
        assert_eq!(
            base_filename("LB808077461GB_1_1529449791_20240924050421_TO.jpg"),
            "1_1529449791_20240924050421"
        );
        assert_eq!(base_filename("plain.jpg"), "plain.jpg");
        assert_eq!(base_filename("a_b.jpg"), "a");
    }

    #[test]
    fn test_audit_reports_missing_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.jpg");
        let entries = vec![
            fixtures::entry("1", &["z.jpg", "a.jpg"], "x"),
            fixtures::entry("2", &["b.jpg"], "x"),
            fixtures::entry("3", &["a.jpg"], "x"),
        ];
        let audit = audit_images(&entries, dir.path()).unwrap();
        assert_eq!(audit.entries, 3);
        assert_eq!(audit.referenced, 3);
        assert_eq!(audit.missing, vec!["b.jpg", "z.jpg"]);
    }

    #[test]
    fn test_audit_requires_folder() {
        let dir = tempfile::tempdir().unwrap();
        assert!(audit_images(&[], &dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_recover_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        touch(&source, "b.jpg");
        let dest = dir.path().join("dest");

        let report =
            recover_missing(&["b.jpg".into(), "z.jpg".into()], &source, &dest).unwrap();
        assert_eq!(report.copied, vec!["b.jpg"]);
        assert_eq!(report.not_in_source, vec!["z.jpg"]);
        assert!(report.failed.is_empty());
        assert!(dest.join("b.jpg").exists());
    }

    #[test]
    fn test_copy_entry_images_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        touch(&input, "a.jpg");
        let out = dir.path().join("out");
        let entries = vec![
            fixtures::entry("1", &["a.jpg"], "x"),
            fixtures::entry("2", &["a.jpg"], "x"),
            fixtures::entry("3", &["gone.jpg"], "x"),
        ];
        let report = copy_entry_images(&entries, &input, &out, false).unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.not_found, vec![input.join("gone.jpg")]);
        assert!(out.join("a.jpg").exists());
    }

    #[test]
    fn test_copy_entry_images_all_sides() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        for name in [
            "LB1GB_1_100_2024_TO.jpg",
            "LB1GB_1_100_2024_BM.jpg",
            "LB1GB_1_100_2024_BM.png",
            "LB2GB_1_200_2024_TO.jpg",
        ] {
            touch(&input, name);
        }
        let out = dir.path().join("out");
        let entries = vec![fixtures::entry("1", &["LB1GB_1_100_2024_TO.jpg"], "x")];
        let report = copy_entry_images(&entries, &input, &out, true).unwrap();
        assert_eq!(report.copied, 2);
        assert!(out.join("LB1GB_1_100_2024_BM.jpg").exists());
        assert!(!out.join("LB2GB_1_200_2024_TO.jpg").exists());
    }
}
