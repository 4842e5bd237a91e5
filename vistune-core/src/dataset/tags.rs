//! Keeps `<image>` placeholders in user turns in step with each entry's images.
//!
//! Works on the raw JSON so everything else in the file is written back as it was read.

use super::entry::{id_label, load_document, save_document};
use crate::error::VistuneError;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

pub const IMAGE_TAG: &str = "<image>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagFix {
    pub id: String,
    pub before: usize,
    pub after: usize,
}

fn image_count(image: &Value) -> Option<usize> {
    match image {
        Value::String(_) => Some(1),
        Value::Array(names) => Some(names.len()),
        _ => None,
    }
}

fn is_user_turn(turn: &Value) -> bool {
    matches!(
        turn.get("from").and_then(Value::as_str),
        Some("user" | "human")
    )
}

/// Rewrite user turns whose tag count differs from the image count.
///
/// Existing tags are removed, the text trimmed, and one `<image>\n` per
/// image is prepended. Entries lacking `image` or `conversations` pass
/// through untouched.
pub fn fix_image_tags(entries: &mut [Value]) -> Vec<TagFix> {
    let mut fixes = Vec::new();
    for entry in entries.iter_mut() {
        let Some(object) = entry.as_object_mut() else {
            continue;
        };
        let Some(wanted) = object.get("image").and_then(image_count) else {
            continue;
        };
        let label = object
            .get("id")
            .and_then(id_label)
            .unwrap_or_else(|| "unknown".to_string());
        let Some(Value::Array(turns)) = object.get_mut("conversations") else {
            continue;
        };
        for turn in turns.iter_mut().filter(|t| is_user_turn(t)) {
            let Some(Value::String(text)) = turn.get_mut("value") else {
                continue;
            };
            let current = text.matches(IMAGE_TAG).count();
            if current == wanted {
                continue;
            }
            let body = text.replace(IMAGE_TAG, "");
            *text = format!("{}{}", format!("{IMAGE_TAG}\n").repeat(wanted), body.trim());
            info!(id = %label, from = current, to = wanted, "Fixed image tags");
            fixes.push(TagFix {
                id: label.clone(),
                before: current,
                after: wanted,
            });
        }
    }
    fixes
}

#[derive(Debug, Clone, Serialize)]
pub struct TagReport {
    pub output: PathBuf,
    pub backup: Option<PathBuf>,
    pub fixes: Vec<TagFix>,
}

/// Fix a dataset file. Writes to `output`, or back over `input` when absent.
pub fn fix_tags_file(
    input: &Path,
    output: Option<&Path>,
    backup: bool,
) -> Result<TagReport, VistuneError> {
    let mut document = load_document(input)?;
    let Value::Array(entries) = &mut document else {
        return Err(VistuneError::dataset(format!(
            "{} is not a JSON array of entries",
            input.display()
        )));
    };

    let backup = if backup {
        let mut name = input.as_os_str().to_owned();
        name.push(".backup");
        let path = PathBuf::from(name);
        std::fs::copy(input, &path)?;
        Some(path)
    } else {
        None
    };

    let fixes = fix_image_tags(entries);
    let output = output.unwrap_or(input).to_path_buf();
    save_document(&output, &document)?;
    Ok(TagReport {
        output,
        backup,
        fixes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::entry::{fixtures, save_entries};
    use serde_json::json;

    fn raw(entry: crate::dataset::DatasetEntry) -> Value {
        serde_json::to_value(entry).unwrap()
    }

    #[test]
    fn test_adds_missing_tags() {
        let mut entries = vec![raw(fixtures::entry(
            "a",
            &["a_TO.jpg", "a_BM.jpg"],
            "<image>\nRead both.",
        ))];
        let fixes = fix_image_tags(&mut entries);
        assert_eq!(
            fixes,
            vec![TagFix {
                id: "a".into(),
                before: 1,
                after: 2
            }]
        );
        assert_eq!(
            entries[0]["conversations"][0]["value"],
            json!("<image>\n<image>\nRead both.")
        );
    }

    #[test]
    fn test_removes_surplus_tags_anywhere() {
        let mut entries = vec![raw(fixtures::entry("b", &["b.jpg"], "Look <image> here <image>  "))];
        fix_image_tags(&mut entries);
        assert_eq!(
            entries[0]["conversations"][0]["value"],
            json!("<image>\nLook  here")
        );
    }

    #[test]
    fn test_matching_counts_untouched() {
        let mut entries = vec![raw(fixtures::entry("c", &["c.jpg"], "<image>\nOk."))];
        let before = entries.clone();
        assert!(fix_image_tags(&mut entries).is_empty());
        assert_eq!(entries, before);
    }

    #[test]
    fn test_assistant_turns_and_incomplete_entries_skipped() {
        let mut entry = raw(fixtures::entry("d", &["d.jpg"], "<image>\nOk."));
        entry["conversations"][1]["value"] = json!("no tags in the answer");
        let mut entries = vec![
            entry,
            json!({"id": "e", "conversations": [{"from": "human", "value": "text only"}]}),
            json!({"id": "f", "image": null, "conversations": [{"from": "human", "value": "x"}]}),
            json!({"id": "g", "image": "g.jpg"}),
        ];
        let before = entries.clone();
        assert!(fix_image_tags(&mut entries).is_empty());
        assert_eq!(entries, before);
    }

    #[test]
    fn test_fix_reports_numeric_and_missing_ids() {
        let mut entries = vec![
            json!({"id": 7, "image": "a.jpg", "conversations": [{"from": "user", "value": "hi"}]}),
            json!({"image": "b.jpg", "conversations": [{"from": "human", "value": "hi"}]}),
        ];
        let ids: Vec<String> = fix_image_tags(&mut entries)
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["7", "unknown"]);
        assert_eq!(entries[0]["id"], json!(7));
        assert!(entries[1].get("id").is_none());
    }

    #[test]
    fn test_fix_tags_file_keeps_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("train.json");
        let document = json!([
            {"id": 7, "image": "a.jpg", "conversations": [{"from": "human", "value": "<image>\nhi"}]},
            {"image": null, "note": "kept"},
            {"id": "x", "image": "x.jpg"}
        ]);
        save_document(&input, &document).unwrap();

        let report = fix_tags_file(&input, None, false).unwrap();
        assert!(report.fixes.is_empty());
        assert!(report.backup.is_none());
        assert_eq!(load_document(&input).unwrap(), document);
    }

    #[test]
    fn test_fix_tags_file_rejects_non_array() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("one.json");
        save_document(&input, &json!({"id": 1})).unwrap();
        assert!(matches!(
            fix_tags_file(&input, None, false),
            Err(VistuneError::Dataset(_))
        ));
    }

    #[test]
    fn test_fix_tags_file_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("train.json");
        save_entries(&input, &[fixtures::entry("a", &["a.jpg"], "no tag")]).unwrap();
        let original = std::fs::read_to_string(&input).unwrap();

        let report = fix_tags_file(&input, None, true).unwrap();
        assert_eq!(report.fixes.len(), 1);
        assert_eq!(report.output, input);
        let backup = report.backup.unwrap();
        assert_eq!(backup, dir.path().join("train.json.backup"));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), original);

        let fixed = load_document(&input).unwrap();
        assert_eq!(fixed[0]["conversations"][0]["value"], json!("<image>\nno tag"));
    }
}
