//! Conversation dataset records and file IO.

use crate::error::VistuneError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// One image name or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Single(String),
    Many(Vec<String>),
}

impl ImageRef {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Single(name) => vec![name.as_str()],
            Self::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(names) => names.len(),
        }
    }
}

/// A single conversation turn. `value` is usually text but may hold structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub from: String,
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A labeled training record.
///
/// Fields absent from the file stay absent when the entry is written back,
/// and `id` keeps its JSON type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversations: Option<Vec<Turn>>,
    /// Review flags and anything else the labeling tool attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetEntry {
    /// Reviewed and approved for training (`checked` and `use_in_training` both true).
    pub fn is_curated(&self) -> bool {
        let flag = |key: &str| self.extra.get(key).and_then(Value::as_bool) == Some(true);
        flag("checked") && flag("use_in_training")
    }

    /// Keep only `id`, `image` and `conversations`.
    pub fn stripped(mut self) -> Self {
        self.extra.clear();
        self
    }

    pub fn image_names(&self) -> Vec<&str> {
        self.image.as_ref().map(ImageRef::names).unwrap_or_default()
    }

    pub fn turns(&self) -> &[Turn] {
        self.conversations.as_deref().unwrap_or_default()
    }

    /// Id as text for lookups; `None` when the entry has no id.
    pub fn id_key(&self) -> Option<String> {
        id_label(&self.id)
    }
}

/// Render a JSON id for lookups and reports. Strings are taken verbatim.
pub fn id_label(id: &Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Read any JSON document.
pub fn load_document(path: &Path) -> Result<Value, VistuneError> {
    if !path.exists() {
        return Err(VistuneError::not_found(format!(
            "dataset file {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| VistuneError::dataset(format!("invalid JSON in {}: {e}", path.display())))
}

/// Write a JSON document pretty-printed, creating parent directories.
pub fn save_document(path: &Path, document: &Value) -> Result<(), VistuneError> {
    write_pretty(path, document)
}

/// Read a JSON array of entries.
pub fn load_entries(path: &Path) -> Result<Vec<DatasetEntry>, VistuneError> {
    serde_json::from_value(load_document(path)?)
        .map_err(|e| VistuneError::dataset(format!("invalid dataset {}: {e}", path.display())))
}

/// Write entries as pretty JSON, creating parent directories.
pub fn save_entries(path: &Path, entries: &[DatasetEntry]) -> Result<(), VistuneError> {
    write_pretty(path, entries)
}

fn write_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), VistuneError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    pub fn entry(id: &str, images: &[&str], prompt: &str) -> DatasetEntry {
        let image = match images {
            [single] => Some(ImageRef::Single(single.to_string())),
            many => Some(ImageRef::Many(many.iter().map(|s| s.to_string()).collect())),
        };
        DatasetEntry {
            id: json!(id),
            image,
            conversations: Some(vec![
                Turn {
                    from: "human".into(),
                    value: json!(prompt),
                    extra: Map::new(),
                },
                Turn {
                    from: "gpt".into(),
                    value: json!("{\"weight\": \"1.2kg\"}"),
                    extra: Map::new(),
                },
            ]),
            extra: Map::new(),
        }
    }

    pub fn curated(id: &str, checked: bool, use_in_training: bool) -> DatasetEntry {
        let mut e = entry(id, &[format!("{id}.jpg").as_str()], "<image>\nRead the label.");
        e.extra.insert("checked".into(), json!(checked));
        e.extra.insert("use_in_training".into(), json!(use_in_training));
        e
    }
}
