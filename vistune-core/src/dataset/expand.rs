//! Turn JSON-encoded conversation strings back into structured values.

use super::entry::{load_document, save_document};
use crate::error::VistuneError;
use serde_json::Value;
use std::path::Path;

/// Replace a string holding any JSON value with the parsed value; recurse into arrays.
///
/// `"123"` becomes `123` and `"null"` becomes `null`. Text that does not parse
/// stays as it is, and objects are not descended into.
pub fn expand_value(value: Value) -> Value {
    match value {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(text),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(expand_value).collect()),
        other => other,
    }
}

/// Expand the `value` of every conversation turn in place. Returns how many turns changed.
///
/// Entries that are not objects or carry no `conversations` are left alone.
pub fn expand_entries(entries: &mut [Value]) -> usize {
    let mut changed = 0;
    let turns = entries
        .iter_mut()
        .filter_map(|e| e.get_mut("conversations").and_then(Value::as_array_mut))
        .flatten();
    for value in turns.filter_map(|t| t.get_mut("value")) {
        let before = value.clone();
        *value = expand_value(std::mem::take(value));
        if *value != before {
            changed += 1;
        }
    }
    changed
}

/// Expand a whole document: an array of entries, or any other value as a whole.
pub fn expand_document(document: &mut Value) -> usize {
    if let Value::Array(entries) = document {
        return expand_entries(entries);
    }
    let before = document.clone();
    *document = expand_value(std::mem::take(document));
    usize::from(*document != before)
}

/// Expand `input` into `output`. An existing output is only replaced with `overwrite`.
pub fn expand_file(input: &Path, output: &Path, overwrite: bool) -> Result<usize, VistuneError> {
    if output.exists() && !overwrite {
        return Err(VistuneError::already_exists(format!(
            "output file {}",
            output.display()
        )));
    }
    let mut document = load_document(input)?;
    let changed = expand_document(&mut document);
    save_document(output, &document)?;
    Ok(changed)
}
