//! Environment exported to the external stages.

use crate::config::VistuneConfig;
use crate::error::VistuneError;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Import search-path variable extended for the trainer and merge scripts.
pub const SEARCH_PATH_VAR: &str = "PYTHONPATH";
/// Variable carrying the pretrained checkpoint identifier.
pub const MODEL_NAME_VAR: &str = "MODEL_NAME";

/// Prepend `additions` to an existing search path (`src:$PYTHONPATH`).
///
/// Empty components from the existing value are dropped. An addition that
/// contains the platform separator is rejected rather than silently split.
pub fn extend_search_path(
    existing: Option<&OsStr>,
    additions: &[PathBuf],
) -> Result<OsString, VistuneError> {
    let mut parts: Vec<PathBuf> = additions
        .iter()
        .filter(|p| !p.as_os_str().is_empty())
        .cloned()
        .collect();
    if let Some(existing) = existing {
        parts.extend(std::env::split_paths(existing).filter(|p| !p.as_os_str().is_empty()));
    }
    std::env::join_paths(parts).map_err(|e| {
        VistuneError::config(format!(
            "cannot build {SEARCH_PATH_VAR} from launcher.search_paths: {e}"
        ))
    })
}

/// Environment for a stage launched from `workspace`.
pub fn stage_env(
    config: &VistuneConfig,
    workspace: &Path,
    existing_search_path: Option<&OsStr>,
) -> Result<BTreeMap<String, String>, VistuneError> {
    let additions: Vec<PathBuf> = config
        .launcher
        .search_paths
        .iter()
        .map(|p| workspace.join(p))
        .collect();
    let search_path = extend_search_path(existing_search_path, &additions)?;

    let mut env = BTreeMap::new();
    env.insert(
        SEARCH_PATH_VAR.to_string(),
        search_path.to_string_lossy().into_owned(),
    );
    env.insert(MODEL_NAME_VAR.to_string(), config.model_name.clone());
    for (key, value) in &config.launcher.env {
        env.insert(key.clone(), value.clone());
    }
    Ok(env)
}
