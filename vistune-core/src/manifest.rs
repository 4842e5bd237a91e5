//! Run manifests: one JSON record per stage launch.

use crate::config::{VistuneConfig, WORKSPACE_DIR};
use crate::derive::DerivedValues;
use crate::error::VistuneError;
use crate::launcher::LaunchCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Which stage a manifest records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Finetune,
    Merge,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finetune => write!(f, "finetune"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Status of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub id: String,
    pub stage: Stage,
    pub command: LaunchCommand,
    #[serde(default)]
    pub derived: Option<DerivedValues>,
    /// SHA-256 of the JSON-serialized configuration.
    pub config_hash: String,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunManifest {
    pub fn start(
        stage: Stage,
        command: LaunchCommand,
        derived: Option<DerivedValues>,
        config: &VistuneConfig,
    ) -> Result<Self, VistuneError> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            stage,
            command,
            derived,
            config_hash: config_hash(config)?,
            status: RunStatus::Running,
            exit_code: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        })
    }

    pub fn succeed(&mut self, exit_code: i32) {
        self.status = RunStatus::Succeeded;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, err: &VistuneError) {
        self.status = match err {
            VistuneError::Cancelled(_) => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        if let VistuneError::ProcessFailed { code, .. } = err {
            self.exit_code = *code;
        }
        self.error = Some(err.to_string());
        self.finished_at = Some(Utc::now());
    }
}

pub fn config_hash(config: &VistuneConfig) -> Result<String, VistuneError> {
    let bytes = serde_json::to_vec(config)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Stores manifests under `<workspace>/.vistune/runs`.
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join(WORKSPACE_DIR).join("runs"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, manifest: &RunManifest) -> Result<PathBuf, VistuneError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", manifest.id));
        std::fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
        Ok(path)
    }

    /// All readable manifests, newest first. Unparseable files are skipped.
    pub fn list(&self) -> Result<Vec<RunManifest>, VistuneError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<RunManifest>(&content) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping manifest"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
