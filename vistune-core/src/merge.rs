//! Merge stage: fold a trained adapter back into its base checkpoint.

use crate::config::VistuneConfig;
use crate::env::stage_env;
use crate::error::VistuneError;
use crate::finetune::python_program;
use crate::launcher::LaunchCommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// File a PEFT adapter directory is expected to carry.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// A resolved merge invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub script: PathBuf,
    /// Trained adapter directory (the fine-tune output).
    pub model_path: PathBuf,
    pub model_base: String,
    pub save_model_path: PathBuf,
    pub safe_serialization: bool,
}

impl MergePlan {
    pub fn from_config(config: &VistuneConfig, workspace: &Path) -> Result<Self, VistuneError> {
        let merge = &config.merge;
        let model_path = workspace.join(
            merge
                .model_path
                .as_ref()
                .unwrap_or(&config.finetune.output_dir),
        );
        let model_base = merge
            .model_base
            .clone()
            .unwrap_or_else(|| config.model_name.clone());
        if model_base.trim().is_empty() {
            return Err(VistuneError::config("merge base model is empty"));
        }
        let save_model_path = workspace.join(&merge.save_model_path);
        if save_model_path == model_path {
            return Err(VistuneError::config(format!(
                "merge would overwrite the adapter directory {}",
                model_path.display()
            )));
        }
        Ok(Self {
            script: workspace.join(&merge.script),
            model_path,
            model_base,
            save_model_path,
            safe_serialization: merge.safe_serialization,
        })
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--model-path".to_string(),
            self.model_path.to_string_lossy().into_owned(),
            "--model-base".to_string(),
            self.model_base.clone(),
            "--save-model-path".to_string(),
            self.save_model_path.to_string_lossy().into_owned(),
        ];
        if self.safe_serialization {
            args.push("--safe-serialization".to_string());
        }
        args
    }

    pub fn command(
        &self,
        config: &VistuneConfig,
        workspace: &Path,
    ) -> Result<LaunchCommand, VistuneError> {
        let existing = std::env::var_os(crate::env::SEARCH_PATH_VAR);
        let env = stage_env(config, workspace, existing.as_deref())?;
        Ok(LaunchCommand::new(python_program(&config.launcher))
            .arg(self.script.to_string_lossy())
            .args(self.args())
            .envs(env)
            .current_dir(workspace))
    }

    pub fn preflight(&self) -> Result<(), VistuneError> {
        if !self.script.is_file() {
            return Err(VistuneError::preflight(format!(
                "merge script {} not found",
                self.script.display()
            )));
        }
        if !self.model_path.is_dir() {
            return Err(VistuneError::preflight(format!(
                "adapter directory {} not found",
                self.model_path.display()
            )));
        }
        if !self.model_path.join(ADAPTER_CONFIG_FILE).exists() {
            warn!(
                path = %self.model_path.display(),
                "No {ADAPTER_CONFIG_FILE} in adapter directory"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_finetune_output() {
        let config = VistuneConfig::default();
        let plan = MergePlan::from_config(&config, Path::new("/ws")).unwrap();
        assert_eq!(plan.model_path, PathBuf::from("/ws/output/lora"));
        assert_eq!(plan.model_base, config.model_name);
        assert_eq!(plan.save_model_path, PathBuf::from("/ws/output/merged"));
    }

    #[test]
    fn test_args_shape() {
        let mut config = VistuneConfig::default();
        config.merge.model_base = Some("org/base".into());
        config.merge.model_path = Some(PathBuf::from("/abs/adapter"));
        let plan = MergePlan::from_config(&config, Path::new("/ws")).unwrap();
        assert_eq!(
            plan.args(),
            vec![
                "--model-path",
                "/abs/adapter",
                "--model-base",
                "org/base",
                "--save-model-path",
                "/ws/output/merged",
                "--safe-serialization",
            ]
        );
    }

    #[test]
    fn test_safe_serialization_off() {
        let mut config = VistuneConfig::default();
        config.merge.safe_serialization = false;
        let plan = MergePlan::from_config(&config, Path::new("/ws")).unwrap();
        assert!(!plan.args().iter().any(|a| a == "--safe-serialization"));
    }

    #[test]
    fn test_command_uses_python() {
        let config = VistuneConfig::default();
        let plan = MergePlan::from_config(&config, Path::new("/ws")).unwrap();
        let cmd = plan.command(&config, Path::new("/ws")).unwrap();
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args[0], "/ws/src/merge_lora_weights.py");
        assert_eq!(cmd.flag_value("--model-path"), Some("/ws/output/lora"));
        assert_eq!(cmd.env["MODEL_NAME"], config.model_name);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_fails_on_unjoinable_search_path() {
        let mut config = VistuneConfig::default();
        config.launcher.search_paths = vec![PathBuf::from("src:extra")];
        let plan = MergePlan::from_config(&config, Path::new("/ws")).unwrap();
        assert!(matches!(
            plan.command(&config, Path::new("/ws")),
            Err(VistuneError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_overwriting_adapter() {
        let mut config = VistuneConfig::default();
        config.merge.save_model_path = config.finetune.output_dir.clone();
        assert!(matches!(
            MergePlan::from_config(&config, Path::new("/ws")),
            Err(VistuneError::Config(_))
        ));
    }

    #[test]
    fn test_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let config = VistuneConfig::default();
        let plan = MergePlan::from_config(&config, dir.path()).unwrap();
        assert!(plan.preflight().is_err());

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/merge_lora_weights.py"), "").unwrap();
        let err = plan.preflight().unwrap_err();
        assert!(err.to_string().contains("adapter directory"));

        std::fs::create_dir_all(dir.path().join("output/lora")).unwrap();
        plan.preflight().unwrap();
    }
}
