//! Fine-tune stage: validated trainer invocation.

use crate::config::{FinetuneConfig, LauncherConfig, LauncherKind, VistuneConfig};
use crate::derive::DerivedValues;
use crate::env::stage_env;
use crate::error::VistuneError;
use crate::launcher::LaunchCommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A validated fine-tune run, ready to be launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetunePlan {
    pub model_id: String,
    pub script: PathBuf,
    pub data_path: PathBuf,
    pub image_folder: PathBuf,
    pub output_dir: PathBuf,
    pub num_devices: u32,
    pub derived: DerivedValues,
    /// Trainer flags, without the launcher prefix.
    pub trainer_args: Vec<String>,
}

impl FinetunePlan {
    /// Validate `config` and build the trainer arguments.
    ///
    /// Relative paths are resolved against `workspace`.
    pub fn from_config(config: &VistuneConfig, workspace: &Path) -> Result<Self, VistuneError> {
        let ft = &config.finetune;
        validate(config)?;
        let derived = DerivedValues::from_config(ft)?;

        let plan_paths = (
            workspace.join(&ft.script),
            workspace.join(&ft.data_path),
            workspace.join(&ft.image_folder),
            workspace.join(&ft.output_dir),
        );
        let deepspeed_config = match config.launcher.kind {
            LauncherKind::Deepspeed => config
                .launcher
                .deepspeed_config
                .as_ref()
                .map(|p| workspace.join(p)),
            _ => None,
        };

        let trainer_args = trainer_args(
            &config.model_name,
            ft,
            &derived,
            TrainerPaths {
                data_path: &plan_paths.1,
                image_folder: &plan_paths.2,
                output_dir: &plan_paths.3,
                deepspeed_config: deepspeed_config.as_deref(),
            },
        );
        debug!(
            accumulation = derived.gradient_accumulation_steps,
            min_pixels = derived.pixels.min_pixels,
            max_pixels = derived.pixels.max_pixels,
            "Derived fine-tune values"
        );

        Ok(Self {
            model_id: config.model_name.clone(),
            script: plan_paths.0,
            data_path: plan_paths.1,
            image_folder: plan_paths.2,
            output_dir: plan_paths.3,
            num_devices: ft.batch.num_devices,
            derived,
            trainer_args,
        })
    }

    /// Wrap the trainer script in the configured launcher.
    pub fn command(
        &self,
        config: &VistuneConfig,
        workspace: &Path,
    ) -> Result<LaunchCommand, VistuneError> {
        let existing = std::env::var_os(crate::env::SEARCH_PATH_VAR);
        let env = stage_env(config, workspace, existing.as_deref())?;
        let script = self.script.to_string_lossy().into_owned();
        let devices = self.num_devices.to_string();

        let cmd = match config.launcher.kind {
            LauncherKind::Deepspeed => LaunchCommand::new("deepspeed").args([
                "--num_gpus".to_string(),
                devices,
                script,
            ]),
            LauncherKind::Torchrun => LaunchCommand::new("torchrun").args([
                format!("--nproc_per_node={devices}"),
                script,
            ]),
            LauncherKind::Python => {
                if self.num_devices != 1 {
                    return Err(VistuneError::config(format!(
                        "the python launcher runs a single process but num_devices is {}",
                        self.num_devices
                    )));
                }
                LaunchCommand::new(python_program(&config.launcher)).arg(script)
            }
        };

        Ok(cmd
            .args(self.trainer_args.iter().cloned())
            .envs(env)
            .current_dir(workspace))
    }

    /// Check the inputs the trainer will read before spending a launch on it.
    pub fn preflight(&self) -> Result<(), VistuneError> {
        if !self.script.is_file() {
            return Err(VistuneError::preflight(format!(
                "trainer script {} not found",
                self.script.display()
            )));
        }
        if !self.data_path.is_file() {
            return Err(VistuneError::preflight(format!(
                "dataset {} not found",
                self.data_path.display()
            )));
        }
        if !self.image_folder.is_dir() {
            return Err(VistuneError::preflight(format!(
                "image folder {} not found",
                self.image_folder.display()
            )));
        }
        Ok(())
    }
}

pub(crate) fn python_program(launcher: &LauncherConfig) -> String {
    launcher.python.to_string_lossy().into_owned()
}

fn validate(config: &VistuneConfig) -> Result<(), VistuneError> {
    let ft = &config.finetune;
    if config.model_name.trim().is_empty() {
        return Err(VistuneError::config("model_name is empty"));
    }
    if ft.lora.enable && ft.lora.rank == 0 {
        return Err(VistuneError::config("lora.rank must be positive"));
    }
    if !(0.0..1.0).contains(&ft.lora.dropout) {
        return Err(VistuneError::config(format!(
            "lora.dropout {} is outside [0, 1)",
            ft.lora.dropout
        )));
    }
    if ft.precision.bf16 && ft.precision.fp16 {
        return Err(VistuneError::config("bf16 and fp16 are mutually exclusive"));
    }
    for (name, value) in [
        ("learning_rate", ft.optim.learning_rate),
        ("merger_lr", ft.optim.merger_lr),
        ("vision_lr", ft.optim.vision_lr),
    ] {
        if value.is_nan() || value <= 0.0 {
            return Err(VistuneError::config(format!("{name} must be positive")));
        }
    }
    if !(0.0..=1.0).contains(&ft.optim.warmup_ratio) {
        return Err(VistuneError::config(format!(
            "warmup_ratio {} is outside [0, 1]",
            ft.optim.warmup_ratio
        )));
    }
    if ft.optim.num_train_epochs == 0 {
        return Err(VistuneError::config("num_train_epochs must be positive"));
    }
    Ok(())
}

struct TrainerPaths<'a> {
    data_path: &'a Path,
    image_folder: &'a Path,
    output_dir: &'a Path,
    deepspeed_config: Option<&'a Path>,
}

/// Trainer booleans are parsed by `HfArgumentParser`, which expects Python literals.
pub fn py_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Render names as a Python list literal, e.g. `['lm_head', 'embed_tokens']`.
pub fn py_list(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|s| format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

fn trainer_args(
    model_id: &str,
    ft: &FinetuneConfig,
    derived: &DerivedValues,
    paths: TrainerPaths<'_>,
) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(format!("--{flag}"));
        args.push(value);
    };
    let path = |p: &Path| p.to_string_lossy().into_owned();

    push("use_liger", py_bool(ft.use_liger).into());
    push("lora_enable", py_bool(ft.lora.enable).into());
    push("vision_lora", py_bool(ft.lora.vision_lora).into());
    push("use_dora", py_bool(ft.lora.use_dora).into());
    push("lora_namespan_exclude", py_list(&ft.lora.namespan_exclude));
    push("lora_rank", ft.lora.rank.to_string());
    push("lora_alpha", ft.lora.alpha.to_string());
    push("lora_dropout", ft.lora.dropout.to_string());
    push("num_lora_modules", ft.lora.num_lora_modules.to_string());
    if let Some(ds) = paths.deepspeed_config {
        push("deepspeed", path(ds));
    }
    push("model_id", model_id.to_string());
    push("data_path", path(paths.data_path));
    push("image_folder", path(paths.image_folder));
    push(
        "remove_unused_columns",
        py_bool(ft.remove_unused_columns).into(),
    );
    push("freeze_vision_tower", py_bool(ft.freeze.vision_tower).into());
    push("freeze_llm", py_bool(ft.freeze.llm).into());
    push("freeze_merger", py_bool(ft.freeze.merger).into());
    push("bf16", py_bool(ft.precision.bf16).into());
    push("fp16", py_bool(ft.precision.fp16).into());
    push(
        "disable_flash_attn2",
        py_bool(ft.precision.disable_flash_attn2).into(),
    );
    push("output_dir", path(paths.output_dir));
    push("num_train_epochs", ft.optim.num_train_epochs.to_string());
    push(
        "per_device_train_batch_size",
        ft.batch.batch_per_device.to_string(),
    );
    push(
        "gradient_accumulation_steps",
        derived.gradient_accumulation_steps.to_string(),
    );
    push("image_min_pixels", derived.pixels.min_pixels.to_string());
    push("image_max_pixels", derived.pixels.max_pixels.to_string());
    push("learning_rate", ft.optim.learning_rate.to_string());
    push("merger_lr", ft.optim.merger_lr.to_string());
    push("vision_lr", ft.optim.vision_lr.to_string());
    push("weight_decay", ft.optim.weight_decay.to_string());
    push("warmup_ratio", ft.optim.warmup_ratio.to_string());
    push("lr_scheduler_type", ft.optim.lr_scheduler_type.clone());
    push("logging_steps", ft.checkpointing.logging_steps.to_string());
    push("tf32", py_bool(ft.precision.tf32).into());
    push(
        "gradient_checkpointing",
        py_bool(ft.gradient_checkpointing).into(),
    );
    push("report_to", ft.checkpointing.report_to.clone());
    push("lazy_preprocess", py_bool(ft.lazy_preprocess).into());
    push("save_strategy", ft.checkpointing.save_strategy.clone());
    push("save_steps", ft.checkpointing.save_steps.to_string());
    push(
        "save_total_limit",
        ft.checkpointing.save_total_limit.to_string(),
    );
    push(
        "dataloader_num_workers",
        ft.dataloader_num_workers.to_string(),
    );

    args.extend(ft.extra_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plan(config: &VistuneConfig) -> FinetunePlan {
        FinetunePlan::from_config(config, Path::new("/ws")).unwrap()
    }

    #[test]
    fn test_reference_values_reach_trainer() {
        let config = VistuneConfig::default();
        let cmd = plan(&config).command(&config, Path::new("/ws")).unwrap();
        assert_eq!(cmd.flag_value("--gradient_accumulation_steps"), Some("4"));
        assert_eq!(cmd.flag_value("--image_min_pixels"), Some("401408"));
        assert_eq!(cmd.flag_value("--image_max_pixels"), Some("802816"));
        assert_eq!(cmd.flag_value("--per_device_train_batch_size"), Some("4"));
    }

    #[test]
    fn test_flag_rendering() {
        let config = VistuneConfig::default();
        let cmd = plan(&config).command(&config, Path::new("/ws")).unwrap();
        assert_eq!(
            cmd.flag_value("--lora_namespan_exclude"),
            Some("['lm_head', 'embed_tokens']")
        );
        assert_eq!(cmd.flag_value("--freeze_vision_tower"), Some("True"));
        assert_eq!(cmd.flag_value("--freeze_merger"), Some("False"));
        assert_eq!(cmd.flag_value("--lora_alpha"), Some("64"));
        assert_eq!(cmd.flag_value("--lora_dropout"), Some("0.05"));
        assert_eq!(cmd.flag_value("--learning_rate"), Some("0.0001"));
        assert_eq!(cmd.flag_value("--num_lora_modules"), Some("-1"));
        assert_eq!(cmd.flag_value("--model_id"), Some(config.model_name.as_str()));
        assert_eq!(cmd.flag_value("--data_path"), Some("/ws/data/train.json"));
        assert_eq!(
            cmd.flag_value("--deepspeed"),
            Some("/ws/scripts/zero3_offload.json")
        );
    }

    #[test]
    fn test_deepspeed_launcher_prefix() {
        let mut config = VistuneConfig::default();
        config.finetune.batch.num_devices = 2;
        config.finetune.batch.global_batch_size = 32;
        let p = plan(&config);
        assert_eq!(p.derived.gradient_accumulation_steps, 4);
        let cmd = p.command(&config, Path::new("/ws")).unwrap();
        assert_eq!(cmd.program, "deepspeed");
        assert_eq!(
            &cmd.args[..3],
            &["--num_gpus", "2", "/ws/src/train/train_sft.py"]
        );
        assert_eq!(cmd.current_dir.as_deref(), Some(Path::new("/ws")));
        assert!(cmd.env.contains_key("PYTHONPATH"));
    }

    #[test]
    fn test_torchrun_launcher_skips_deepspeed_flag() {
        let mut config = VistuneConfig::default();
        config.launcher.kind = LauncherKind::Torchrun;
        let cmd = plan(&config).command(&config, Path::new("/ws")).unwrap();
        assert_eq!(cmd.program, "torchrun");
        assert_eq!(cmd.args[0], "--nproc_per_node=1");
        assert_eq!(cmd.flag_value("--deepspeed"), None);
    }

    #[test]
    fn test_python_launcher_requires_single_device() {
        let mut config = VistuneConfig::default();
        config.launcher.kind = LauncherKind::Python;
        let cmd = plan(&config).command(&config, Path::new("/ws")).unwrap();
        assert_eq!(cmd.program, "python");

        config.finetune.batch.num_devices = 2;
        config.finetune.batch.global_batch_size = 8;
        let result = plan(&config).command(&config, Path::new("/ws"));
        assert!(matches!(result, Err(VistuneError::Config(_))));
    }

    #[test]
    fn test_indivisible_batch_blocks_plan() {
        let mut config = VistuneConfig::default();
        config.finetune.batch.global_batch_size = 15;
        let result = FinetunePlan::from_config(&config, Path::new("/ws"));
        assert!(matches!(
            result,
            Err(VistuneError::IndivisibleBatch { global: 15, .. })
        ));
    }

    #[test]
    fn test_validation_rejects_bad_hyperparameters() {
        let ws = Path::new("/ws");

        let mut config = VistuneConfig::default();
        config.finetune.precision.fp16 = true;
        assert!(FinetunePlan::from_config(&config, ws).is_err());

        let mut config = VistuneConfig::default();
        config.finetune.lora.dropout = 1.0;
        assert!(FinetunePlan::from_config(&config, ws).is_err());

        let mut config = VistuneConfig::default();
        config.finetune.lora.rank = 0;
        assert!(FinetunePlan::from_config(&config, ws).is_err());

        let mut config = VistuneConfig::default();
        config.finetune.optim.learning_rate = 0.0;
        assert!(FinetunePlan::from_config(&config, ws).is_err());

        let mut config = VistuneConfig::default();
        config.model_name = "  ".into();
        assert!(FinetunePlan::from_config(&config, ws).is_err());
    }

    #[test]
    fn test_extra_args_are_appended() {
        let mut config = VistuneConfig::default();
        config.finetune.extra_args = vec!["--max_seq_length".into(), "4096".into()];
        let p = plan(&config);
        let n = p.trainer_args.len();
        assert_eq!(&p.trainer_args[n - 2..], &["--max_seq_length", "4096"]);
    }

    #[test]
    fn test_py_list_escapes_quotes() {
        assert_eq!(py_list(&[]), "[]");
        assert_eq!(py_list(&["it's".to_string()]), r"['it\'s']");
    }

    #[test]
    fn test_preflight_reports_missing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let config = VistuneConfig::default();
        let p = FinetunePlan::from_config(&config, dir.path()).unwrap();
        let err = p.preflight().unwrap_err();
        assert!(err.to_string().contains("trainer script"));

        std::fs::create_dir_all(dir.path().join("src/train")).unwrap();
        std::fs::write(dir.path().join("src/train/train_sft.py"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("data/images")).unwrap();
        let err = p.preflight().unwrap_err();
        assert!(err.to_string().contains("dataset"));

        std::fs::write(dir.path().join("data/train.json"), "[]").unwrap();
        p.preflight().unwrap();
    }
}
