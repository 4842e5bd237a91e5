//! Configuration system for vistune.
//!
//! Uses `figment` for layered configuration: defaults -> user file -> workspace file ->
//! explicit file -> environment -> CLI flags. Configuration is loaded from
//! `~/.config/vistune/config.toml` and/or `.vistune/config.toml` in the workspace directory.

use crate::error::VistuneError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the per-workspace state directory.
pub const WORKSPACE_DIR: &str = ".vistune";

/// Top-level configuration for both stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VistuneConfig {
    /// Pretrained checkpoint identifier (`MODEL_NAME`).
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub finetune: FinetuneConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
}

impl Default for VistuneConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            finetune: FinetuneConfig::default(),
            merge: MergeConfig::default(),
            launcher: LauncherConfig::default(),
            dataset: DatasetConfig::default(),
        }
    }
}

fn default_model_name() -> String {
    "Qwen/Qwen2-VL-7B-Instruct".to_string()
}

/// Fine-tune stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Trainer entry point, relative to the workspace.
    pub script: PathBuf,
    /// Labeled dataset file.
    pub data_path: PathBuf,
    /// Folder the dataset's image names resolve against.
    pub image_folder: PathBuf,
    /// Where the trainer writes adapters and checkpoints.
    pub output_dir: PathBuf,
    pub batch: BatchConfig,
    pub pixels: PixelConfig,
    pub lora: LoraConfig,
    pub freeze: FreezeConfig,
    pub precision: PrecisionConfig,
    pub optim: OptimConfig,
    pub checkpointing: CheckpointingConfig,
    pub dataloader_num_workers: u32,
    pub gradient_checkpointing: bool,
    pub use_liger: bool,
    pub lazy_preprocess: bool,
    pub remove_unused_columns: bool,
    /// Passed to the trainer verbatim after the generated flags.
    pub extra_args: Vec<String>,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("src/train/train_sft.py"),
            data_path: PathBuf::from("data/train.json"),
            image_folder: PathBuf::from("data/images"),
            output_dir: PathBuf::from("output/lora"),
            batch: BatchConfig::default(),
            pixels: PixelConfig::default(),
            lora: LoraConfig::default(),
            freeze: FreezeConfig::default(),
            precision: PrecisionConfig::default(),
            optim: OptimConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            dataloader_num_workers: 4,
            gradient_checkpointing: true,
            use_liger: true,
            lazy_preprocess: true,
            remove_unused_columns: false,
            extra_args: Vec::new(),
        }
    }
}

/// Batch geometry; accumulation steps are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub global_batch_size: u32,
    pub batch_per_device: u32,
    pub num_devices: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            global_batch_size: 16,
            batch_per_device: 4,
            num_devices: 1,
        }
    }
}

/// Image pixel bounds expressed as tile counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelConfig {
    pub min_tiles: u64,
    pub max_tiles: u64,
    pub tile_size: u64,
}

impl Default for PixelConfig {
    fn default() -> Self {
        Self {
            min_tiles: 512,
            max_tiles: 1024,
            tile_size: 28,
        }
    }
}

/// LoRA adapter hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub enable: bool,
    pub vision_lora: bool,
    pub use_dora: bool,
    pub rank: u32,
    pub alpha: f32,
    pub dropout: f32,
    /// Module names excluded from adapter injection.
    pub namespan_exclude: Vec<String>,
    /// `-1` targets every eligible module.
    pub num_lora_modules: i32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            enable: true,
            vision_lora: false,
            use_dora: false,
            rank: 64,
            alpha: 64.0,
            dropout: 0.05,
            namespan_exclude: vec!["lm_head".into(), "embed_tokens".into()],
            num_lora_modules: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeConfig {
    pub vision_tower: bool,
    pub llm: bool,
    pub merger: bool,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            vision_tower: true,
            llm: true,
            merger: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub bf16: bool,
    pub fp16: bool,
    pub tf32: bool,
    pub disable_flash_attn2: bool,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            bf16: true,
            fp16: false,
            tf32: true,
            disable_flash_attn2: false,
        }
    }
}

/// Optimizer and scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub learning_rate: f64,
    pub merger_lr: f64,
    pub vision_lr: f64,
    pub weight_decay: f64,
    pub warmup_ratio: f64,
    pub lr_scheduler_type: String,
    pub num_train_epochs: u32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            merger_lr: 1e-5,
            vision_lr: 2e-6,
            weight_decay: 0.1,
            warmup_ratio: 0.03,
            lr_scheduler_type: "cosine".to_string(),
            num_train_epochs: 1,
        }
    }
}

/// Trainer logging and checkpoint-saving strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    pub logging_steps: u32,
    pub report_to: String,
    pub save_strategy: String,
    pub save_steps: u32,
    pub save_total_limit: u32,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            logging_steps: 1,
            report_to: "tensorboard".to_string(),
            save_strategy: "steps".to_string(),
            save_steps: 200,
            save_total_limit: 10,
        }
    }
}

/// Merge stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub script: PathBuf,
    /// Trained adapter directory. Defaults to `finetune.output_dir`.
    pub model_path: Option<PathBuf>,
    /// Base checkpoint identifier. Defaults to `model_name`.
    pub model_base: Option<String>,
    pub save_model_path: PathBuf,
    pub safe_serialization: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("src/merge_lora_weights.py"),
            model_path: None,
            model_base: None,
            save_model_path: PathBuf::from("output/merged"),
            safe_serialization: true,
        }
    }
}

/// Which distributed launcher wraps the trainer script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    #[default]
    Deepspeed,
    Torchrun,
    Python,
}

impl std::fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deepspeed => write!(f, "deepspeed"),
            Self::Torchrun => write!(f, "torchrun"),
            Self::Python => write!(f, "python"),
        }
    }
}

/// Subprocess launch configuration shared by both stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub kind: LauncherKind,
    /// Python interpreter used for the merge stage and the `python` launcher.
    pub python: PathBuf,
    /// DeepSpeed JSON config handed to the trainer.
    pub deepspeed_config: Option<PathBuf>,
    /// Prepended to `PYTHONPATH`, relative to the workspace.
    pub search_paths: Vec<PathBuf>,
    /// Kill the stage after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Extra environment for both stages.
    pub env: BTreeMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            kind: LauncherKind::Deepspeed,
            python: PathBuf::from("python"),
            deepspeed_config: Some(PathBuf::from("scripts/zero3_offload.json")),
            search_paths: vec![PathBuf::from("src")],
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }
}

/// Defaults for the dataset preparation tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub seed: u64,
    pub train_pct: f64,
    pub val_pct: f64,
    pub test_pct: f64,
    /// Target size for `dataset compress`, in bytes.
    pub max_image_bytes: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            train_pct: 85.0,
            val_pct: 0.0,
            test_pct: 15.0,
            max_image_bytes: 500 * 1024,
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "vistune", "vistune")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_DIR).join("config.toml")
}

/// Load configuration with layered sources.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<VistuneConfig, VistuneError> {
    let mut figment = Figment::from(Serialized::defaults(VistuneConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(VistuneError::not_found(format!(
                "config file {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // The scripts select the checkpoint through a bare MODEL_NAME variable.
    figment = figment.merge(
        Env::raw()
            .only(&["MODEL_NAME"])
            .map(|_| "model_name".into()),
    );

    // VISTUNE_FINETUNE__BATCH__NUM_DEVICES, VISTUNE_MERGE__SAVE_MODEL_PATH, etc.
    figment = figment.merge(Env::prefixed("VISTUNE_").split("__"));

    figment.extract().map_err(|e| Box::new(e).into())
}

/// Check whether any vistune configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}

/// Render a configuration as pretty TOML.
pub fn to_toml(config: &VistuneConfig) -> Result<String, VistuneError> {
    Ok(toml::to_string_pretty(config)?)
}

/// Write the default configuration to `<workspace>/.vistune/config.toml`.
///
/// Refuses to replace an existing file.
pub fn write_default_config(workspace: &Path) -> Result<PathBuf, VistuneError> {
    let path = workspace_config_path(workspace);
    if path.exists() {
        return Err(VistuneError::already_exists(format!(
            "configuration file {}",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, to_toml(&VistuneConfig::default())?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = VistuneConfig::default();
        assert_eq!(config.finetune.batch.global_batch_size, 16);
        assert_eq!(config.finetune.batch.batch_per_device, 4);
        assert_eq!(config.finetune.batch.num_devices, 1);
        assert_eq!(config.finetune.pixels.min_tiles, 512);
        assert_eq!(config.finetune.pixels.max_tiles, 1024);
        assert_eq!(config.launcher.kind, LauncherKind::Deepspeed);
        assert!(config.merge.safe_serialization);
    }

    #[test]
    fn test_toml_roundtrip_preserves_config() {
        let mut config = VistuneConfig::default();
        config.finetune.lora.rank = 8;
        config.launcher.env.insert("NCCL_DEBUG".into(), "INFO".into());
        let text = to_toml(&config).unwrap();
        let parsed: VistuneConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: VistuneConfig = toml::from_str(
            r#"
            model_name = "Qwen/Qwen2.5-VL-3B-Instruct"

            [finetune.batch]
            num_devices = 2
            "#,
        )
        .unwrap();
        assert_eq!(parsed.model_name, "Qwen/Qwen2.5-VL-3B-Instruct");
        assert_eq!(parsed.finetune.batch.num_devices, 2);
        assert_eq!(parsed.finetune.batch.global_batch_size, 16);
        assert_eq!(parsed.finetune.optim.lr_scheduler_type, "cosine");
    }

    #[test]
    fn test_launcher_kind_serde() {
        let kind: LauncherKind = serde_json::from_str("\"torchrun\"").unwrap();
        assert_eq!(kind, LauncherKind::Torchrun);
        assert_eq!(LauncherKind::Python.to_string(), "python");
    }

    #[test]
    fn test_load_config_reads_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[merge]\nsave_model_path = \"out/merged-v2\"\n").unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(
            config.merge.save_model_path,
            PathBuf::from("out/merged-v2")
        );
    }

    #[test]
    fn test_load_config_explicit_file_wins_over_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = workspace_config_path(dir.path());
        std::fs::create_dir_all(ws_path.parent().unwrap()).unwrap();
        std::fs::write(&ws_path, "[finetune.lora]\nrank = 16\n").unwrap();
        let explicit = dir.path().join("override.toml");
        std::fs::write(&explicit, "[finetune.lora]\nrank = 32\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.finetune.lora.rank, 32);
    }

    #[test]
    fn test_load_config_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(None, Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(VistuneError::NotFound(_))));
    }

    #[test]
    fn test_write_default_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_default_config(dir.path()).unwrap();
        assert!(path.exists());
        assert!(config_exists(Some(dir.path())));
        assert!(matches!(
            write_default_config(dir.path()),
            Err(VistuneError::AlreadyExists(_))
        ));
    }
}
