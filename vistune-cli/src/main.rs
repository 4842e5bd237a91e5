//! vistune CLI: launch LoRA fine-tuning and merging, and prepare datasets.

mod commands;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use vistune_core::VistuneConfig;
use vistune_core::config::LauncherKind;

/// vistune: fine-tune and merge LoRA adapters for vision-language models
#[derive(Parser, Debug)]
#[command(name = "vistune", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (applied over user and workspace config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Launch the LoRA fine-tuning stage
    Finetune {
        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        overrides: FinetuneOverrides,
    },
    /// Merge a trained adapter into its base model
    Merge {
        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        overrides: MergeOverrides,
    },
    /// Fine-tune, then merge the resulting adapter
    Run {
        /// Print both commands instead of running them
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        finetune: FinetuneOverrides,
        #[command(flatten)]
        merge: MergeOverrides,
    },
    /// Show derived values and the commands a run would launch
    Plan,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List recorded stage runs
    Runs {
        /// Show at most this many runs
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Check the Python environment, launcher and GPUs
    Doctor,
    /// Dataset preparation tools
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config to <workspace>/.vistune/config.toml
    Init,
    /// Show the effective configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum DatasetAction {
    /// Keep curated entries and split them into train/val/test files
    Split {
        /// Annotated dataset file
        input: PathBuf,
        /// Directory for train.json, val.json and test.json (defaults to the input's)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Train percentage
        #[arg(long)]
        train: Option<f64>,
        /// Validation percentage
        #[arg(long)]
        val: Option<f64>,
        /// Test percentage
        #[arg(long)]
        test: Option<f64>,
        /// Shuffle seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Make the <image> tags of user turns match each entry's image count
    FixTags {
        input: PathBuf,
        /// Write here instead of over the input
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Copy the input to <input>.backup first
        #[arg(long)]
        backup: bool,
    },
    /// Replace JSON-encoded conversation values with structured JSON
    ExpandJson {
        input: PathBuf,
        output: PathBuf,
        /// Overwrite an existing output file
        #[arg(short, long)]
        force: bool,
    },
    /// Report referenced images missing from the image folder
    ValidateImages {
        input: PathBuf,
        /// Image folder (defaults to finetune.image_folder)
        #[arg(long)]
        image_folder: Option<PathBuf>,
        /// Copy missing images from this folder
        #[arg(long, requires = "copy_to")]
        copy_from: Option<PathBuf>,
        /// Destination for recovered images
        #[arg(long, requires = "copy_from")]
        copy_to: Option<PathBuf>,
    },
    /// Copy the images a dataset references into another folder
    CopyImages {
        input: PathBuf,
        /// Folder holding the images
        #[arg(long)]
        from: PathBuf,
        /// Destination folder
        #[arg(long)]
        to: PathBuf,
        /// Copy every capture of each item, not only the referenced one
        #[arg(long)]
        all_sides: bool,
    },
    /// Pull the entries listed in a reference file out of a source file
    Extract {
        /// File whose entry ids select what to keep
        reference: PathBuf,
        /// File to take entries from
        source: PathBuf,
        output: PathBuf,
    },
    /// Re-encode JPEGs in a directory until each fits a size limit
    Compress {
        dir: PathBuf,
        /// Size limit in bytes (defaults to dataset.max_image_bytes)
        #[arg(long)]
        max_bytes: Option<u64>,
        /// Files encoded concurrently
        #[arg(short, long)]
        jobs: Option<usize>,
    },
}

/// Fine-tune settings that can be overridden per invocation.
#[derive(clap::Args, Debug, Default, Clone)]
struct FinetuneOverrides {
    /// Base model checkpoint id
    #[arg(long)]
    model_name: Option<String>,
    /// Training dataset file
    #[arg(long)]
    data_path: Option<PathBuf>,
    #[arg(long)]
    image_folder: Option<PathBuf>,
    /// Adapter output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    num_devices: Option<u32>,
    #[arg(long)]
    global_batch_size: Option<u32>,
    #[arg(long)]
    batch_per_device: Option<u32>,
    #[arg(long)]
    epochs: Option<u32>,
    #[arg(long)]
    learning_rate: Option<f64>,
    /// deepspeed, torchrun or python
    #[arg(long, value_parser = parse_launcher)]
    launcher: Option<LauncherKind>,
}

impl FinetuneOverrides {
    fn apply(&self, config: &mut VistuneConfig) {
        let ft = &mut config.finetune;
        if let Some(model) = &self.model_name {
            config.model_name = model.clone();
        }
        if let Some(path) = &self.data_path {
            ft.data_path = path.clone();
        }
        if let Some(path) = &self.image_folder {
            ft.image_folder = path.clone();
        }
        if let Some(path) = &self.output_dir {
            ft.output_dir = path.clone();
        }
        if let Some(n) = self.num_devices {
            ft.batch.num_devices = n;
        }
        if let Some(n) = self.global_batch_size {
            ft.batch.global_batch_size = n;
        }
        if let Some(n) = self.batch_per_device {
            ft.batch.batch_per_device = n;
        }
        if let Some(n) = self.epochs {
            ft.optim.num_train_epochs = n;
        }
        if let Some(lr) = self.learning_rate {
            ft.optim.learning_rate = lr;
        }
        if let Some(kind) = self.launcher {
            config.launcher.kind = kind;
        }
    }
}

/// Merge settings that can be overridden per invocation.
#[derive(clap::Args, Debug, Default, Clone)]
struct MergeOverrides {
    /// Adapter directory (defaults to finetune.output_dir)
    #[arg(long)]
    model_path: Option<PathBuf>,
    /// Base model the adapter was trained on (defaults to model_name)
    #[arg(long)]
    model_base: Option<String>,
    /// Merged checkpoint directory
    #[arg(long)]
    save_model_path: Option<PathBuf>,
}

impl MergeOverrides {
    fn apply(&self, config: &mut VistuneConfig) {
        if let Some(path) = &self.model_path {
            config.merge.model_path = Some(path.clone());
        }
        if let Some(base) = &self.model_base {
            config.merge.model_base = Some(base.clone());
        }
        if let Some(path) = &self.save_model_path {
            config.merge.save_model_path = path.clone();
        }
    }
}

/// Resolve the workspace to an absolute path; a missing directory is an error.
fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("workspace {} not found", path.display()))?;
    if !resolved.is_dir() {
        anyhow::bail!("workspace {} is not a directory", path.display());
    }
    Ok(resolved)
}

fn parse_launcher(s: &str) -> Result<LauncherKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "deepspeed" => Ok(LauncherKind::Deepspeed),
        "torchrun" => Ok(LauncherKind::Torchrun),
        "python" => Ok(LauncherKind::Python),
        other => Err(format!(
            "unknown launcher '{other}' (expected deepspeed, torchrun or python)"
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "vistune", "vistune")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "vistune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = resolve_workspace(&cli.workspace)?;

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
