//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::DatasetAction;
use crate::FinetuneOverrides;
use crate::MergeOverrides;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use vistune_core::dataset::{compress, expand, images, load_entries, split, subset, tags};
use vistune_core::manifest::ManifestStore;
use vistune_core::pipeline::StageOutcome;
use vistune_core::{LaunchCommand, Pipeline, TokioRunner, VistuneConfig};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Finetune { dry_run, overrides } => {
            let mut config = load(workspace, config_path)?;
            overrides.apply(&mut config);
            let pipeline = pipeline(config, workspace);
            if dry_run {
                let plan = pipeline.finetune_plan()?;
                print_command(&plan.command(pipeline.config(), workspace)?);
                return Ok(());
            }
            report(&[pipeline.finetune().await?]);
            Ok(())
        }
        Commands::Merge { dry_run, overrides } => {
            let mut config = load(workspace, config_path)?;
            overrides.apply(&mut config);
            let pipeline = pipeline(config, workspace);
            if dry_run {
                let plan = pipeline.merge_plan()?;
                print_command(&plan.command(pipeline.config(), workspace)?);
                return Ok(());
            }
            report(&[pipeline.merge().await?]);
            Ok(())
        }
        Commands::Run {
            dry_run,
            finetune,
            merge,
        } => handle_run(dry_run, finetune, merge, workspace, config_path).await,
        Commands::Plan => handle_plan(workspace, config_path),
        Commands::Config { action } => handle_config(action, workspace, config_path),
        Commands::Runs { limit } => handle_runs(limit, workspace),
        Commands::Doctor => handle_doctor(workspace, config_path).await,
        Commands::Dataset { action } => handle_dataset(action, workspace, config_path).await,
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<VistuneConfig> {
    if config_path.is_none() && !vistune_core::config::config_exists(Some(workspace)) {
        tracing::debug!("No configuration file found; using defaults and environment");
    }
    vistune_core::load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn pipeline(config: VistuneConfig, workspace: &Path) -> Pipeline {
    let timeout = config.launcher.timeout_secs.map(Duration::from_secs);
    Pipeline::new(
        config,
        workspace.to_path_buf(),
        Arc::new(TokioRunner::with_timeout(timeout)),
    )
}

fn print_command(command: &LaunchCommand) {
    if let Some(dir) = &command.current_dir {
        println!("# in {}", dir.display());
    }
    println!("{}", command.shell_line());
}

fn report(outcomes: &[StageOutcome]) {
    for outcome in outcomes {
        println!(
            "{} finished: {} (run {})",
            outcome.stage,
            outcome.output.display(),
            outcome.manifest_id
        );
    }
}

async fn handle_run(
    dry_run: bool,
    finetune: FinetuneOverrides,
    merge: MergeOverrides,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let mut config = load(workspace, config_path)?;
    finetune.apply(&mut config);
    merge.apply(&mut config);
    if merge.model_path.is_some() {
        tracing::warn!("--model-path is ignored by run; the fine-tune output is merged");
    }
    let pipeline = pipeline(config, workspace);
    if dry_run {
        for command in pipeline.planned_commands()? {
            print_command(&command);
        }
        return Ok(());
    }
    report(&pipeline.run().await?);
    Ok(())
}

fn handle_plan(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let pipeline = pipeline(load(workspace, config_path)?, workspace);
    let plan = pipeline.finetune_plan()?;
    let batch = &pipeline.config().finetune.batch;

    println!("Model:                 {}", plan.model_id);
    println!(
        "Batch:                 {} global = {} per device x {} devices x {} accumulation steps",
        batch.global_batch_size,
        batch.batch_per_device,
        batch.num_devices,
        plan.derived.gradient_accumulation_steps
    );
    println!(
        "Pixels:                {} min, {} max",
        plan.derived.pixels.min_pixels, plan.derived.pixels.max_pixels
    );
    println!("Adapter output:        {}", plan.output_dir.display());
    println!();
    for command in pipeline.planned_commands()? {
        print_command(&command);
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = vistune_core::config::workspace_config_path(workspace);
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let path = vistune_core::config::write_default_config(workspace)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", vistune_core::config::to_toml(&config)?);
            Ok(())
        }
    }
}

fn handle_runs(limit: usize, workspace: &Path) -> anyhow::Result<()> {
    let store = ManifestStore::new(workspace);
    let runs = store.list()?;
    if runs.is_empty() {
        println!("No runs recorded in {}", store.dir().display());
        return Ok(());
    }
    println!(
        "{:<36}  {:<8}  {:<9}  {:>4}  STARTED",
        "ID", "STAGE", "STATUS", "EXIT"
    );
    for run in runs.iter().take(limit) {
        let exit = run
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<36}  {:<8}  {:<9}  {:>4}  {}",
            run.id,
            run.stage.to_string(),
            format!("{:?}", run.status).to_lowercase(),
            exit,
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(err) = &run.error {
            println!("    {err}");
        }
    }
    Ok(())
}

async fn handle_doctor(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(workspace, config_path)?;
    let report = vistune_core::doctor::diagnose(&config.launcher).await;

    match &report.python {
        Some(py) => {
            println!(
                "Python:   {} ({}){}",
                py.version,
                py.path.display(),
                if py.has_pip { "" } else { ", no pip" }
            );
            if let Some(venv) = &py.venv_path {
                println!("Venv:     {}", venv.display());
            }
        }
        None => println!("Python:   not found"),
    }
    for (package, ok) in &report.packages {
        println!(
            "  {:<14} {}",
            package,
            if *ok { "ok" } else { "missing" }
        );
    }
    match &report.launcher_on_path {
        Some(path) => println!("Launcher: {} ({})", report.launcher, path.display()),
        None => println!("Launcher: {} not found on PATH", report.launcher),
    }
    if let Some(err) = &report.gpu_error {
        println!("GPUs:     {err}");
    } else if report.gpus.is_empty() {
        println!("GPUs:     none visible");
    } else {
        println!("GPUs:");
        for gpu in &report.gpus {
            println!("  [{}] {} ({} MiB)", gpu.index, gpu.name, gpu.memory_mib);
        }
    }
    for (key, value) in &report.cuda_env {
        println!("  {key}={value}");
    }

    let wanted = config.finetune.batch.num_devices as usize;
    if !report.gpus.is_empty() && report.gpus.len() < wanted {
        println!(
            "Warning: num_devices is {wanted} but only {} GPU(s) are visible",
            report.gpus.len()
        );
    }
    println!();
    if report.is_ready() {
        println!("Ready to launch.");
    } else {
        println!("Some requirements are missing; launches will likely fail.");
    }
    Ok(())
}

async fn handle_dataset(
    action: DatasetAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load(workspace, config_path)?;
    let defaults = &config.dataset;

    match action {
        DatasetAction::Split {
            input,
            output_dir,
            train,
            val,
            test,
            seed,
        } => {
            let ratios = split::SplitRatios::new(
                train.unwrap_or(defaults.train_pct),
                val.unwrap_or(defaults.val_pct),
                test.unwrap_or(defaults.test_pct),
            )?;
            let report = split::split_file(
                &input,
                output_dir.as_deref(),
                ratios,
                seed.unwrap_or(defaults.seed),
            )?;
            println!(
                "{} of {} entries curated: {} train, {} val, {} test",
                report.curated, report.total, report.train, report.val, report.test
            );
            for file in &report.files {
                println!("  wrote {}", file.display());
            }
        }
        DatasetAction::FixTags {
            input,
            output,
            backup,
        } => {
            let report = tags::fix_tags_file(&input, output.as_deref(), backup)?;
            if let Some(backup) = &report.backup {
                println!("Backup: {}", backup.display());
            }
            for fix in &report.fixes {
                println!("  {}: {} -> {} tags", fix.id, fix.before, fix.after);
            }
            println!(
                "Fixed {} turn(s), wrote {}",
                report.fixes.len(),
                report.output.display()
            );
        }
        DatasetAction::ExpandJson {
            input,
            output,
            force,
        } => {
            let changed = expand::expand_file(&input, &output, force)?;
            println!("Expanded {changed} value(s), wrote {}", output.display());
        }
        DatasetAction::ValidateImages {
            input,
            image_folder,
            copy_from,
            copy_to,
        } => {
            let folder =
                image_folder.unwrap_or_else(|| workspace.join(&config.finetune.image_folder));
            let entries = load_entries(&input)?;
            let audit = images::audit_images(&entries, &folder)?;
            println!(
                "{} entries reference {} unique image(s); {} missing from {}",
                audit.entries,
                audit.referenced,
                audit.missing.len(),
                folder.display()
            );
            for name in &audit.missing {
                println!("  missing: {name}");
            }
            if let (Some(source), Some(dest)) = (copy_from, copy_to) {
                if !audit.missing.is_empty() {
                    let recovery = images::recover_missing(&audit.missing, &source, &dest)?;
                    println!(
                        "Recovered {}, {} not in source, {} failed",
                        recovery.copied.len(),
                        recovery.not_in_source.len(),
                        recovery.failed.len()
                    );
                    for (name, err) in &recovery.failed {
                        println!("  failed: {name}: {err}");
                    }
                }
            }
        }
        DatasetAction::CopyImages {
            input,
            from,
            to,
            all_sides,
        } => {
            let entries = load_entries(&input)?;
            let report = images::copy_entry_images(&entries, &from, &to, all_sides)?;
            println!("Copied {} image(s) to {}", report.copied, to.display());
            for path in &report.not_found {
                println!("  not found: {}", path.display());
            }
        }
        DatasetAction::Extract {
            reference,
            source,
            output,
        } => {
            let report = subset::extract_file(&reference, &source, &output)?;
            println!(
                "Matched {} of {} reference id(s) among {} source entries, wrote {}",
                report.matched,
                report.reference_ids,
                report.source_entries,
                output.display()
            );
            for id in &report.missing_ids {
                println!("  not in source: {id}");
            }
        }
        DatasetAction::Compress {
            dir,
            max_bytes,
            jobs,
        } => {
            let jobs = jobs.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            });
            let report =
                compress::compress_dir(&dir, max_bytes.unwrap_or(defaults.max_image_bytes), jobs)
                    .await?;
            println!(
                "{} already within limit, {} re-encoded, {} failed",
                report.within_limit,
                report.reencoded.len(),
                report.failed.len()
            );
            for (path, quality) in &report.reencoded {
                println!("  {} (quality {quality})", path.display());
            }
            for (path, err) in &report.failed {
                println!("  failed: {}: {err}", path.display());
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} image(s) could not be compressed", report.failed.len());
            }
        }
    }
    Ok(())
}
