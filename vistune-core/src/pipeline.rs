//! Stage orchestration: fine-tune, merge, or both with the path handoff.

use crate::config::VistuneConfig;
use crate::derive::DerivedValues;
use crate::error::VistuneError;
use crate::finetune::FinetunePlan;
use crate::launcher::{LaunchCommand, ProcessRunner};
use crate::manifest::{ManifestStore, RunManifest, Stage};
use crate::merge::MergePlan;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a completed stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub manifest_id: String,
    /// Directory the stage produced.
    pub output: PathBuf,
}

/// Runs stages against a workspace through a [`ProcessRunner`].
pub struct Pipeline {
    config: VistuneConfig,
    workspace: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    store: ManifestStore,
    preflight: bool,
}

impl Pipeline {
    pub fn new(config: VistuneConfig, workspace: PathBuf, runner: Arc<dyn ProcessRunner>) -> Self {
        let store = ManifestStore::new(&workspace);
        Self {
            config,
            workspace,
            runner,
            store,
            preflight: true,
        }
    }

    /// Skip the input existence checks before each launch.
    pub fn without_preflight(mut self) -> Self {
        self.preflight = false;
        self
    }

    pub fn config(&self) -> &VistuneConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn finetune_plan(&self) -> Result<FinetunePlan, VistuneError> {
        FinetunePlan::from_config(&self.config, &self.workspace)
    }

    pub fn merge_plan(&self) -> Result<MergePlan, VistuneError> {
        MergePlan::from_config(&self.config, &self.workspace)
    }

    pub async fn finetune(&self) -> Result<StageOutcome, VistuneError> {
        let plan = self.finetune_plan()?;
        if self.preflight {
            plan.preflight()?;
        }
        let command = plan.command(&self.config, &self.workspace)?;
        info!(
            model = %plan.model_id,
            accumulation = plan.derived.gradient_accumulation_steps,
            devices = plan.num_devices,
            "Starting fine-tune"
        );
        let manifest_id = self
            .launch(Stage::Finetune, command, Some(plan.derived))
            .await?;
        Ok(StageOutcome {
            stage: Stage::Finetune,
            manifest_id,
            output: plan.output_dir,
        })
    }

    pub async fn merge(&self) -> Result<StageOutcome, VistuneError> {
        let plan = self.merge_plan()?;
        if self.preflight {
            plan.preflight()?;
        }
        let command = plan.command(&self.config, &self.workspace)?;
        info!(
            adapter = %plan.model_path.display(),
            base = %plan.model_base,
            "Starting merge"
        );
        let manifest_id = self.launch(Stage::Merge, command, None).await?;
        Ok(StageOutcome {
            stage: Stage::Merge,
            manifest_id,
            output: plan.save_model_path,
        })
    }

    /// Fine-tune, then merge the adapter it produced.
    ///
    /// Both plans are validated before anything is launched.
    pub async fn run(&self) -> Result<Vec<StageOutcome>, VistuneError> {
        let finetune_plan = self.finetune_plan()?;
        let merge_config = self.handoff_config(&finetune_plan);
        MergePlan::from_config(&merge_config, &self.workspace)?;

        let trained = self.finetune().await?;
        let merger = Pipeline {
            config: merge_config,
            workspace: self.workspace.clone(),
            runner: Arc::clone(&self.runner),
            store: ManifestStore::new(&self.workspace),
            preflight: self.preflight,
        };
        let merged = merger.merge().await?;
        Ok(vec![trained, merged])
    }

    /// The commands [`Pipeline::run`] would launch, in order.
    pub fn planned_commands(&self) -> Result<Vec<LaunchCommand>, VistuneError> {
        let finetune_plan = self.finetune_plan()?;
        let merge_config = self.handoff_config(&finetune_plan);
        let merge_plan = MergePlan::from_config(&merge_config, &self.workspace)?;
        Ok(vec![
            finetune_plan.command(&self.config, &self.workspace)?,
            merge_plan.command(&merge_config, &self.workspace)?,
        ])
    }

    /// Config for the merge half of a run: the adapter is whatever fine-tune writes.
    fn handoff_config(&self, finetune_plan: &FinetunePlan) -> VistuneConfig {
        let mut config = self.config.clone();
        config.merge.model_path = Some(finetune_plan.output_dir.clone());
        config
    }

    async fn launch(
        &self,
        stage: Stage,
        command: LaunchCommand,
        derived: Option<DerivedValues>,
    ) -> Result<String, VistuneError> {
        let mut manifest = RunManifest::start(stage, command, derived, &self.config)?;
        self.store.save(&manifest)?;

        match self.runner.run(&manifest.command).await {
            Ok(report) => {
                manifest.succeed(report.code);
                self.store.save(&manifest)?;
                Ok(manifest.id)
            }
            Err(e) => {
                error!(stage = %stage, error = %e, "Stage failed");
                manifest.fail(&e);
                if let Err(save_err) = self.store.save(&manifest) {
                    warn!(id = %manifest.id, error = %save_err, "Could not record failed run");
                }
                Err(e)
            }
        }
    }
}
