//! Training pipelines.
//!
//! A pipeline owns its networks, the optimizer/scheduler group of every
//! trainable subset and the losses of one model family. The trainer drives
//! it through the [`Pipeline`] trait and never looks at individual networks.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use layers::{init, InitKind};

use crate::{
    checkpoint::{CheckpointManifest, CheckpointStore, GroupState},
    config::PipelineKind,
    data::Batch,
    metrics::Errors,
    optimizer::{Adam, AdamConfig},
    scheduler::{LRScheduler, SchedulerConfig, SchedulerState},
    visualization::Visual,
    TrainingConfig, TrainingError,
};

pub mod attribute;
pub(crate) mod common;
pub mod designer;
pub mod plan;
pub mod pose_transfer;
pub mod two_stage;

pub use attribute::AttributePipeline;
pub use designer::DesignerPipeline;
pub use plan::{ExecutionPlan, GroupPlan, LossTerm};
pub use pose_transfer::PoseTransferPipeline;
pub use two_stage::TwoStagePipeline;

type Result<T> = std::result::Result<T, TrainingError>;

/// Networks sharing one optimizer and learning-rate schedule.
pub struct TrainableGroup {
    pub name: String,
    pub optimizer: Adam,
    pub scheduler: Box<dyn LRScheduler>,
}

impl TrainableGroup {
    pub fn new(plan: &GroupPlan, networks: &[(&str, &VarMap)], config: &TrainingConfig) -> Result<Self> {
        let mut params = Vec::new();
        for module in &plan.modules {
            let Some((_, varmap)) = networks.iter().find(|(name, _)| name == module) else {
                return Err(TrainingError::initialization(format!(
                    "group {} refers to unknown network {module}",
                    plan.name
                )));
            };
            params.extend(
                model::network::trainable_vars(varmap)
                    .into_iter()
                    .map(|(name, var)| (format!("{module}.{name}"), var)),
            );
        }
        let adam = AdamConfig::new(
            plan.learning_rate,
            config.optimizer.beta1,
            config.optimizer.beta2,
        );
        let scheduler =
            SchedulerConfig::from_training_config(&config.scheduler, plan.learning_rate).build()?;
        Ok(Self {
            name: plan.name.to_string(),
            optimizer: Adam::new(params, adam)?,
            scheduler,
        })
    }

    pub fn state(&self) -> Result<GroupState> {
        Ok(GroupState {
            optimizer: self.optimizer.state()?,
            scheduler: self.scheduler.state(),
        })
    }

    pub fn schedule_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn load_state(&mut self, state: GroupState) -> Result<()> {
        self.optimizer.load_state(state.optimizer)?;
        self.scheduler.load_state(&state.scheduler);
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        Ok(())
    }

    /// Advances the schedule by one epoch and applies the new rate.
    pub fn step_schedule(&mut self, metric: Option<f64>) -> f64 {
        let lr = self.scheduler.step(metric);
        self.optimizer.set_learning_rate(lr);
        lr
    }
}

pub(crate) fn build_groups(
    plan: &ExecutionPlan,
    networks: &[(&str, &VarMap)],
    config: &TrainingConfig,
) -> Result<Vec<TrainableGroup>> {
    plan.groups
        .iter()
        .map(|group| TrainableGroup::new(group, networks, config))
        .collect()
}

pub trait Pipeline {
    fn name(&self) -> &'static str;

    fn plan(&self) -> &ExecutionPlan;

    /// Every built network by module name.
    fn networks(&self) -> Vec<(&str, &VarMap)>;

    fn groups(&self) -> &[TrainableGroup];

    fn groups_mut(&mut self) -> &mut [TrainableGroup];

    /// Fresh initialization of every network.
    fn init_weights(&self, kind: InitKind) -> Result<()> {
        for (_, varmap) in self.networks() {
            init::init_varmap(varmap, kind)?;
        }
        Ok(())
    }

    /// One optimization step; returns the step's errors.
    fn train_step(&mut self, batch: &Batch) -> Result<Errors>;

    /// Inference on a test batch, with loss terms when `compute_loss`.
    fn evaluate(&mut self, batch: &Batch, compute_loss: bool) -> Result<Errors>;

    /// Resets test-set accumulators.
    fn begin_test(&mut self) {}

    /// Errors that need the whole test set.
    fn finish_test(&mut self) -> Result<Errors> {
        Ok(Errors::new())
    }

    fn visuals(&mut self, batch: &Batch) -> Result<Vec<Visual>>;

    /// Generated `(b, 3, h, w)` images, for pipelines producing images.
    fn output_images(&mut self, batch: &Batch) -> Result<Option<Tensor>>;
}

/// Builds the configured pipeline and loads or initializes its weights.
pub fn build_pipeline(
    config: &TrainingConfig,
    device: &Device,
) -> Result<(Box<dyn Pipeline>, Option<CheckpointManifest>)> {
    let plan = ExecutionPlan::resolve(config)?;
    let mut pipeline: Box<dyn Pipeline> = match config.pipeline {
        PipelineKind::PoseTransfer => Box::new(PoseTransferPipeline::new(config, plan, device)?),
        PipelineKind::TwoStage => Box::new(TwoStagePipeline::new(config, plan, device)?),
        PipelineKind::Designer => Box::new(DesignerPipeline::new(config, plan, device)?),
        PipelineKind::Attribute => Box::new(AttributePipeline::new(config, plan, device)?),
    };
    let manifest = restore(pipeline.as_mut(), config)?;
    log::info!("pipeline [{}] was created", pipeline.name());
    for (name, varmap) in pipeline.networks() {
        let params: usize = model::network::trainable_vars(varmap)
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum();
        log::info!("network {name}: {:.3} M parameters", params as f64 / 1e6);
    }
    Ok((pipeline, manifest))
}

/// Test runs and resumed runs load `which_epoch`; new runs initialize and
/// optionally copy matching networks from the `latest` weights of another run.
pub fn restore(
    pipeline: &mut dyn Pipeline,
    config: &TrainingConfig,
) -> Result<Option<CheckpointManifest>> {
    let store = CheckpointStore::for_run(config);
    let label = config.runtime.which_epoch.as_str();

    if !config.is_train || config.runtime.continue_train {
        for (name, varmap) in pipeline.networks() {
            store.load_network(label, name, varmap)?;
        }
        if config.is_train {
            for group in pipeline.groups_mut() {
                let state = store.load_group_state(label, &group.name)?;
                group.load_state(state)?;
            }
        }
        log::info!("loaded checkpoint [{label}] from {}", store.dir().display());
        return store.manifest(label);
    }

    pipeline.init_weights(config.model.init_kind()?)?;
    if let Some(source) = &config.runtime.init_from {
        let other = CheckpointStore::new(&config.runtime.checkpoints_dir, source);
        for (name, varmap) in pipeline.networks() {
            if other.has_network("latest", name) {
                other.load_network("latest", name, varmap)?;
                log::info!("initialized {name} from run {source}");
            } else {
                log::info!("run {source} has no {name}; keeping fresh weights");
            }
        }
    }
    Ok(None)
}
