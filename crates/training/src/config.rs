use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use layers::{InitKind, NormKind};
use model::{
    config::{Backbone, ConditionLayer, FusionKind, LandmarkFusion, SpatialPool},
    registry, AppearanceType, PoseType,
};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::data::DATASET_MODES;

/// Run identifiers of pose-transfer pipelines carry this prefix.
pub const POSE_TRANSFER_PREFIX: &str = "PoseTransfer_";

/// Name of the resolved configuration saved next to a run's checkpoints.
pub const TRAIN_OPT_FILENAME: &str = "train_opt.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub id: String,
    #[serde(default)]
    pub pipeline: PipelineKind,
    #[serde(default = "default_true")]
    pub is_train: bool,
    pub data: DataConfig,
    #[serde(default)]
    pub model: NetworkConfig,
    #[serde(default)]
    pub pose_transfer: PoseTransferConfig,
    #[serde(default)]
    pub two_stage: StageTwoConfig,
    #[serde(default)]
    pub designer: DesignerConfig,
    #[serde(default)]
    pub attribute: AttributeConfig,
    #[serde(default)]
    pub gan: GanConfig,
    #[serde(default)]
    pub loss: LossWeights,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Fields of a test run that survive reloading the training options.
#[derive(Debug, Clone)]
pub struct PreservedOptions {
    pub devices: Vec<usize>,
    pub batch_size: usize,
    pub is_train: bool,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.auto_set();
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Rebuilds the configuration of a finished run from its `train_opt.json`,
    /// keeping the caller's device list, batch size and train flag.
    pub fn from_train_opt(
        path: impl AsRef<Path>,
        preserved: PreservedOptions,
    ) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            TrainingError::Io(std::io::Error::new(
                err.kind(),
                format!("{}: {err}", path.display()),
            ))
        })?;
        let mut config: TrainingConfig = serde_json::from_str(&contents)?;
        config.runtime.devices = preserved.devices;
        config.data.batch_size = preserved.batch_size;
        config.is_train = preserved.is_train;
        config.validate()?;
        Ok(config)
    }

    /// Derived fields, computed once after parsing.
    pub fn auto_set(&mut self) {
        if self.pipeline.is_pose_transfer() && !self.id.starts_with(POSE_TRANSFER_PREFIX) {
            self.id = format!("{POSE_TRANSFER_PREFIX}{}", self.id);
        }
    }

    /// Patches `section.key=value` pairs into the configuration.
    pub fn with_overrides(self, overrides: &[(String, String)]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(self)?;
        for (path, raw) in overrides {
            set_value_at_path(&mut value, path, parse_override_value(raw))?;
        }
        let mut config: TrainingConfig = serde_json::from_value(value)?;
        config.auto_set();
        config.validate()?;
        Ok(config)
    }

    /// Directory holding this run's checkpoints and options.
    pub fn run_dir(&self) -> PathBuf {
        self.runtime.checkpoints_dir.join(&self.id)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        }

        if !DATASET_MODES.contains(&self.data.dataset_mode.as_str()) {
            errors.push(format!(
                "data.dataset_mode [{}] is not recognized (expected one of: {})",
                self.data.dataset_mode,
                DATASET_MODES.join(", ")
            ));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.image_height == 0 || self.data.image_width == 0 {
            errors.push("data.image_height and data.image_width must be greater than 0".to_string());
        }

        if let Err(err) = self.model.norm_kind() {
            errors.push(err.to_string());
        }
        if let Err(err) = self.model.init_kind() {
            errors.push(err.to_string());
        }

        if self.optimizer.lr <= 0.0 || self.optimizer.lr_d <= 0.0 || self.optimizer.lr_stage_1 <= 0.0
        {
            errors.push("optimizer learning rates must be greater than 0".to_string());
        }
        if !(0.0 <= self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in [0, 1)".to_string());
        }
        if !(0.0 <= self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in [0, 1)".to_string());
        }

        if self.scheduler.epoch_count == 0 {
            errors.push("scheduler.epoch_count must be greater than 0".to_string());
        }
        if self.scheduler.lr_policy == LrPolicy::Step && self.scheduler.lr_decay == 0 {
            errors.push("scheduler.lr_decay must be greater than 0 for the step policy".to_string());
        }

        for (name, value) in [
            ("runtime.display_freq", self.runtime.display_freq),
            ("runtime.test_epoch_freq", self.runtime.test_epoch_freq),
            ("runtime.save_epoch_freq", self.runtime.save_epoch_freq),
            ("runtime.vis_epoch_freq", self.runtime.vis_epoch_freq),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        for (name, weight) in self.loss.named() {
            if weight < 0.0 {
                errors.push(format!("loss.{name} must be >= 0"));
            }
        }
        if self.loss.needs_vgg() && self.loss.vgg_weights.is_none() {
            errors.push(
                "loss.vgg_weights is required when content, style or patch_style weights are set"
                    .to_string(),
            );
        }

        if self.gan.pool_size > 0 && self.gan.d_nf == 0 {
            errors.push("gan.d_nf must be greater than 0".to_string());
        }
        if !registry::discriminators().contains(&self.gan.which_model_d) {
            errors.push(format!(
                "gan.which_model_d [{}] is not recognized",
                self.gan.which_model_d
            ));
        }

        match self.pipeline {
            PipelineKind::PoseTransfer => self.pose_transfer.collect_errors(&mut errors),
            PipelineKind::TwoStage => {
                self.pose_transfer.collect_errors(&mut errors);
                self.two_stage.collect_errors(&mut errors);
            }
            PipelineKind::Designer => self.designer.collect_errors(&mut errors),
            PipelineKind::Attribute => self.attribute.collect_errors(&mut errors),
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.data_root, base);
        absolutize_in_place(&mut self.runtime.checkpoints_dir, base);
        if let Some(path) = self.runtime.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.loss.vgg_weights.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.attribute.backbone_weights.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    #[default]
    PoseTransfer,
    TwoStage,
    Designer,
    Attribute,
}

impl PipelineKind {
    pub fn is_pose_transfer(self) -> bool {
        matches!(self, PipelineKind::PoseTransfer | PipelineKind::TwoStage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::PoseTransfer => "pose_transfer",
            PipelineKind::TwoStage => "two_stage",
            PipelineKind::Designer => "designer",
            PipelineKind::Attribute => "attribute",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_dataset_mode")]
    pub dataset_mode: String,
    pub data_root: PathBuf,
    #[serde(default = "default_fn_split")]
    pub fn_split: PathBuf,
    #[serde(default = "default_img_dir")]
    pub img_dir: PathBuf,
    #[serde(default = "default_seg_dir")]
    pub seg_dir: PathBuf,
    #[serde(default = "default_edge_dir")]
    pub edge_dir: PathBuf,
    #[serde(default = "default_color_dir")]
    pub color_dir: PathBuf,
    #[serde(default = "default_fn_pose")]
    pub fn_pose: PathBuf,
    #[serde(default = "default_fn_label")]
    pub fn_label: PathBuf,
    #[serde(default)]
    pub fn_category: Option<PathBuf>,
    #[serde(default = "default_image_size")]
    pub image_height: usize,
    #[serde(default = "default_image_size")]
    pub image_width: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_joint_radius")]
    pub joint_radius: usize,
    /// Random scale/translation of the shape, edge and color maps (`gan_v2`).
    #[serde(default)]
    pub affine_aug: bool,
    #[serde(default)]
    pub debug: bool,
}

impl DataConfig {
    /// Resolves a dataset-relative path against `data_root`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.data_root.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_norm")]
    pub norm: String,
    #[serde(default = "default_init_type")]
    pub init_type: String,
    #[serde(default)]
    pub no_dropout: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            norm: default_norm(),
            init_type: default_init_type(),
            no_dropout: false,
        }
    }
}

impl NetworkConfig {
    pub fn norm_kind(&self) -> Result<NormKind, TrainingError> {
        NormKind::from_str(&self.norm).map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    pub fn init_kind(&self) -> Result<InitKind, TrainingError> {
        InitKind::from_str(&self.init_type)
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseTransferConfig {
    /// Generator tag, see [`model::registry::generators`].
    #[serde(default = "default_which_model_t")]
    pub which_model_t: String,
    #[serde(default = "default_nf")]
    pub t_nf: usize,
    #[serde(default = "default_t_nblocks")]
    pub t_nblocks: usize,
    #[serde(default = "default_t_ndowns")]
    pub t_ndowns: usize,
    #[serde(default = "default_pose_type")]
    pub pose_type: String,
    #[serde(default = "default_appearance_type")]
    pub appearance_type: String,
    /// Train on `(1 -> 2)` pairs; otherwise reconstruct `1` from itself.
    #[serde(default = "default_true")]
    pub supervised: bool,
}

impl Default for PoseTransferConfig {
    fn default() -> Self {
        Self {
            which_model_t: default_which_model_t(),
            t_nf: default_nf(),
            t_nblocks: default_t_nblocks(),
            t_ndowns: default_t_ndowns(),
            pose_type: default_pose_type(),
            appearance_type: default_appearance_type(),
            supervised: true,
        }
    }
}

impl PoseTransferConfig {
    pub fn pose(&self) -> Result<PoseType, TrainingError> {
        self.pose_type
            .parse::<PoseType>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    pub fn appearance(&self) -> Result<AppearanceType, TrainingError> {
        self.appearance_type
            .parse::<AppearanceType>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if !registry::generators().contains(&self.which_model_t) {
            errors.push(format!(
                "pose_transfer.which_model_t [{}] is not recognized (expected one of: {})",
                self.which_model_t,
                registry::generators().tags().join(", ")
            ));
        }
        if self.t_nf == 0 {
            errors.push("pose_transfer.t_nf must be greater than 0".to_string());
        }
        if let Err(err) = self.pose() {
            errors.push(err.to_string());
        }
        if let Err(err) = self.appearance() {
            errors.push(err.to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTwoConfig {
    /// Run id of the pretrained stage 1 pose-transfer model.
    #[serde(default)]
    pub stage_1_id: String,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_patch_indices")]
    pub patch_indices: Vec<usize>,
    #[serde(default = "default_s2e_nof")]
    pub s2e_nof: usize,
    #[serde(default = "default_s2e_nf")]
    pub s2e_nf: usize,
    #[serde(default = "default_s2e_max_nf")]
    pub s2e_max_nf: usize,
    #[serde(default = "default_which_model_s2d")]
    pub which_model_s2d: String,
    #[serde(default = "default_s2d_nf")]
    pub s2d_nf: usize,
    #[serde(default = "default_s2d_nblocks")]
    pub s2d_nblocks: usize,
    #[serde(default)]
    pub train_s1: bool,
}

impl Default for StageTwoConfig {
    fn default() -> Self {
        Self {
            stage_1_id: String::new(),
            patch_size: default_patch_size(),
            patch_indices: default_patch_indices(),
            s2e_nof: default_s2e_nof(),
            s2e_nf: default_s2e_nf(),
            s2e_max_nf: default_s2e_max_nf(),
            which_model_s2d: default_which_model_s2d(),
            s2d_nf: default_s2d_nf(),
            s2d_nblocks: default_s2d_nblocks(),
            train_s1: false,
        }
    }
}

impl StageTwoConfig {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.stage_1_id.trim().is_empty() {
            errors.push("two_stage.stage_1_id must name a trained pose-transfer run".to_string());
        }
        if !matches!(self.which_model_s2d.as_str(), "resnet" | "unet") {
            errors.push(format!(
                "two_stage.which_model_s2d [{}] is not recognized (expected one of: resnet, unet)",
                self.which_model_s2d
            ));
        }
        if self.patch_indices.is_empty() {
            errors.push("two_stage.patch_indices must not be empty".to_string());
        }
        if self.patch_size < 4 || !self.patch_size.is_power_of_two() {
            errors.push("two_stage.patch_size must be a power of two >= 4".to_string());
        }
    }
}

/// Shape representation fed to the designer's shape encoder and generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ShapeEncode {
    #[serde(rename = "lm")]
    Landmark,
    #[default]
    #[serde(rename = "seg")]
    Seg,
    #[serde(rename = "lm+seg")]
    LandmarkSeg,
    #[serde(rename = "seg+e")]
    SegEdge,
    #[serde(rename = "lm+seg+e")]
    LandmarkSegEdge,
    #[serde(rename = "e")]
    Edge,
}

impl ShapeEncode {
    /// Batch fields stacked on the channel axis, in order.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            ShapeEncode::Landmark => &["lm_map"],
            ShapeEncode::Seg => &["seg_mask"],
            ShapeEncode::LandmarkSeg => &["lm_map", "seg_mask"],
            ShapeEncode::SegEdge => &["seg_mask", "edge_map"],
            ShapeEncode::LandmarkSegEdge => &["lm_map", "seg_mask", "edge_map"],
            ShapeEncode::Edge => &["edge_map"],
        }
    }

    pub fn channels(self) -> usize {
        self.fields()
            .iter()
            .map(|field| match *field {
                "lm_map" => model::pose::N_JOINTS,
                "seg_mask" => model::pose::SEG_NC,
                _ => 1,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignerConfig {
    #[serde(default)]
    pub shape_encode: ShapeEncode,
    #[serde(default = "default_true")]
    pub use_edge: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
    #[serde(default)]
    pub edge_shape_guided: bool,
    #[serde(default)]
    pub color_shape_guided: bool,
    #[serde(default = "default_encoder_nf")]
    pub encoder_nf: usize,
    #[serde(default = "default_encoder_max_nf")]
    pub encoder_max_nf: usize,
    #[serde(default = "default_branch_nof")]
    pub shape_nof: usize,
    #[serde(default = "default_branch_nof")]
    pub edge_nof: usize,
    #[serde(default = "default_branch_nof")]
    pub color_nof: usize,
    #[serde(default = "default_branch_ndowns")]
    pub shape_ndowns: usize,
    #[serde(default = "default_branch_ndowns")]
    pub edge_ndowns: usize,
    #[serde(default = "default_branch_ndowns")]
    pub color_ndowns: usize,
    #[serde(default = "default_fusion_model")]
    pub fusion_model: String,
    #[serde(default = "default_mid_nblocks")]
    pub mid_nblocks: usize,
    #[serde(default = "default_mid_ndowns")]
    pub mid_ndowns: usize,
    /// Conditioned generator tag, see [`model::registry::conditioned_generators`].
    #[serde(default = "default_which_model_g")]
    pub which_model_g: String,
    #[serde(default = "default_nf")]
    pub g_nf: usize,
    #[serde(default = "default_g_nblocks")]
    pub g_nblocks: usize,
    #[serde(default = "default_condition_layer")]
    pub condition_layer: String,
}

impl Default for DesignerConfig {
    fn default() -> Self {
        Self {
            shape_encode: ShapeEncode::default(),
            use_edge: true,
            use_color: true,
            edge_shape_guided: false,
            color_shape_guided: false,
            encoder_nf: default_encoder_nf(),
            encoder_max_nf: default_encoder_max_nf(),
            shape_nof: default_branch_nof(),
            edge_nof: default_branch_nof(),
            color_nof: default_branch_nof(),
            shape_ndowns: default_branch_ndowns(),
            edge_ndowns: default_branch_ndowns(),
            color_ndowns: default_branch_ndowns(),
            fusion_model: default_fusion_model(),
            mid_nblocks: default_mid_nblocks(),
            mid_ndowns: default_mid_ndowns(),
            which_model_g: default_which_model_g(),
            g_nf: default_nf(),
            g_nblocks: default_g_nblocks(),
            condition_layer: default_condition_layer(),
        }
    }
}

impl DesignerConfig {
    pub fn fusion(&self) -> Result<FusionKind, TrainingError> {
        self.fusion_model
            .parse::<FusionKind>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    pub fn condition(&self) -> Result<ConditionLayer, TrainingError> {
        self.condition_layer
            .parse::<ConditionLayer>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        match self.fusion() {
            Ok(FusionKind::Fusion | FusionKind::Trans) if !(self.use_edge || self.use_color) => {
                errors.push(format!(
                    "designer.fusion_model [{}] needs the edge or color branch",
                    self.fusion_model
                ));
            }
            Ok(_) => {}
            Err(err) => errors.push(err.to_string()),
        }
        if let Err(err) = self.condition() {
            errors.push(err.to_string());
        }
        if !registry::conditioned_generators().contains(&self.which_model_g) {
            errors.push(format!(
                "designer.which_model_g [{}] is not recognized",
                self.which_model_g
            ));
        }
        if self.encoder_nf == 0 || self.encoder_max_nf < self.encoder_nf {
            errors.push("designer.encoder_nf must be > 0 and <= encoder_max_nf".to_string());
        }
        if self.shape_nof == 0 || self.edge_nof == 0 || self.color_nof == 0 {
            errors.push("designer branch widths must be greater than 0".to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeConfig {
    #[serde(default = "default_n_attr")]
    pub n_attr: usize,
    #[serde(default)]
    pub n_cat: Option<usize>,
    #[serde(default = "default_convnet")]
    pub convnet: String,
    #[serde(default = "default_spatial_pool")]
    pub spatial_pool: String,
    #[serde(default)]
    pub input_lm: bool,
    #[serde(default = "default_lm_output_nc")]
    pub lm_output_nc: usize,
    #[serde(default = "default_lm_fusion")]
    pub lm_fusion: String,
    #[serde(default)]
    pub feat_norm: bool,
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
    /// Normalize the weighted BCE per class rather than globally.
    #[serde(default = "default_true")]
    pub class_norm: bool,
    #[serde(default = "default_top_k")]
    pub top_k: Vec<usize>,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            n_attr: default_n_attr(),
            n_cat: None,
            convnet: default_convnet(),
            spatial_pool: default_spatial_pool(),
            input_lm: false,
            lm_output_nc: default_lm_output_nc(),
            lm_fusion: default_lm_fusion(),
            feat_norm: false,
            backbone_weights: None,
            class_norm: true,
            top_k: default_top_k(),
        }
    }
}

impl AttributeConfig {
    pub fn backbone(&self) -> Result<Backbone, TrainingError> {
        self.convnet
            .parse::<Backbone>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    pub fn pool(&self) -> Result<SpatialPool, TrainingError> {
        self.spatial_pool
            .parse::<SpatialPool>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    pub fn landmark_fusion(&self) -> Result<LandmarkFusion, TrainingError> {
        self.lm_fusion
            .parse::<LandmarkFusion>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.n_attr == 0 {
            errors.push("attribute.n_attr must be greater than 0".to_string());
        }
        for result in [
            self.backbone().map(|_| ()),
            self.pool().map(|_| ()),
            self.landmark_fusion().map(|_| ()),
        ] {
            if let Err(err) = result {
                errors.push(err.to_string());
            }
        }
        if self.top_k.iter().any(|&k| k == 0) {
            errors.push("attribute.top_k entries must be greater than 0".to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GanKind {
    #[default]
    Lsgan,
    Dcgan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GanConfig {
    #[serde(default)]
    pub which_gan: GanKind,
    #[serde(default = "default_which_model_d")]
    pub which_model_d: String,
    #[serde(default = "default_nf")]
    pub d_nf: usize,
    #[serde(default = "default_d_n_layers")]
    pub d_n_layers: usize,
    /// Feed the target pose (or shape) to the discriminator next to the image.
    #[serde(default)]
    pub d_cond: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for GanConfig {
    fn default() -> Self {
        Self {
            which_gan: GanKind::default(),
            which_model_d: default_which_model_d(),
            d_nf: default_nf(),
            d_n_layers: default_d_n_layers(),
            d_cond: false,
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossWeights {
    #[serde(default = "default_l1_weight")]
    pub l1: f64,
    #[serde(default)]
    pub content: f64,
    #[serde(default)]
    pub style: f64,
    #[serde(default)]
    pub patch_style: f64,
    #[serde(default)]
    pub gan: f64,
    /// Transferred-feature reconstruction (designer, `trans` fusion).
    #[serde(default)]
    pub feat: f64,
    #[serde(default = "default_attr_weight")]
    pub attr: f64,
    #[serde(default = "default_attr_weight")]
    pub category: f64,
    /// VGG19 safetensors for the perceptual losses.
    #[serde(default)]
    pub vgg_weights: Option<PathBuf>,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            l1: default_l1_weight(),
            content: 0.0,
            style: 0.0,
            patch_style: 0.0,
            gan: 0.0,
            feat: 0.0,
            attr: default_attr_weight(),
            category: default_attr_weight(),
            vgg_weights: None,
        }
    }
}

impl LossWeights {
    pub fn named(&self) -> [(&'static str, f64); 8] {
        [
            ("l1", self.l1),
            ("content", self.content),
            ("style", self.style),
            ("patch_style", self.patch_style),
            ("gan", self.gan),
            ("feat", self.feat),
            ("attr", self.attr),
            ("category", self.category),
        ]
    }

    pub fn needs_vgg(&self) -> bool {
        self.content > 0.0 || self.style > 0.0 || self.patch_style > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_lr_d")]
    pub lr_d: f64,
    #[serde(default = "default_lr_d")]
    pub lr_stage_1: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            lr_d: default_lr_d(),
            lr_stage_1: default_lr_d(),
            beta1: default_beta1(),
            beta2: default_beta2(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrPolicy {
    #[default]
    Step,
    Lambda,
    Plateau,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub lr_policy: LrPolicy,
    #[serde(default = "default_epoch_count")]
    pub epoch_count: usize,
    #[serde(default = "default_niter")]
    pub niter: usize,
    #[serde(default)]
    pub niter_decay: usize,
    #[serde(default = "default_lr_decay")]
    pub lr_decay: usize,
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lr_policy: LrPolicy::default(),
            epoch_count: default_epoch_count(),
            niter: default_niter(),
            niter_decay: 0,
            lr_decay: default_lr_decay(),
            lr_gamma: default_lr_gamma(),
        }
    }
}

impl SchedulerConfig {
    /// Last epoch of the run, inclusive.
    pub fn last_epoch(&self) -> usize {
        self.niter + self.niter_decay
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub seed: u64,
    /// Empty selects the CPU; otherwise the first id picks the GPU.
    #[serde(default)]
    pub devices: Vec<usize>,
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: PathBuf,
    #[serde(default)]
    pub continue_train: bool,
    #[serde(default = "default_which_epoch")]
    pub which_epoch: String,
    /// Run whose `latest` weights initialise matching modules.
    #[serde(default)]
    pub init_from: Option<String>,
    #[serde(default = "default_display_freq")]
    pub display_freq: usize,
    #[serde(default = "default_one")]
    pub test_epoch_freq: usize,
    #[serde(default = "default_save_epoch_freq")]
    pub save_epoch_freq: usize,
    #[serde(default = "default_one")]
    pub vis_epoch_freq: usize,
    #[serde(default = "default_max_n_vis")]
    pub max_n_vis: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            devices: Vec::new(),
            checkpoints_dir: default_checkpoints_dir(),
            continue_train: false,
            which_epoch: default_which_epoch(),
            init_from: None,
            display_freq: default_display_freq(),
            test_epoch_freq: 1,
            save_epoch_freq: default_save_epoch_freq(),
            vis_epoch_freq: 1,
            max_n_vis: default_max_n_vis(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_dataset_mode() -> String {
    "pose_transfer".to_string()
}

fn default_fn_split() -> PathBuf {
    PathBuf::from("Label/pair_split.json")
}

fn default_img_dir() -> PathBuf {
    PathBuf::from("Img/img_df")
}

fn default_seg_dir() -> PathBuf {
    PathBuf::from("Img/seg_df")
}

fn default_edge_dir() -> PathBuf {
    PathBuf::from("Img/edge_df")
}

fn default_color_dir() -> PathBuf {
    PathBuf::from("Img/color_df")
}

fn default_fn_pose() -> PathBuf {
    PathBuf::from("Label/pose_label.json")
}

fn default_fn_label() -> PathBuf {
    PathBuf::from("Label/attr_label.json")
}

fn default_image_size() -> usize {
    256
}

fn default_batch_size() -> usize {
    32
}

fn default_joint_radius() -> usize {
    10
}

fn default_norm() -> String {
    "instance".to_string()
}

fn default_init_type() -> String {
    "normal".to_string()
}

fn default_which_model_t() -> String {
    "unet".to_string()
}

fn default_nf() -> usize {
    64
}

fn default_t_nblocks() -> usize {
    9
}

fn default_t_ndowns() -> usize {
    8
}

fn default_pose_type() -> String {
    "joint".to_string()
}

fn default_appearance_type() -> String {
    "image".to_string()
}

fn default_patch_size() -> usize {
    32
}

fn default_patch_indices() -> Vec<usize> {
    // Face (0) and body joints; eyes and ears (14-17) are covered by the face patch.
    (0..14).collect()
}

fn default_s2e_nof() -> usize {
    32
}

fn default_s2e_nf() -> usize {
    32
}

fn default_s2e_max_nf() -> usize {
    128
}

fn default_which_model_s2d() -> String {
    "resnet".to_string()
}

fn default_s2d_nf() -> usize {
    32
}

fn default_s2d_nblocks() -> usize {
    6
}

fn default_encoder_nf() -> usize {
    32
}

fn default_encoder_max_nf() -> usize {
    256
}

fn default_branch_nof() -> usize {
    64
}

fn default_branch_ndowns() -> usize {
    2
}

fn default_fusion_model() -> String {
    "concat".to_string()
}

fn default_mid_nblocks() -> usize {
    2
}

fn default_mid_ndowns() -> usize {
    2
}

fn default_which_model_g() -> String {
    "resnet_6blocks".to_string()
}

fn default_g_nblocks() -> usize {
    6
}

fn default_condition_layer() -> String {
    "first".to_string()
}

fn default_n_attr() -> usize {
    1000
}

fn default_convnet() -> String {
    "stackconv".to_string()
}

fn default_spatial_pool() -> String {
    "none".to_string()
}

fn default_lm_output_nc() -> usize {
    512
}

fn default_lm_fusion() -> String {
    "concat".to_string()
}

fn default_top_k() -> Vec<usize> {
    vec![3, 5]
}

fn default_which_model_d() -> String {
    "basic".to_string()
}

fn default_d_n_layers() -> usize {
    3
}

fn default_pool_size() -> usize {
    50
}

fn default_l1_weight() -> f64 {
    1.0
}

fn default_attr_weight() -> f64 {
    1.0
}

fn default_lr() -> f64 {
    2e-4
}

fn default_lr_d() -> f64 {
    2e-5
}

fn default_beta1() -> f64 {
    0.5
}

fn default_beta2() -> f64 {
    0.999
}

fn default_epoch_count() -> usize {
    1
}

fn default_niter() -> usize {
    30
}

fn default_lr_decay() -> usize {
    10
}

fn default_lr_gamma() -> f64 {
    0.1
}

fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_which_epoch() -> String {
    "latest".to_string()
}

fn default_display_freq() -> usize {
    10
}

fn default_save_epoch_freq() -> usize {
    5
}

fn default_max_n_vis() -> usize {
    32
}

fn default_flush_every() -> usize {
    50
}

/// Interprets an override value as JSON scalar, array or object, falling back
/// to a plain string.
fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::validation(vec![format!(
            "override path '{path}' has an empty segment"
        )]));
    }

    let mut current = target;
    for (idx, segment) in segments.iter().enumerate() {
        let map = match current {
            Value::Object(map) => map,
            Value::Null => {
                *current = Value::Object(serde_json::Map::new());
                match current {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                }
            }
            _ => {
                return Err(TrainingError::validation(vec![format!(
                    "override path segment '{segment}' points into a non-object value"
                )]));
            }
        };
        if idx + 1 == segments.len() {
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<image::ImageError> for TrainingError {
    fn from(value: image::ImageError) -> Self {
        match value {
            image::ImageError::IoError(err) => TrainingError::Io(err),
            other => TrainingError::Runtime(format!("image decoding failed: {other}")),
        }
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
id = "demo"

[data]
data_root = "datasets/DF_Pose"
"#
    }

    #[test]
    fn defaults_follow_run_options() {
        let config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.optimizer.lr, 2e-4);
        assert_eq!(config.optimizer.lr_d, 2e-5);
        assert_eq!(config.optimizer.beta1, 0.5);
        assert_eq!(config.scheduler.lr_policy, LrPolicy::Step);
        assert_eq!(config.scheduler.niter, 30);
        assert_eq!(config.runtime.save_epoch_freq, 5);
        assert_eq!(config.gan.pool_size, 50);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.loss.l1, 1.0);
        assert_eq!(config.loss.gan, 0.0);
        assert!(config.is_train);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pose_transfer_ids_are_prefixed_once() {
        let mut config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        config.auto_set();
        config.auto_set();
        assert_eq!(config.id, "PoseTransfer_demo");

        config.pipeline = PipelineKind::Attribute;
        config.id = "attr".into();
        config.auto_set();
        assert_eq!(config.id, "attr");
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        config.data.batch_size = 0;
        config.model.norm = "group".into();
        config.pose_transfer.which_model_t = "vunet".into();
        config.loss.content = 1.0;
        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 4, "{messages:?}");
                assert!(messages.iter().any(|m| m.contains("vunet")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn overrides_patch_nested_fields() {
        let config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        let config = config
            .with_overrides(&[
                ("optimizer.lr".into(), "0.001".into()),
                ("pose_transfer.pose_type".into(), "joint+seg".into()),
                ("two_stage.patch_indices".into(), "[0, 4]".into()),
            ])
            .unwrap();
        assert_eq!(config.optimizer.lr, 0.001);
        assert_eq!(config.pose_transfer.pose_type, "joint+seg");
        assert_eq!(config.two_stage.patch_indices, vec![0, 4]);
        assert_eq!(config.id, "PoseTransfer_demo");
    }

    #[test]
    fn unknown_scheduler_policy_is_rejected() {
        let text = format!("{}\n[scheduler]\nlr_policy = \"cosine\"\n", minimal_toml());
        assert!(toml::from_str::<TrainingConfig>(&text).is_err());
    }
}
