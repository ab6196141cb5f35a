use std::{path::PathBuf, str::FromStr};

use candle_core::{Error, Result};
use layers::{NormKind, PaddingKind};

/// Builds the standard "unknown variant" configuration error.
pub(crate) fn unknown(kind: &str, value: &str, known: &[&str]) -> Error {
    Error::Msg(format!(
        "{kind} [{value}] is not recognized (expected one of: {})",
        known.join(", ")
    ))
}

/// Common wiring for image-to-image generators.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    /// Channels of the first conv layer.
    pub nf: usize,
    pub norm: NormKind,
    pub use_dropout: bool,
    /// Residual blocks for ResNet generators.
    pub n_blocks: usize,
    /// Downsampling steps for U-Net generators.
    pub num_downs: usize,
    pub padding: PaddingKind,
}

impl GeneratorConfig {
    pub fn new(input_nc: usize, output_nc: usize) -> Self {
        Self {
            input_nc,
            output_nc,
            nf: 64,
            norm: NormKind::Instance,
            use_dropout: false,
            n_blocks: 9,
            num_downs: 8,
            padding: PaddingKind::Reflect,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_nc == 0 || self.output_nc == 0 {
            return Err(Error::Msg(
                "generator input_nc and output_nc must be greater than zero".into(),
            ));
        }
        if self.nf == 0 {
            return Err(Error::Msg("generator nf must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Where the condition enters a conditioned ResNet generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionLayer {
    /// Only the first residual block sees the condition.
    #[default]
    First,
    /// Every residual block sees the condition.
    All,
}

impl FromStr for ConditionLayer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" => Ok(ConditionLayer::First),
            "all" => Ok(ConditionLayer::All),
            other => Err(unknown("condition layer", other, &["first", "all"])),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedGeneratorConfig {
    pub base: GeneratorConfig,
    pub condition_nc: usize,
    pub condition_layer: ConditionLayer,
}

impl ConditionedGeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.condition_nc == 0 {
            return Err(Error::Msg(
                "conditioned generator needs condition_nc > 0".into(),
            ));
        }
        if self.base.n_blocks == 0 {
            return Err(Error::Msg(
                "conditioned generator needs at least one residual block".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscriminatorConfig {
    pub input_nc: usize,
    pub nf: usize,
    pub n_layers: usize,
    pub norm: NormKind,
    /// Sigmoid output for BCE training; raw scores for least squares.
    pub use_sigmoid: bool,
}

impl DiscriminatorConfig {
    pub fn new(input_nc: usize) -> Self {
        Self {
            input_nc,
            nf: 64,
            n_layers: 3,
            norm: NormKind::Instance,
            use_sigmoid: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_nc == 0 || self.nf == 0 {
            return Err(Error::Msg(
                "discriminator input_nc and nf must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Convolutional trunk of the attribute encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backbone {
    StackConv,
    Resnet18,
    Resnet34,
}

impl FromStr for Backbone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stackconv" => Ok(Backbone::StackConv),
            "resnet18" => Ok(Backbone::Resnet18),
            "resnet34" => Ok(Backbone::Resnet34),
            other => Err(unknown(
                "convnet",
                other,
                &["stackconv", "resnet18", "resnet34"],
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialPool {
    /// Global average pooling followed by a linear classifier.
    None,
    /// Global max over a per-location probability map.
    Max,
    /// Noisy-OR over a per-location probability map.
    NoisyOr,
}

impl FromStr for SpatialPool {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(SpatialPool::None),
            "max" => Ok(SpatialPool::Max),
            "noisyor" => Ok(SpatialPool::NoisyOr),
            other => Err(unknown("spatial pool", other, &["none", "max", "noisyor"])),
        }
    }
}

/// How landmark features are merged with image features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkFusion {
    Concat,
    Linear,
}

impl FromStr for LandmarkFusion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(LandmarkFusion::Concat),
            "linear" => Ok(LandmarkFusion::Linear),
            other => Err(unknown("landmark fusion", other, &["concat", "linear"])),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkBranchConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    pub fusion: LandmarkFusion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEncoderConfig {
    pub backbone: Backbone,
    pub spatial_pool: SpatialPool,
    pub input_nc: usize,
    pub n_attr: usize,
    /// Size of the optional joint category head.
    pub n_cat: Option<usize>,
    pub feat_norm: bool,
    pub landmark: Option<LandmarkBranchConfig>,
    /// Pretrained backbone weights, only used for 3-channel ResNet inputs.
    pub backbone_weights: Option<PathBuf>,
}

impl AttributeEncoderConfig {
    pub fn new(backbone: Backbone, spatial_pool: SpatialPool, n_attr: usize) -> Self {
        Self {
            backbone,
            spatial_pool,
            input_nc: 3,
            n_attr,
            n_cat: None,
            feat_norm: false,
            landmark: None,
            backbone_weights: None,
        }
    }

    /// Whether pretrained weights replace the random backbone init.
    pub fn uses_pretrained_backbone(&self) -> bool {
        self.backbone != Backbone::StackConv
            && self.input_nc == 3
            && self.backbone_weights.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_nc == 0 || self.n_attr == 0 {
            return Err(Error::Msg(
                "attribute encoder input_nc and n_attr must be greater than zero".into(),
            ));
        }
        if let Some(lm) = &self.landmark {
            if self.spatial_pool == SpatialPool::None {
                return Err(Error::Msg(
                    "spatial pool [none] does not support a landmark guidance input".into(),
                ));
            }
            if lm.input_nc == 0 || lm.output_nc < 16 || lm.output_nc % 16 != 0 {
                return Err(Error::Msg(format!(
                    "landmark branch needs input_nc > 0 and output_nc a multiple of 16, got {} / {}",
                    lm.input_nc, lm.output_nc
                )));
            }
        }
        if self.n_cat.is_some() && (self.spatial_pool != SpatialPool::None || self.landmark.is_some())
        {
            return Err(Error::Msg(
                "the category head requires spatial pool [none] without landmark input".into(),
            ));
        }
        if self.n_cat == Some(0) {
            return Err(Error::Msg("n_cat must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Shape, edge and color branch encoders of the designer pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEncoderConfig {
    pub input_nc: usize,
    pub nf: usize,
    pub max_nf: usize,
    /// Output feature channels.
    pub nof: usize,
    pub n_downsample: usize,
    pub norm: NormKind,
}

impl ImageEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_nc == 0 || self.nf == 0 || self.nof == 0 {
            return Err(Error::Msg(
                "image encoder input_nc, nf and nof must be greater than zero".into(),
            ));
        }
        if self.max_nf < self.nf {
            return Err(Error::Msg("image encoder max_nf must be >= nf".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalEncoderConfig {
    pub n_patch: usize,
    pub input_nc: usize,
    pub nof: usize,
    pub nf: usize,
    pub max_nf: usize,
    pub patch_size: usize,
    pub norm: NormKind,
}

impl LocalEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_patch == 0 {
            return Err(Error::Msg("local encoder needs at least one patch".into()));
        }
        if self.patch_size < 4 || !self.patch_size.is_power_of_two() {
            return Err(Error::Msg(format!(
                "patch_size must be a power of two >= 4, got {}",
                self.patch_size
            )));
        }
        if self.nf == 0 || self.nof == 0 || self.max_nf < self.nf {
            return Err(Error::Msg(
                "local encoder needs nf > 0, nof > 0 and max_nf >= nf".into(),
            ));
        }
        Ok(())
    }
}

/// Strategy used to merge shape, edge and color features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionKind {
    #[default]
    Concat,
    Fusion,
    Trans,
}

impl FromStr for FusionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(FusionKind::Concat),
            "fusion" => Ok(FusionKind::Fusion),
            "trans" => Ok(FusionKind::Trans),
            other => Err(unknown("fusion model", other, &["concat", "fusion", "trans"])),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFusionConfig {
    pub feat_nc: usize,
    pub guide_nc: usize,
    pub output_nc: usize,
    pub nblocks: usize,
    pub norm: NormKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTransConfig {
    pub feat_nc: usize,
    pub guide_nc: usize,
    pub nblocks: usize,
    pub ndowns: usize,
    pub norm: NormKind,
}

impl FeatureTransConfig {
    /// Width of the transfer bottleneck.
    pub fn hidden_nc(&self) -> usize {
        self.feat_nc + self.guide_nc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmark_guidance_requires_spatial_pool() {
        let mut config = AttributeEncoderConfig::new(Backbone::StackConv, SpatialPool::None, 10);
        config.landmark = Some(LandmarkBranchConfig {
            input_nc: 18,
            output_nc: 512,
            fusion: LandmarkFusion::Concat,
        });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("landmark"), "{err}");

        config.spatial_pool = SpatialPool::NoisyOr;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn category_head_requires_global_pooling() {
        let mut config = AttributeEncoderConfig::new(Backbone::StackConv, SpatialPool::Max, 10);
        config.n_cat = Some(5);
        assert!(config.validate().is_err());
        config.spatial_pool = SpatialPool::None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_tags() {
        assert_eq!("noisyor".parse::<SpatialPool>().unwrap(), SpatialPool::NoisyOr);
        assert_eq!("trans".parse::<FusionKind>().unwrap(), FusionKind::Trans);
        assert!("cancat".parse::<FusionKind>().is_err());
        assert!("vgg".parse::<Backbone>().is_err());
    }
}
