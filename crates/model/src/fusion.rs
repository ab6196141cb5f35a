//! Multi-branch feature fusion.
//!
//! Branch features (shape, edge, color) may come at different resolutions;
//! they are first resized to the reference branch and then merged by plain
//! concatenation, a residual fusion stack, or a guided transfer network.

use candle_core::{Error, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};
use layers::{
    checks, resample, ActivationKind, ConditionedResnetBlock, ConvBlock, ConvBlockConfig,
    NormKind, ResnetBlockConfig, UpConvBlock,
};

use crate::config::{FeatureFusionConfig, FeatureTransConfig};

/// Resizes every feature to `(height, width)` and concatenates on channels.
pub fn align_and_concat(feats: &[&Tensor], height: usize, width: usize) -> Result<Tensor> {
    if feats.is_empty() {
        return Err(Error::Msg("align_and_concat: no features".into()));
    }
    let aligned = feats
        .iter()
        .map(|feat| {
            let (_, _, h, w) = checks::expect_nchw("align_and_concat", feat)?;
            if (h, w) == (height, width) {
                Ok((*feat).clone())
            } else {
                resample::bilinear_resize(feat, height, width)
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&aligned, 1)
}

/// Residual stack refining a feature under a spatial guide.
#[derive(Debug, Clone)]
pub struct FeatureFusionNetwork {
    config: FeatureFusionConfig,
    proj: ConvBlock,
    blocks: Vec<ConditionedResnetBlock>,
}

impl FeatureFusionNetwork {
    pub fn new(config: FeatureFusionConfig, vb: VarBuilder) -> Result<Self> {
        if config.feat_nc == 0 || config.guide_nc == 0 || config.output_nc == 0 {
            return Err(Error::Msg("feature fusion channels must be greater than zero".into()));
        }
        let proj = ConvBlock::new(
            config.guide_nc + config.feat_nc,
            config.output_nc,
            ConvBlockConfig::new(1, 1, 0, config.norm),
            vb.pp("proj"),
        )?;
        let blocks = (0..config.nblocks)
            .map(|i| {
                ConditionedResnetBlock::new(
                    config.output_nc,
                    config.guide_nc,
                    false,
                    ResnetBlockConfig::new(config.norm),
                    vb.pp(format!("block{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            proj,
            blocks,
        })
    }

    pub fn output_nc(&self) -> usize {
        self.config.output_nc
    }

    /// `feat` and `guide` must share their spatial size.
    pub fn forward(&self, feat: &Tensor, guide: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("feature_fusion feat", feat, self.config.feat_nc)?;
        checks::expect_channels("feature_fusion guide", guide, self.config.guide_nc)?;
        let mut xs = self.proj.forward_t(&Tensor::cat(&[guide, feat], 1)?, train)?;
        for block in &self.blocks {
            xs = block.forward_pair(&xs, guide, train)?;
        }
        Ok(xs)
    }
}

/// Maps a feature from the frame of `input_guide` into the frame of
/// `output_guide`.
#[derive(Debug, Clone)]
pub struct FeatureTransNetwork {
    config: FeatureTransConfig,
    downs: Vec<ConvBlock>,
    blocks: Vec<ConditionedResnetBlock>,
    ups: Vec<UpConvBlock>,
    proj: ConvBlock,
}

impl FeatureTransNetwork {
    pub fn new(config: FeatureTransConfig, vb: VarBuilder) -> Result<Self> {
        if config.feat_nc == 0 || config.guide_nc == 0 {
            return Err(Error::Msg("feature transfer channels must be greater than zero".into()));
        }
        let hidden = config.hidden_nc();
        let downs = (0..config.ndowns)
            .map(|i| {
                ConvBlock::new(
                    hidden,
                    hidden,
                    ConvBlockConfig::new(3, 2, 1, config.norm),
                    vb.pp(format!("down{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let blocks = (0..config.nblocks)
            .map(|i| {
                ConditionedResnetBlock::new(
                    hidden,
                    config.guide_nc,
                    false,
                    ResnetBlockConfig::new(config.norm),
                    vb.pp(format!("block{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let ups = (0..config.ndowns)
            .map(|i| UpConvBlock::double(hidden, hidden, config.norm, vb.pp(format!("up{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let proj = ConvBlock::new(
            hidden,
            config.feat_nc,
            ConvBlockConfig::new(1, 1, 0, NormKind::None)
                .with_activation(ActivationKind::Identity)
                .with_bias(true),
            vb.pp("proj"),
        )?;
        Ok(Self {
            config,
            downs,
            blocks,
            ups,
            proj,
        })
    }

    pub fn config(&self) -> &FeatureTransConfig {
        &self.config
    }

    pub fn forward(
        &self,
        feat: &Tensor,
        input_guide: &Tensor,
        output_guide: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        checks::expect_channels("feature_trans feat", feat, self.config.feat_nc)?;
        checks::expect_channels("feature_trans input guide", input_guide, self.config.guide_nc)?;
        checks::expect_channels("feature_trans output guide", output_guide, self.config.guide_nc)?;
        let (_, _, h, w) = checks::expect_nchw("feature_trans", feat)?;
        let factor = 1usize << self.config.ndowns;
        if h % factor != 0 || w % factor != 0 {
            return Err(Error::Msg(format!(
                "feature_trans: {h}x{w} is not divisible by {factor}"
            )));
        }

        let mut xs = Tensor::cat(&[feat, input_guide], 1)?;
        for down in &self.downs {
            xs = down.forward_t(&xs, train)?;
        }
        let guide = resample::resize_like(output_guide, &xs)?;
        for block in &self.blocks {
            xs = block.forward_pair(&xs, &guide, train)?;
        }
        for up in &self.ups {
            xs = up.forward_t(&xs, train)?;
        }
        self.proj.forward_t(&xs, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn align_resizes_to_reference() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::ones((1, 2, 8, 8), DType::F32, &device)?;
        let b = Tensor::ones((1, 3, 4, 4), DType::F32, &device)?;
        let out = align_and_concat(&[&a, &b], 8, 8)?;
        assert_eq!(out.dims(), &[1, 5, 8, 8]);
        let mean = out.mean_all()?.to_vec0::<f32>()?;
        assert!((mean - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn fusion_and_trans_keep_resolution() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let fusion = FeatureFusionNetwork::new(
            FeatureFusionConfig {
                feat_nc: 6,
                guide_nc: 2,
                output_nc: 4,
                nblocks: 2,
                norm: NormKind::Instance,
            },
            vb.pp("fusion"),
        )?;
        let trans = FeatureTransNetwork::new(
            FeatureTransConfig {
                feat_nc: 6,
                guide_nc: 2,
                nblocks: 1,
                ndowns: 2,
                norm: NormKind::Instance,
            },
            vb.pp("trans"),
        )?;
        let feat = Tensor::randn(0f32, 1.0, (2, 6, 16, 16), &device)?;
        let guide = Tensor::randn(0f32, 1.0, (2, 2, 16, 16), &device)?;
        assert_eq!(fusion.forward(&feat, &guide, true)?.dims(), &[2, 4, 16, 16]);
        assert_eq!(trans.forward(&feat, &guide, &guide, true)?.dims(), &[2, 6, 16, 16]);
        let odd = Tensor::randn(0f32, 1.0, (2, 6, 10, 10), &device)?;
        let odd_guide = Tensor::randn(0f32, 1.0, (2, 2, 10, 10), &device)?;
        assert!(trans.forward(&odd, &odd_guide, &odd_guide, true).is_err());
        Ok(())
    }
}
