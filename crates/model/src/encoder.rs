//! Attribute encoder: image (and optional landmark heatmap) to per-attribute
//! probabilities.

use candle_core::{Error, Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Linear, Module, ModuleT, VarBuilder, VarMap};
use layers::{checks, init, pooling, ConvBlock, ConvBlockConfig, InitKind, NormKind};

use crate::{
    backbone::{self, BackboneNet},
    config::{AttributeEncoderConfig, LandmarkBranchConfig, LandmarkFusion, SpatialPool},
};

/// Initial classifier bias under noisy-OR pooling: `sigmoid(-6.58) ~ 1.4e-3`
/// per location keeps the pooled probability low at the start of training.
pub const NOISY_OR_BIAS: f64 = -6.58;

#[derive(Debug, Clone)]
pub struct AttributeOutput {
    /// `(b, n_attr)` probabilities.
    pub prob: Tensor,
    /// `(b, n_attr, h, w)` per-location probabilities for spatial pooling.
    pub prob_map: Option<Tensor>,
    /// `(b, n_cat)` category logits.
    pub category: Option<Tensor>,
}

#[derive(Debug, Clone)]
struct LandmarkBranch {
    layers: Vec<ConvBlock>,
    fuse: Option<ConvBlock>,
}

impl LandmarkBranch {
    fn new(config: &LandmarkBranchConfig, image_nc: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(5);
        let (mut c_in, mut c_out) = (config.input_nc, config.output_nc / 16);
        for n in 0..5 {
            layers.push(ConvBlock::new(
                c_in,
                c_out,
                ConvBlockConfig::new(4, 2, 1, NormKind::Batch),
                vb.pp(format!("conv_lm.layer{n}")),
            )?);
            c_in = c_out;
            c_out *= 2;
        }
        let fuse = match config.fusion {
            LandmarkFusion::Concat => None,
            LandmarkFusion::Linear => Some(ConvBlock::new(
                image_nc + config.output_nc,
                image_nc,
                ConvBlockConfig::new(1, 1, 0, NormKind::Batch).with_bias(true),
                vb.pp("fuse"),
            )?),
        };
        Ok(Self { layers, fuse })
    }

    fn feature_nc(config: &LandmarkBranchConfig, image_nc: usize) -> usize {
        match config.fusion {
            LandmarkFusion::Concat => image_nc + config.output_nc,
            LandmarkFusion::Linear => image_nc,
        }
    }

    fn fuse(&self, img_feat: &Tensor, lm: &Tensor, train: bool) -> Result<Tensor> {
        let mut lm_feat = lm.clone();
        for layer in &self.layers {
            lm_feat = layer.forward_t(&lm_feat, train)?;
        }
        let feat = Tensor::cat(&[img_feat, &lm_feat], 1)?;
        match &self.fuse {
            Some(fuse) => fuse.forward_t(&feat, train),
            None => Ok(feat),
        }
    }
}

#[derive(Debug, Clone)]
enum Head {
    /// Global average pool, linear classifier, optional category logits.
    Global { fc: Linear, fc_cat: Option<Linear> },
    /// 1x1 classifier producing a probability map that is pooled spatially.
    Spatial { cls: Conv2d, pool: SpatialPool },
}

#[derive(Debug, Clone)]
pub struct AttributeEncoder {
    config: AttributeEncoderConfig,
    conv: BackboneNet,
    landmark: Option<LandmarkBranch>,
    head: Head,
}

impl AttributeEncoder {
    /// Builds the encoder; unsupported pooling/guidance combinations are
    /// rejected before any variable is created.
    pub fn new(config: AttributeEncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let conv = BackboneNet::new(config.backbone, config.input_nc, vb.pp("conv"))?;
        let image_nc = conv.output_nc();

        let (landmark, feat_nc) = match &config.landmark {
            Some(lm) => (
                Some(LandmarkBranch::new(lm, image_nc, vb.clone())?),
                LandmarkBranch::feature_nc(lm, image_nc),
            ),
            None => (None, image_nc),
        };

        let head = match config.spatial_pool {
            SpatialPool::None => Head::Global {
                fc: linear(feat_nc, config.n_attr, vb.pp("fc"))?,
                fc_cat: config
                    .n_cat
                    .map(|n| linear(feat_nc, n, vb.pp("fc_cat")))
                    .transpose()?,
            },
            pool => Head::Spatial {
                cls: conv2d(feat_nc, config.n_attr, 1, Default::default(), vb.pp("cls"))?,
                pool,
            },
        };

        Ok(Self {
            config,
            conv,
            landmark,
            head,
        })
    }

    pub fn config(&self) -> &AttributeEncoderConfig {
        &self.config
    }

    pub fn feature_nc(&self) -> usize {
        match &self.config.landmark {
            Some(lm) => LandmarkBranch::feature_nc(lm, self.conv.output_nc()),
            None => self.conv.output_nc(),
        }
    }

    /// Initializes the variables of this encoder held in `varmap`.
    ///
    /// A pretrained backbone keeps its weights and only the heads are drawn
    /// from `kind`; noisy-OR pooling then resets the classifier bias.
    pub fn init_weights(&self, varmap: &VarMap, kind: InitKind) -> Result<()> {
        match (&self.config.backbone_weights, self.config.uses_pretrained_backbone()) {
            (Some(path), true) => {
                init::init_vars(varmap, kind, |name| !name.starts_with("conv."))?;
                let copied = backbone::load_pretrained(varmap, path, "conv")?;
                if copied == 0 {
                    return Err(Error::Msg(format!(
                        "no backbone tensors found in {}",
                        path.display()
                    )));
                }
                log::info!("loaded {copied} pretrained backbone tensors from {}", path.display());
            }
            _ => init::init_varmap(varmap, kind)?,
        }
        if self.config.spatial_pool == SpatialPool::NoisyOr {
            init::fill_var(varmap, "cls.bias", NOISY_OR_BIAS)?;
        }
        Ok(())
    }

    fn feature_map(&self, img: &Tensor, lm: Option<&Tensor>, train: bool) -> Result<Tensor> {
        checks::expect_channels("attribute_encoder", img, self.config.input_nc)?;
        let feat = self.conv.forward_t(img, train)?;
        let feat = match (&self.landmark, lm) {
            (Some(branch), Some(lm)) => {
                if let Some(cfg) = &self.config.landmark {
                    checks::expect_channels("attribute_encoder landmark", lm, cfg.input_nc)?;
                }
                branch.fuse(&feat, lm, train)?
            }
            (None, None) => feat,
            (Some(_), None) => {
                return Err(Error::Msg(
                    "attribute encoder expects a landmark heatmap input".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Msg(
                    "attribute encoder was built without a landmark branch".into(),
                ))
            }
        };
        if self.config.feat_norm {
            pooling::l2_normalize_channels(&feat)
        } else {
            Ok(feat)
        }
    }

    pub fn forward(&self, img: &Tensor, lm: Option<&Tensor>, train: bool) -> Result<AttributeOutput> {
        let feat_map = self.feature_map(img, lm, train)?;
        match &self.head {
            Head::Global { fc, fc_cat } => {
                let feat = pooling::global_avg_pool(&feat_map)?;
                let prob = candle_nn::ops::sigmoid(&fc.forward(&feat)?)?;
                let category = fc_cat.as_ref().map(|fc| fc.forward(&feat)).transpose()?;
                Ok(AttributeOutput {
                    prob,
                    prob_map: None,
                    category,
                })
            }
            Head::Spatial { cls, pool } => {
                let prob_map = candle_nn::ops::sigmoid(&cls.forward(&feat_map)?)?;
                let prob = match pool {
                    SpatialPool::NoisyOr => pooling::noisy_or(&prob_map)?,
                    _ => pooling::global_max_pool(&prob_map)?,
                };
                Ok(AttributeOutput {
                    prob,
                    prob_map: Some(prob_map),
                    category: None,
                })
            }
        }
    }

    /// Pooled `(b, c)` feature and the `(b, c, h, w)` feature map.
    pub fn extract_feat(&self, img: &Tensor, lm: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let feat_map = self.feature_map(img, lm, false)?;
        Ok((pooling::global_avg_pool(&feat_map)?, feat_map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backbone;
    use candle_core::{DType, Device};

    fn build(config: AttributeEncoderConfig) -> Result<(VarMap, AttributeEncoder)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = AttributeEncoder::new(config, vb)?;
        Ok((varmap, net))
    }

    #[test]
    fn noisy_or_head_starts_near_zero() -> Result<()> {
        let config = AttributeEncoderConfig::new(Backbone::StackConv, SpatialPool::NoisyOr, 5);
        let (varmap, net) = build(config)?;
        net.init_weights(&varmap, InitKind::Normal)?;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &Device::Cpu)?;
        let out = net.forward(&img, None, false)?;
        assert_eq!(out.prob.dims(), &[2, 5]);
        assert_eq!(out.prob_map.as_ref().map(|t| t.dims().to_vec()), Some(vec![2, 5, 2, 2]));
        assert!(out.prob.max_all()?.to_vec0::<f32>()? < 0.1);
        Ok(())
    }

    #[test]
    fn category_head_and_features() -> Result<()> {
        let mut config = AttributeEncoderConfig::new(Backbone::StackConv, SpatialPool::None, 4);
        config.n_cat = Some(3);
        config.feat_norm = true;
        let (_varmap, net) = build(config)?;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?;
        let out = net.forward(&img, None, true)?;
        assert_eq!(out.category.map(|t| t.dims().to_vec()), Some(vec![2, 3]));
        let (feat, feat_map) = net.extract_feat(&img, None)?;
        assert_eq!(feat.dims(), &[2, 1024]);
        assert_eq!(feat_map.dims(), &[2, 1024, 1, 1]);
        Ok(())
    }

    #[test]
    fn landmark_branch_linear_fusion() -> Result<()> {
        let mut config = AttributeEncoderConfig::new(Backbone::StackConv, SpatialPool::Max, 2);
        config.landmark = Some(LandmarkBranchConfig {
            input_nc: 18,
            output_nc: 32,
            fusion: LandmarkFusion::Linear,
        });
        let (_varmap, net) = build(config)?;
        assert_eq!(net.feature_nc(), 1024);
        let img = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &Device::Cpu)?;
        let lm = Tensor::zeros((1, 18, 32, 32), DType::F32, &Device::Cpu)?;
        assert_eq!(net.forward(&img, Some(&lm), false)?.prob.dims(), &[1, 2]);
        assert!(net.forward(&img, None, false).is_err());
        Ok(())
    }

    #[test]
    fn landmark_with_global_pool_is_rejected() {
        let mut config = AttributeEncoderConfig::new(Backbone::StackConv, SpatialPool::None, 2);
        config.landmark = Some(LandmarkBranchConfig {
            input_nc: 18,
            output_nc: 32,
            fusion: LandmarkFusion::Concat,
        });
        assert!(build(config).is_err());
    }
}
