//! PatchGAN discriminators.
//!
//! [`NLayerDiscriminator`] scores overlapping patches with a stack of strided
//! 4x4 convolutions; [`PixelDiscriminator`] scores every pixel with 1x1
//! convolutions. Both end in a single-channel score map, optionally squashed
//! by a sigmoid for BCE training.

use candle_core::{Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};
use layers::{checks, ActivationKind, ConvBlock, ConvBlockConfig, NormKind};

use crate::config::DiscriminatorConfig;

fn score_activation(use_sigmoid: bool) -> ActivationKind {
    if use_sigmoid {
        ActivationKind::Sigmoid
    } else {
        ActivationKind::Identity
    }
}

#[derive(Debug, Clone)]
pub struct NLayerDiscriminator {
    config: DiscriminatorConfig,
    layers: Vec<ConvBlock>,
}

impl NLayerDiscriminator {
    pub fn new(config: DiscriminatorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let nf = config.nf;
        let norm = config.norm;
        let leaky = ActivationKind::leaky();
        let mut layers = Vec::with_capacity(config.n_layers + 2);

        layers.push(ConvBlock::new(
            config.input_nc,
            nf,
            ConvBlockConfig::new(4, 2, 1, NormKind::None)
                .with_activation(leaky)
                .with_bias(true),
            vb.pp("layer0"),
        )?);

        let mut mult = 1;
        for n in 1..config.n_layers {
            let prev = mult;
            mult = (1 << n).min(8);
            layers.push(ConvBlock::new(
                nf * prev,
                nf * mult,
                ConvBlockConfig::new(4, 2, 1, norm).with_activation(leaky),
                vb.pp(format!("layer{n}")),
            )?);
        }

        let prev = mult;
        mult = (1 << config.n_layers).min(8);
        layers.push(ConvBlock::new(
            nf * prev,
            nf * mult,
            ConvBlockConfig::new(4, 1, 1, norm).with_activation(leaky),
            vb.pp(format!("layer{}", config.n_layers)),
        )?);

        layers.push(ConvBlock::new(
            nf * mult,
            1,
            ConvBlockConfig::new(4, 1, 1, NormKind::None)
                .with_activation(score_activation(config.use_sigmoid))
                .with_bias(true),
            vb.pp("score"),
        )?);

        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}

impl ModuleT for NLayerDiscriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("n_layer_discriminator", xs, self.config.input_nc)?;
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
pub struct PixelDiscriminator {
    config: DiscriminatorConfig,
    layers: [ConvBlock; 3],
}

impl PixelDiscriminator {
    pub fn new(config: DiscriminatorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let nf = config.nf;
        let leaky = ActivationKind::leaky();
        let layers = [
            ConvBlock::new(
                config.input_nc,
                nf,
                ConvBlockConfig::new(1, 1, 0, NormKind::None)
                    .with_activation(leaky)
                    .with_bias(true),
                vb.pp("layer0"),
            )?,
            ConvBlock::new(
                nf,
                nf * 2,
                ConvBlockConfig::new(1, 1, 0, config.norm).with_activation(leaky),
                vb.pp("layer1"),
            )?,
            ConvBlock::new(
                nf * 2,
                1,
                ConvBlockConfig::new(1, 1, 0, NormKind::None)
                    .with_activation(score_activation(config.use_sigmoid))
                    .with_bias(config.norm.use_bias()),
                vb.pp("score"),
            )?,
        ];
        Ok(Self { config, layers })
    }
}

impl ModuleT for PixelDiscriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("pixel_discriminator", xs, self.config.input_nc)?;
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn patch_scores_for_70px_receptive_field() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = DiscriminatorConfig::new(6);
        config.nf = 8;
        config.use_sigmoid = true;
        let net = NLayerDiscriminator::new(config, vb)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 6, 64, 64), &Device::Cpu)?;
        let out = net.forward_t(&xs, true)?;
        assert_eq!(out.dims(), &[2, 1, 6, 6]);
        let min = out.min_all()?.to_vec0::<f32>()?;
        let max = out.max_all()?.to_vec0::<f32>()?;
        assert!(min >= 0.0 && max <= 1.0);
        Ok(())
    }

    #[test]
    fn pixel_scores_every_location() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = DiscriminatorConfig::new(3);
        config.nf = 4;
        config.norm = NormKind::Batch;
        let net = PixelDiscriminator::new(config, vb)?;
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 10, 7), &Device::Cpu)?;
        assert_eq!(net.forward_t(&xs, true)?.dims(), &[1, 1, 10, 7]);
        Ok(())
    }
}
