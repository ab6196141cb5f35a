//! Dense feature encoders for the shape, edge and color branches.

use candle_core::{Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};
use layers::{checks, ActivationKind, ConvBlock, ConvBlockConfig, NormKind, PaddingKind};

use crate::config::ImageEncoderConfig;

/// `conv7 -> n_downsample x (conv3, stride 2) -> conv1` producing a
/// `(b, nof, h / 2^n, w / 2^n)` feature map.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    config: ImageEncoderConfig,
    layers: Vec<ConvBlock>,
}

impl ImageEncoder {
    pub fn new(config: ImageEncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let mut layers = Vec::with_capacity(config.n_downsample + 2);
        layers.push(ConvBlock::new(
            config.input_nc,
            config.nf,
            ConvBlockConfig::new(7, 1, 3, config.norm).with_padding_kind(PaddingKind::Reflect),
            vb.pp("stem"),
        )?);

        let mut c_in = config.nf;
        for i in 0..config.n_downsample {
            let c_out = (c_in * 2).min(config.max_nf);
            layers.push(ConvBlock::new(
                c_in,
                c_out,
                ConvBlockConfig::new(3, 2, 1, config.norm),
                vb.pp(format!("down{i}")),
            )?);
            c_in = c_out;
        }

        layers.push(ConvBlock::new(
            c_in,
            config.nof,
            ConvBlockConfig::new(1, 1, 0, NormKind::None)
                .with_activation(ActivationKind::Identity)
                .with_bias(true),
            vb.pp("proj"),
        )?);

        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &ImageEncoderConfig {
        &self.config
    }

    pub fn output_nc(&self) -> usize {
        self.config.nof
    }
}

impl ModuleT for ImageEncoder {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("image_encoder", xs, self.config.input_nc)?;
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
    fn downsamples_and_caps_width() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ImageEncoderConfig {
            input_nc: 4,
            nf: 8,
            max_nf: 16,
            nof: 5,
            n_downsample: 3,
            norm: NormKind::Instance,
        };
        let net = ImageEncoder::new(config, vb)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 4, 32, 16), &Device::Cpu)?;
        assert_eq!(net.forward_t(&xs, true)?.dims(), &[2, 5, 4, 2]);
        let widths: Vec<usize> = varmap
            .all_vars()
            .iter()
            .filter(|v| v.rank() == 4)
            .map(|v| v.dims()[0])
            .collect();
        assert!(widths.iter().all(|&w| w <= 16));
        Ok(())
    }
}
