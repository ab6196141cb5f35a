//! Convolution blocks: `pad -> conv -> norm -> activation -> dropout`.
//!
//! Both blocks implement [`ModuleT`] so the `train` flag reaches batch norm and
//! dropout. Parameters live under `<prefix>.conv.*` and `<prefix>.norm.*`.

use candle_core::{Result, Tensor};
use candle_nn::{
    conv2d, conv2d_no_bias, conv_transpose2d, conv_transpose2d_no_bias, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, Dropout, Module, ModuleT, VarBuilder,
};

use crate::{ActivationKind, Norm2d, NormKind, PaddingKind};

/// Shape and post-processing of a single convolution block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvBlockConfig {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    /// How `padding` is realised; zero padding is folded into the conv.
    pub padding_kind: PaddingKind,
    pub norm: NormKind,
    pub activation: ActivationKind,
    pub bias: bool,
    pub dropout: Option<f32>,
}

impl ConvBlockConfig {
    /// A zero-padded conv whose bias follows the norm kind.
    pub fn new(kernel: usize, stride: usize, padding: usize, norm: NormKind) -> Self {
        Self {
            kernel,
            stride,
            padding,
            padding_kind: PaddingKind::Zero,
            norm,
            activation: ActivationKind::Relu,
            bias: norm.use_bias(),
            dropout: None,
        }
    }

    pub fn with_padding_kind(mut self, kind: PaddingKind) -> Self {
        self.padding_kind = kind;
        self
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_dropout(mut self, dropout: Option<f32>) -> Self {
        self.dropout = dropout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConvBlock {
    config: ConvBlockConfig,
    conv: Conv2d,
    norm: Norm2d,
    dropout: Option<Dropout>,
}

impl ConvBlock {
    pub fn new(in_c: usize, out_c: usize, config: ConvBlockConfig, vb: VarBuilder) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: config.padding_kind.conv_padding(config.padding),
            stride: config.stride,
            ..Default::default()
        };
        let conv = if config.bias {
            conv2d(in_c, out_c, config.kernel, conv_config, vb.pp("conv"))?
        } else {
            conv2d_no_bias(in_c, out_c, config.kernel, conv_config, vb.pp("conv"))?
        };
        let norm = Norm2d::new(config.norm, out_c, vb.pp("norm"))?;
        Ok(Self {
            config,
            conv,
            norm,
            dropout: config.dropout.map(Dropout::new),
        })
    }

    pub fn config(&self) -> &ConvBlockConfig {
        &self.config
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.config.padding_kind.pre_pad(xs, self.config.padding)?;
        let xs = self.conv.forward(&xs)?;
        let xs = self.norm.forward_t(&xs, train)?;
        let xs = self.config.activation.forward(&xs)?;
        match &self.dropout {
            Some(dropout) => dropout.forward(&xs, train),
            None => Ok(xs),
        }
    }
}

/// Transposed convolution block used by decoders.
#[derive(Debug, Clone)]
pub struct UpConvBlock {
    conv: ConvTranspose2d,
    norm: Norm2d,
    activation: ActivationKind,
    dropout: Option<Dropout>,
}

impl UpConvBlock {
    /// `kernel`/`stride`/`padding`/`output_padding` follow
    /// `out = (in - 1) * stride - 2 * padding + kernel + output_padding`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        output_padding: usize,
        norm: NormKind,
        activation: ActivationKind,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = ConvTranspose2dConfig {
            padding,
            output_padding,
            stride,
            dilation: 1,
        };
        let conv = if bias {
            conv_transpose2d(in_c, out_c, kernel, config, vb.pp("conv"))?
        } else {
            conv_transpose2d_no_bias(in_c, out_c, kernel, config, vb.pp("conv"))?
        };
        Ok(Self {
            conv,
            norm: Norm2d::new(norm, out_c, vb.pp("norm"))?,
            activation,
            dropout: None,
        })
    }

    /// Stride-2 upsampling that exactly doubles the spatial size
    /// (`kernel 3, padding 1, output_padding 1`).
    pub fn double(in_c: usize, out_c: usize, norm: NormKind, vb: VarBuilder) -> Result<Self> {
        Self::new(
            in_c,
            out_c,
            3,
            2,
            1,
            1,
            norm,
            ActivationKind::Relu,
            norm.use_bias(),
            vb,
        )
    }

    pub fn with_dropout(mut self, dropout: Option<f32>) -> Self {
        self.dropout = dropout.map(Dropout::new);
        self
    }
}

impl ModuleT for UpConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, train)?;
        let xs = self.activation.forward(&xs)?;
        match &self.dropout {
            Some(dropout) => dropout.forward(&xs, train),
            None => Ok(xs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn stride_two_halves_and_transpose_doubles() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let down = ConvBlock::new(
            3,
            8,
            ConvBlockConfig::new(3, 2, 1, NormKind::Instance),
            vb.pp("down"),
        )?;
        let up = UpConvBlock::double(8, 4, NormKind::Batch, vb.pp("up"))?;
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 16, 12), &device)?;
        let hidden = down.forward_t(&xs, true)?;
        assert_eq!(hidden.dims(), &[2, 8, 8, 6]);
        let out = up.forward_t(&hidden, false)?;
        assert_eq!(out.dims(), &[2, 4, 16, 12]);
        Ok(())
    }

    #[test]
    fn reflect_padded_conv7_keeps_size() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ConvBlockConfig::new(7, 1, 3, NormKind::None)
            .with_padding_kind(PaddingKind::Reflect)
            .with_activation(ActivationKind::Tanh);
        let block = ConvBlock::new(4, 3, config, vb)?;
        let xs = Tensor::randn(0f32, 1.0, (1, 4, 10, 10), &device)?;
        let out = block.forward_t(&xs, false)?;
        assert_eq!(out.dims(), &[1, 3, 10, 10]);
        let max = out.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }
}
