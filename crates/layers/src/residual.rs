//! Residual blocks for generator bottlenecks.
//!
//! [`ResnetBlock`] computes `x + F(x)` with
//! `F = pad, conv3, norm, act, [dropout 0.5], pad, conv3, norm`.
//! [`ConditionedResnetBlock`] sees a condition `c` alongside `x`: the first
//! conv reads `cat(x, c)`, the residual is added to `x` only, and `c` can be
//! re-attached to the output so the next conditioned block sees it again.

use candle_core::{Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};

use crate::{checks, ActivationKind, ConvBlock, ConvBlockConfig, NormKind, PaddingKind};

/// Dropout probability used inside residual branches when enabled.
pub const RESIDUAL_DROPOUT: f32 = 0.5;

/// Shared wiring for residual blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResnetBlockConfig {
    pub padding: PaddingKind,
    pub norm: NormKind,
    pub activation: ActivationKind,
    pub use_dropout: bool,
}

impl ResnetBlockConfig {
    pub fn new(norm: NormKind) -> Self {
        Self {
            padding: PaddingKind::Reflect,
            norm,
            activation: ActivationKind::Relu,
            use_dropout: false,
        }
    }

    pub fn with_dropout(mut self, use_dropout: bool) -> Self {
        self.use_dropout = use_dropout;
        self
    }

    pub fn with_padding(mut self, padding: PaddingKind) -> Self {
        self.padding = padding;
        self
    }

    fn branch(
        &self,
        in_c: usize,
        out_c: usize,
        vb: VarBuilder,
    ) -> Result<(ConvBlock, ConvBlock)> {
        let dropout = self.use_dropout.then_some(RESIDUAL_DROPOUT);
        let first = ConvBlockConfig::new(3, 1, 1, self.norm)
            .with_padding_kind(self.padding)
            .with_activation(self.activation)
            .with_dropout(dropout);
        let second = ConvBlockConfig::new(3, 1, 1, self.norm)
            .with_padding_kind(self.padding)
            .with_activation(ActivationKind::Identity);
        Ok((
            ConvBlock::new(in_c, out_c, first, vb.pp("conv1"))?,
            ConvBlock::new(out_c, out_c, second, vb.pp("conv2"))?,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ResnetBlock {
    dim: usize,
    conv1: ConvBlock,
    conv2: ConvBlock,
}

impl ResnetBlock {
    pub fn new(dim: usize, config: ResnetBlockConfig, vb: VarBuilder) -> Result<Self> {
        let (conv1, conv2) = config.branch(dim, dim, vb)?;
        Ok(Self { dim, conv1, conv2 })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl ModuleT for ResnetBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("resnet_block", xs, self.dim)?;
        let branch = self.conv1.forward_t(xs, train)?;
        let branch = self.conv2.forward_t(&branch, train)?;
        xs + branch
    }
}

#[derive(Debug, Clone)]
pub struct ConditionedResnetBlock {
    x_dim: usize,
    c_dim: usize,
    output_c: bool,
    conv1: ConvBlock,
    conv2: ConvBlock,
}

impl ConditionedResnetBlock {
    /// Input is `cat(x, c)` with `x_dim + c_dim` channels; output has
    /// `x_dim + c_dim` channels when `output_c` is set, `x_dim` otherwise.
    pub fn new(
        x_dim: usize,
        c_dim: usize,
        output_c: bool,
        config: ResnetBlockConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (conv1, conv2) = config.branch(x_dim + c_dim, x_dim, vb)?;
        Ok(Self {
            x_dim,
            c_dim,
            output_c,
            conv1,
            conv2,
        })
    }

    pub fn output_dim(&self) -> usize {
        if self.output_c {
            self.x_dim + self.c_dim
        } else {
            self.x_dim
        }
    }

    /// Convenience entry point taking `x` and `c` separately.
    pub fn forward_pair(&self, x: &Tensor, c: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(&Tensor::cat(&[x, c], 1)?, train)
    }
}

impl ModuleT for ConditionedResnetBlock {
    fn forward_t(&self, x_and_c: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("conditioned_resnet_block", x_and_c, self.x_dim + self.c_dim)?;
        let x = x_and_c.narrow(1, 0, self.x_dim)?;
        let branch = self.conv1.forward_t(x_and_c, train)?;
        let branch = self.conv2.forward_t(&branch, train)?;
        let out = (x + branch)?;
        if self.output_c {
            let c = x_and_c.narrow(1, self.x_dim, self.c_dim)?;
            Tensor::cat(&[&out, &c], 1)
        } else {
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn resnet_block_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ResnetBlockConfig::new(NormKind::Instance).with_dropout(true);
        let block = ResnetBlock::new(8, config, vb)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 6, 6), &device)?;
        assert_eq!(block.forward_t(&xs, true)?.dims(), &[2, 8, 6, 6]);
        Ok(())
    }

    #[test]
    fn zeroed_branch_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ResnetBlockConfig::new(NormKind::None).with_padding(PaddingKind::Zero);
        let block = ResnetBlock::new(4, config, vb)?;
        for var in varmap.all_vars() {
            var.set(&var.zeros_like()?)?;
        }
        let xs = Tensor::randn(0f32, 1.0, (1, 4, 5, 5), &device)?;
        let diff = (block.forward_t(&xs, false)? - &xs)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn conditioned_block_optionally_keeps_condition() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ResnetBlockConfig::new(NormKind::Batch);
        let keep = ConditionedResnetBlock::new(8, 3, true, config, vb.pp("keep"))?;
        let drop = ConditionedResnetBlock::new(8, 3, false, config, vb.pp("drop"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 4, 4), &device)?;
        let c = Tensor::ones((2, 3, 4, 4), DType::F32, &device)?;
        let kept = keep.forward_pair(&x, &c, true)?;
        assert_eq!(kept.dims(), &[2, 11, 4, 4]);
        let tail = kept.narrow(1, 8, 3)?.sum_all()?.to_vec0::<f32>()?;
        assert_eq!(tail, 96.0);
        assert_eq!(drop.forward_pair(&x, &c, true)?.dims(), &[2, 8, 4, 4]);
        Ok(())
    }
}
