//! Spatial normalisation layers.
//!
//! `batch` wraps Candle's affine batch norm (running statistics are used in
//! eval mode), `instance` normalises each sample and channel over `(h, w)`
//! without affine parameters, and `none` is the identity.

use std::str::FromStr;

use candle_core::{Result, Tensor, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT, VarBuilder};

use crate::LayerError;

/// Numeric stabiliser shared by both normalisation variants.
pub const NORM_EPS: f64 = 1e-5;

/// Available normalisation strategies for convolutional stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormKind {
    Batch,
    #[default]
    Instance,
    None,
}

impl NormKind {
    /// Convolutions followed by a non-affine instance norm keep their bias;
    /// batch norm carries its own shift.
    pub fn use_bias(self) -> bool {
        matches!(self, NormKind::Instance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormKind::Batch => "batch",
            NormKind::Instance => "instance",
            NormKind::None => "none",
        }
    }
}

impl FromStr for NormKind {
    type Err = LayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "batch" => Ok(NormKind::Batch),
            "instance" => Ok(NormKind::Instance),
            "none" => Ok(NormKind::None),
            other => Err(LayerError::UnknownNorm(other.to_string())),
        }
    }
}

/// A normalisation layer over `(batch, channels, height, width)` inputs.
#[derive(Debug, Clone)]
pub enum Norm2d {
    Batch(BatchNorm),
    Instance,
    Identity,
}

impl Norm2d {
    pub fn new(kind: NormKind, channels: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            NormKind::Batch => {
                let config = BatchNormConfig {
                    eps: NORM_EPS,
                    ..Default::default()
                };
                Ok(Norm2d::Batch(batch_norm(channels, config, vb)?))
            }
            NormKind::Instance => Ok(Norm2d::Instance),
            NormKind::None => Ok(Norm2d::Identity),
        }
    }
}

impl ModuleT for Norm2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Norm2d::Batch(bn) => bn.forward_t(xs, train),
            Norm2d::Instance => instance_norm(xs, NORM_EPS),
            Norm2d::Identity => Ok(xs.clone()),
        }
    }
}

/// Normalises every `(sample, channel)` plane to zero mean and unit variance.
pub fn instance_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let (b, c, h, w) = crate::checks::expect_nchw("instance_norm", xs)?;
    let flat = xs.reshape((b, c, h * w))?;
    let mean = flat.mean_keepdim(D::Minus1)?;
    let centered = flat.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = centered.broadcast_div(&(var + eps)?.sqrt()?)?;
    normed.reshape((b, c, h, w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn parses_known_kinds_and_rejects_others() {
        assert_eq!("batch".parse::<NormKind>(), Ok(NormKind::Batch));
        assert_eq!("instance".parse::<NormKind>(), Ok(NormKind::Instance));
        assert_eq!("none".parse::<NormKind>(), Ok(NormKind::None));
        assert!("group".parse::<NormKind>().is_err());
        assert!(NormKind::Instance.use_bias());
        assert!(!NormKind::Batch.use_bias());
    }

    #[test]
    fn instance_norm_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::randn(3f32, 2.0, (2, 4, 8, 8), &device)?;
        let out = instance_norm(&xs, 1e-5)?.reshape((2, 4, 64))?;
        let mean = out.mean(D::Minus1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        let var = out.sqr()?.mean(D::Minus1)?;
        let var_err = (var - 1.0)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(mean < 1e-4);
        assert!(var_err < 1e-3);
        Ok(())
    }

    #[test]
    fn batch_norm_registers_parameters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = Norm2d::new(NormKind::Batch, 6, vb.pp("bn"))?;
        let xs = Tensor::randn(0f32, 1.0, (2, 6, 4, 4), &device)?;
        let out = norm.forward_t(&xs, true)?;
        assert_eq!(out.dims(), &[2, 6, 4, 4]);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "bn.weight"));
        assert!(names.iter().any(|n| n == "bn.running_mean"));
        Ok(())
    }
}
