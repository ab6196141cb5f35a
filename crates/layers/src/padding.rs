//! Spatial padding over the last two axes of `(b, c, h, w)` tensors.

use std::str::FromStr;

use candle_core::{Error, Result, Tensor};

use crate::LayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingKind {
    #[default]
    Reflect,
    Replicate,
    Zero,
}

impl FromStr for PaddingKind {
    type Err = LayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reflect" => Ok(PaddingKind::Reflect),
            "replicate" => Ok(PaddingKind::Replicate),
            "zero" => Ok(PaddingKind::Zero),
            other => Err(LayerError::UnknownPadding(other.to_string())),
        }
    }
}

impl PaddingKind {
    /// Pads height and width by `pad` on every side.
    pub fn pad2d(self, xs: &Tensor, pad: usize) -> Result<Tensor> {
        if pad == 0 {
            return Ok(xs.clone());
        }
        match self {
            PaddingKind::Reflect => reflect_pad(&reflect_pad(xs, 2, pad)?, 3, pad),
            PaddingKind::Replicate => xs.pad_with_same(2, pad, pad)?.pad_with_same(3, pad, pad),
            PaddingKind::Zero => xs.pad_with_zeros(2, pad, pad)?.pad_with_zeros(3, pad, pad),
        }
    }

    /// Padding that the convolution itself must apply when the explicit pad
    /// step is skipped (zero padding is folded into the conv).
    pub fn conv_padding(self, pad: usize) -> usize {
        match self {
            PaddingKind::Zero => pad,
            PaddingKind::Reflect | PaddingKind::Replicate => 0,
        }
    }

    /// Applies the explicit padding step, a no-op for [`PaddingKind::Zero`].
    pub fn pre_pad(self, xs: &Tensor, pad: usize) -> Result<Tensor> {
        match self {
            PaddingKind::Zero => Ok(xs.clone()),
            kind => kind.pad2d(xs, pad),
        }
    }
}

/// Mirror padding that excludes the edge sample, matching `ReflectionPad2d`.
fn reflect_pad(xs: &Tensor, dim: usize, pad: usize) -> Result<Tensor> {
    let size = xs.dim(dim)?;
    if pad >= size {
        return Err(Error::Msg(format!(
            "reflection pad {pad} must be smaller than dimension {dim} of size {size}"
        )));
    }
    let mut indices: Vec<u32> = Vec::with_capacity(size + 2 * pad);
    indices.extend((1..=pad).rev().map(|i| i as u32));
    indices.extend((0..size).map(|i| i as u32));
    indices.extend((0..pad).map(|i| (size - 2 - i) as u32));
    let index = Tensor::from_vec(indices, (size + 2 * pad,), xs.device())?;
    xs.index_select(&index, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn reflect_mirrors_without_edge() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::arange(0f32, 4.0, &device)?.reshape((1, 1, 1, 4))?;
        let xs = xs.broadcast_as((1, 1, 3, 4))?.contiguous()?;
        let out = PaddingKind::Reflect.pad2d(&xs, 2)?;
        assert_eq!(out.dims(), &[1, 1, 7, 8]);
        let row = out.get(0)?.get(0)?.get(0)?.to_vec1::<f32>()?;
        assert_eq!(row, vec![2.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn replicate_and_zero_extend_borders() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::arange(1f32, 4.0, &device)?.reshape((1, 1, 1, 3))?;
        let rep = PaddingKind::Replicate.pad2d(&xs, 1)?;
        assert_eq!(
            rep.get(0)?.get(0)?.get(1)?.to_vec1::<f32>()?,
            vec![1.0, 1.0, 2.0, 3.0, 3.0]
        );
        let zero = PaddingKind::Zero.pad2d(&xs, 1)?;
        assert_eq!(
            zero.get(0)?.get(0)?.get(1)?.to_vec1::<f32>()?,
            vec![0.0, 1.0, 2.0, 3.0, 0.0]
        );
        assert_eq!(zero.get(0)?.get(0)?.get(0)?.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn reflect_rejects_oversized_pad() -> Result<()> {
        let xs = Tensor::zeros((1, 1, 2, 2), candle_core::DType::F32, &Device::Cpu)?;
        assert!(PaddingKind::Reflect.pad2d(&xs, 3).is_err());
        Ok(())
    }
}
