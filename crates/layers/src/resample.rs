//! Bilinear resampling of `(b, c, h, w)` feature maps.
//!
//! Interpolation is separable, so resizing is expressed as two matrix products
//! `R_h · x · R_wᵀ` and stays differentiable through Candle's autograd.
//! Sampling uses half-pixel centres (`align_corners = false`).

use candle_core::{Device, Error, Result, Tensor};

use crate::checks;

/// Resizes `xs` to `(height, width)`; returns `xs` untouched when the size
/// already matches.
pub fn bilinear_resize(xs: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, h, w) = checks::expect_nchw("bilinear_resize", xs)?;
    if h == 0 || w == 0 || height == 0 || width == 0 {
        return Err(Error::Msg(format!(
            "bilinear_resize: cannot resize {h}x{w} to {height}x{width}"
        )));
    }
    if h == height && w == width {
        return Ok(xs.clone());
    }
    let rows = interpolation_matrix(h, height, xs.device())?.to_dtype(xs.dtype())?;
    let cols = interpolation_matrix(w, width, xs.device())?
        .to_dtype(xs.dtype())?
        .t()?;
    rows.broadcast_matmul(&xs.contiguous()?)?
        .broadcast_matmul(&cols.contiguous()?)
}

/// Resizes `xs` to the spatial size of `reference`.
pub fn resize_like(xs: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = checks::expect_nchw("resize_like.reference", reference)?;
    bilinear_resize(xs, h, w)
}

/// Row `i` holds the weights that output sample `i` takes from the input axis.
fn interpolation_matrix(input: usize, output: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; output * input];
    let scale = input as f64 / output as f64;
    for i in 0..output {
        let src = ((i as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let lambda = (src - i0 as f64) as f32;
        weights[i * input + i0] += 1.0 - lambda;
        weights[i * input + i1] += lambda;
    }
    Tensor::from_vec(weights, (output, input), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn constant_map_stays_constant() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::full(0.75f32, (2, 3, 4, 6), &device)?;
        let up = bilinear_resize(&xs, 8, 5)?;
        assert_eq!(up.dims(), &[2, 3, 8, 5]);
        let err = (up - 0.75)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(err < 1e-6);
        Ok(())
    }

    #[test]
    fn upsampling_matches_half_pixel_reference() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::from_slice(&[0f32, 1.0], (1, 1, 1, 2), &device)?;
        let up = bilinear_resize(&xs, 1, 4)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = [0.0f32, 0.25, 0.75, 1.0];
        for (a, b) in up.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{up:?}");
        }
        Ok(())
    }

    #[test]
    fn empty_axes_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let empty = Tensor::zeros((1, 2, 0, 4), DType::F32, &device)?;
        assert!(bilinear_resize(&empty, 4, 4).is_err());
        let xs = Tensor::ones((1, 2, 4, 4), DType::F32, &device)?;
        assert!(bilinear_resize(&xs, 0, 4).is_err());
        Ok(())
    }

    #[test]
    fn same_size_is_identity() -> Result<()> {
        let xs = Tensor::randn(0f32, 1.0, (1, 2, 3, 3), &Device::Cpu)?;
        let out = resize_like(&xs, &Tensor::zeros((4, 1, 3, 3), DType::F32, &Device::Cpu)?)?;
        let diff = (out - &xs)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
