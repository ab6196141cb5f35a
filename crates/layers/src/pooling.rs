//! Spatial pooling from `(b, c, h, w)` maps to `(b, c)` vectors.

use candle_core::{Result, Tensor, D};

use crate::checks;

/// Lower bound on `1 - p` before taking the log, so a location with `p = 1`
/// saturates the pooled probability instead of producing `-inf` gradients.
const COMPLEMENT_FLOOR: f64 = 1e-12;

/// Noisy-OR pooling: `1 - prod_ij (1 - p_ij)` per channel.
///
/// The product is accumulated as a sum of logs. Inputs are expected in
/// `[0, 1]`; the output is then in `[0, 1]` and non-decreasing in every input
/// location.
pub fn noisy_or(prob_map: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = checks::expect_nchw("noisy_or", prob_map)?;
    let complement = prob_map
        .reshape((b, c, h * w))?
        .affine(-1.0, 1.0)?
        .clamp(COMPLEMENT_FLOOR, 1.0)?;
    let all_miss = complement.log()?.sum(D::Minus1)?.exp()?;
    all_miss.affine(-1.0, 1.0)
}

pub fn global_max_pool(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = checks::expect_nchw("global_max_pool", xs)?;
    xs.reshape((b, c, h * w))?.max(D::Minus1)
}

pub fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = checks::expect_nchw("global_avg_pool", xs)?;
    xs.reshape((b, c, h * w))?.mean(D::Minus1)
}

/// Divides each feature vector by its L2 norm over the channel axis.
pub fn l2_normalize_channels(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12, f64::MAX)?;
    xs.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn noisy_or_matches_product_formula() -> Result<()> {
        let device = Device::Cpu;
        let probs = [0.1f32, 0.5, 0.0, 0.2];
        let map = Tensor::from_slice(&probs, (1, 1, 2, 2), &device)?;
        let pooled = noisy_or(&map)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = 1.0 - probs.iter().map(|p| 1.0 - p).product::<f32>();
        assert!((pooled[0] - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn noisy_or_saturates_without_nan() -> Result<()> {
        let device = Device::Cpu;
        let map = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 0.0], (1, 1, 2, 2), &device)?;
        let pooled = noisy_or(&map)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(pooled[0].is_finite());
        assert!((pooled[0] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn global_pools_reduce_spatial_axes() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::arange(0f32, 8.0, &device)?.reshape((1, 2, 2, 2))?;
        assert_eq!(global_max_pool(&xs)?.to_vec2::<f32>()?, vec![vec![3.0, 7.0]]);
        assert_eq!(global_avg_pool(&xs)?.to_vec2::<f32>()?, vec![vec![1.5, 5.5]]);
        Ok(())
    }
}
