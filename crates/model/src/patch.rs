//! Local patch extraction around joint coordinates.
//!
//! Coordinates are `(batch, n_joints, 2)` tensors holding `(x, y)` pixel
//! positions; negative values mark joints that were not detected.

use candle_core::{DType, Error, Result, Tensor};
use layers::checks;

/// Host copy of a coordinate tensor, `[sample][joint] -> (x, y)`.
pub fn coords_to_host(coords: &Tensor) -> Result<Vec<Vec<[f32; 2]>>> {
    match coords.dims() {
        [_, _, 2] => {}
        dims => {
            return Err(Error::Msg(format!(
                "joint coordinates must be (batch, joints, 2), got {dims:?}"
            )))
        }
    }
    let raw = coords.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    Ok(raw
        .into_iter()
        .map(|joints| joints.into_iter().map(|xy| [xy[0], xy[1]]).collect())
        .collect())
}

/// Crops a `patch_size` square centred on `(x, y)` from a `(c, h, w)` image.
///
/// Parts of the window outside the image are zero-padded. A negative
/// coordinate (after truncation to integer pixels) yields an all-zero patch.
pub fn crop_patch(image: &Tensor, x: f32, y: f32, patch_size: usize) -> Result<Tensor> {
    let (c, h, w) = image.dims3()?;
    let (x, y) = (x as i64, y as i64);
    let zero = || Tensor::zeros((c, patch_size, patch_size), image.dtype(), image.device());
    if x < 0 || y < 0 {
        return zero();
    }
    let half = (patch_size / 2) as i64;
    let size = patch_size as i64;
    let (left, top) = (x - half, y - half);
    let (right, bottom) = (left + size, top + size);

    let (crop_l, crop_r) = (left.max(0), right.min(w as i64));
    let (crop_t, crop_b) = (top.max(0), bottom.min(h as i64));
    if crop_l >= crop_r || crop_t >= crop_b {
        return zero();
    }

    let patch = image
        .narrow(1, crop_t as usize, (crop_b - crop_t) as usize)?
        .narrow(2, crop_l as usize, (crop_r - crop_l) as usize)?;
    patch
        .pad_with_zeros(1, (crop_t - top) as usize, (bottom - crop_b) as usize)?
        .pad_with_zeros(2, (crop_l - left) as usize, (right - crop_r) as usize)
}

/// For every joint in `indices`, stacks the per-sample patches into a
/// `(batch, c, patch_size, patch_size)` tensor.
pub fn extract_patches(
    images: &Tensor,
    coords: &Tensor,
    patch_size: usize,
    indices: &[usize],
) -> Result<Vec<Tensor>> {
    let (b, _, _, _) = checks::expect_nchw("extract_patches", images)?;
    let host = coords_to_host(coords)?;
    if host.len() != b {
        return Err(Error::Msg(format!(
            "extract_patches: {} coordinate rows for a batch of {b}",
            host.len()
        )));
    }
    indices
        .iter()
        .map(|&joint| {
            let patches = host
                .iter()
                .enumerate()
                .map(|(i, joints)| {
                    let [x, y] = joints.get(joint).copied().ok_or_else(|| {
                        Error::Msg(format!("joint index {joint} out of range"))
                    })?;
                    crop_patch(&images.get(i)?, x, y, patch_size)
                })
                .collect::<Result<Vec<_>>>()?;
            Tensor::stack(&patches, 0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn interior_patch_is_exact_crop() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::arange(0f32, 64.0, &device)?.reshape((1, 8, 8))?;
        let patch = crop_patch(&image, 4.0, 4.0, 4)?;
        assert_eq!(patch.dims(), &[1, 4, 4]);
        let first_row = patch.get(0)?.get(0)?.to_vec1::<f32>()?;
        assert_eq!(first_row, vec![18.0, 19.0, 20.0, 21.0]);
        Ok(())
    }

    #[test]
    fn fully_outside_window_is_zero() -> Result<()> {
        let image = Tensor::ones((3, 8, 8), DType::F32, &Device::Cpu)?;
        let patch = crop_patch(&image, 40.0, 2.0, 4)?;
        assert_eq!(patch.dims(), &[3, 4, 4]);
        assert_eq!(patch.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }
}
