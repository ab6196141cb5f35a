//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape assertions that can be wired into
//! constructors or forward paths. They return `candle_core::Result` so call
//! sites can propagate errors without panicking.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims().to_vec();
    if actual.as_slice() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, channels, height, width)` convention and returns the
/// four dimensions.
pub fn expect_nchw(name: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize)> {
    match tensor.dims() {
        [b, c, h, w] => Ok((*b, *c, *h, *w)),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, channels, height, width) layout, got {:?}",
            dims
        ))),
    }
}

/// Validates a 4D tensor with a known channel count.
pub fn expect_channels(name: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    let (_, actual, _, _) = expect_nchw(name, tensor)?;
    if actual == channels {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected {channels} channels, got {actual}"
        )))
    }
}

/// Checks that two tensors share the same shape, as required by element-wise
/// losses and metrics.
pub fn expect_same_shape(name: &str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    if lhs.dims() == rhs.dims() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: shape mismatch {:?} vs. {:?}",
            lhs.dims(),
            rhs.dims()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn nchw_rejects_rank_three() -> Result<()> {
        let t = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        assert!(expect_nchw("probe", &t).is_err());
        let t = t.unsqueeze(0)?;
        assert_eq!(expect_nchw("probe", &t)?, (1, 2, 3, 4));
        Ok(())
    }
}
